//! Node and session registry, and the engine that drives the transport
//!
//! [TransportEngine] is single threaded and has to be driven by whoever owns the bus, by
//! calling [TransportEngine::on_frame] for every observed frame and [TransportEngine::on_tick]
//! periodically. [DiagTransport] wraps an engine so that one thread can drive it while others
//! block waiting for their transfers to complete.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use log::{debug, error, warn};

use crate::{
    TransportError, TransportResult,
    channel::{CanBus, CanFrame, ChannelResult, Direction, Timestamp},
    codec::{self, max_single_frame_payload},
    config::Target,
    event_bus::{Disposition, Event, EventBus, ListenerId},
    receiver::Receiver,
    session::{AddressingMode, Completion, ErrorFlags, NodeHandle, Session, SessionState, TransferId},
    transmitter::Transmitter,
};

/// A fully reassembled inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTransfer {
    /// Transfer ID the payload was received under
    pub id: TransferId,
    /// Whether the payload arrived physically or functionally addressed
    pub addressing: AddressingMode,
    /// Payload
    pub payload: Vec<u8>,
}

/// What a node's receiver hands out: a payload, or the ID and reason of a failed reception
type InboundItem = Result<InboundTransfer, (TransferId, ErrorFlags)>;
type InboundQueue = Arc<Mutex<mpsc::Receiver<InboundItem>>>;

fn inbound_result(item: InboundItem) -> TransportResult<InboundTransfer> {
    item.map_err(|(id, errors)| TransportError::InboundFailed { id, errors })
}

struct Node {
    target: Target,
    counter: u16,
    receiver: ListenerId,
    transmitters: Vec<ListenerId>,
    sending: Option<TransferId>,
    inbound_tx: mpsc::Sender<InboundItem>,
    inbound_rx: InboundQueue,
}

struct SessionEntry {
    session: Session,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: Option<mpsc::Receiver<Completion>>,
}

/// State shared by every listener of the engine's event bus
pub struct EngineContext {
    bus: Box<dyn CanBus>,
    now: Timestamp,
    nodes: HashMap<NodeHandle, Node>,
    sessions: HashMap<TransferId, SessionEntry>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("now", &self.now)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EngineContext {
    /// Time of the most recent event
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Current configuration of a node
    pub fn target(&self, node: NodeHandle) -> Option<Target> {
        self.nodes.get(&node).map(|n| n.target)
    }

    /// Session of a transfer
    pub fn session(&self, id: TransferId) -> Option<&Session> {
        self.sessions.get(&id).map(|e| &e.session)
    }

    pub(crate) fn session_mut(&mut self, id: TransferId) -> Option<&mut Session> {
        self.sessions.get_mut(&id).map(|e| &mut e.session)
    }

    /// Hands a frame to the bus
    pub(crate) fn send(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        debug!("Tx 0x{:04X} {:02X?}", frame.id(), frame.data());
        self.bus.send_frame(frame).inspect_err(|e| {
            error!("Bus rejected frame 0x{:04X}: {e}", frame.id());
        })
    }

    fn allocate_id(&mut self, node: NodeHandle) -> Option<TransferId> {
        let n = self.nodes.get_mut(&node)?;
        for _ in 0..=u16::MAX {
            n.counter = n.counter.wrapping_add(1);
            let id = TransferId::new(node, n.counter);
            if !self.sessions.contains_key(&id) {
                return Some(id);
            }
        }
        error!("Node {node} has no free transfer IDs");
        None
    }

    fn insert_session(&mut self, session: Session) {
        let (completion_tx, completion_rx) = mpsc::channel();
        self.sessions.insert(
            session.id(),
            SessionEntry {
                session,
                completion_tx,
                completion_rx: Some(completion_rx),
            },
        );
    }

    /// Creates the session of an inbound transfer
    pub(crate) fn open_inbound(
        &mut self,
        node: NodeHandle,
        addressing: AddressingMode,
        expected_len: usize,
    ) -> Option<TransferId> {
        let id = self.allocate_id(node)?;
        self.insert_session(Session::new_inbound(id, addressing, expected_len));
        debug!("Node {node} receiving {expected_len} bytes as transfer {id}");
        Some(id)
    }

    /// Puts a session into its terminal state and signals whoever waits on it.
    ///
    /// Inbound sessions leave the registry. Their payload, or their failure, goes to the node's
    /// inbound queue.
    pub(crate) fn conclude(&mut self, id: TransferId, outcome: Result<(), ErrorFlags>) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        if entry.session.state().is_terminal() {
            return;
        }
        match outcome {
            Ok(()) => entry.session.complete(),
            Err(flags) => {
                warn!("Transfer {id} failed: {flags:?}");
                entry.session.fail(flags);
            }
        }
        let Some(completion) = entry.session.completion() else {
            return;
        };
        debug!("Transfer {id} finished as {}", entry.session.state());
        if entry.session.direction() == Direction::Tx {
            // Nobody may be waiting yet, the completion stays queued for them
            let _ = entry.completion_tx.send(completion);
            if let Some(node) = self.nodes.get_mut(&id.node()) {
                if node.sending == Some(id) {
                    node.sending = None;
                }
            }
            return;
        }
        let Some(entry) = self.sessions.remove(&id) else {
            return;
        };
        let item = match completion {
            Completion::Received(payload) => Ok(InboundTransfer {
                id,
                addressing: entry.session.addressing(),
                payload,
            }),
            Completion::Failed(flags) => Err((id, flags)),
            Completion::SendComplete => return,
        };
        if let Some(node) = self.nodes.get(&id.node()) {
            // The receiving half lives in the node, so this only fails once it is removed
            let _ = node.inbound_tx.send(item);
        }
    }
}

/// The transport engine
pub struct TransportEngine {
    listeners: EventBus<EngineContext>,
    ctx: EngineContext,
}

impl std::fmt::Debug for TransportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEngine")
            .field("listeners", &self.listeners)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl TransportEngine {
    /// Creates an engine transmitting on `bus`
    pub fn new<B: CanBus + 'static>(bus: B) -> Self {
        Self::with_boxed_bus(Box::new(bus))
    }

    /// Creates an engine transmitting on an already boxed bus
    pub fn with_boxed_bus(bus: Box<dyn CanBus>) -> Self {
        Self {
            listeners: EventBus::new(),
            ctx: EngineContext {
                bus,
                now: Duration::ZERO,
                nodes: HashMap::new(),
                sessions: HashMap::new(),
            },
        }
    }

    /// Time of the most recent event
    pub fn now(&self) -> Timestamp {
        self.ctx.now
    }

    /// Registers a node and starts listening for transfers addressed to it
    pub fn add_node(&mut self, node: NodeHandle, target: Target) -> TransportResult<()> {
        if self.ctx.nodes.contains_key(&node) {
            return Err(TransportError::NodeExists(node));
        }
        target.validate()?;
        let receiver = self.listeners.subscribe(Box::new(Receiver::new(node)));
        let (inbound_tx, inbound_rx) = mpsc::channel();
        self.ctx.nodes.insert(
            node,
            Node {
                target,
                counter: 0,
                receiver,
                transmitters: Vec::new(),
                sending: None,
                inbound_tx,
                inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            },
        );
        debug!("Added node {node} as {} on 0x{:04X}", target.role, target.physical_address);
        Ok(())
    }

    /// Removes a node. Its in flight transfers are dropped, anyone waiting on them sees
    /// [TransportError::TransferAborted]
    pub fn remove_node(&mut self, node: NodeHandle) -> TransportResult<()> {
        let n = self
            .ctx
            .nodes
            .remove(&node)
            .ok_or(TransportError::InvalidNode(node))?;
        self.listeners.unsubscribe(n.receiver);
        for id in n.transmitters {
            self.listeners.unsubscribe(id);
        }
        self.ctx.sessions.retain(|id, _| id.node() != node);
        debug!("Removed node {node}");
        Ok(())
    }

    /// Replaces the addressing triple of a node.
    /// Transfers already in flight keep using the addresses they started with
    pub fn configure_target(
        &mut self,
        node: NodeHandle,
        physical: u32,
        functional: u32,
        response: u32,
    ) -> TransportResult<()> {
        let target = self.target(node)?.with_addresses(physical, functional, response);
        self.set_target(node, target)
    }

    /// Replaces the whole configuration of a node
    pub fn set_target(&mut self, node: NodeHandle, target: Target) -> TransportResult<()> {
        target.validate()?;
        let n = self
            .ctx
            .nodes
            .get_mut(&node)
            .ok_or(TransportError::InvalidNode(node))?;
        n.target = target;
        Ok(())
    }

    /// Configuration of a node
    pub fn target(&self, node: NodeHandle) -> TransportResult<Target> {
        self.ctx.target(node).ok_or(TransportError::InvalidNode(node))
    }

    /// Starts a physically addressed transfer of `payload`.
    ///
    /// A node sends one transfer at a time, until the previous one has finished this fails
    /// with [TransportError::NodeBusy]
    pub fn send_diagnostic_request(
        &mut self,
        node: NodeHandle,
        payload: &[u8],
    ) -> TransportResult<TransferId> {
        self.start_send(node, payload, AddressingMode::Physical)
    }

    /// Starts a functionally addressed transfer of `payload`. Only payloads fitting a single
    /// frame can be sent this way
    pub fn send_functional_request(
        &mut self,
        node: NodeHandle,
        payload: &[u8],
    ) -> TransportResult<TransferId> {
        let target = self.target(node)?;
        let max = target
            .frame_length
            .max_data_len()
            .map(max_single_frame_payload)
            .unwrap_or(0);
        if payload.len() > max {
            return Err(TransportError::FunctionalTooLong {
                len: payload.len(),
                max,
            });
        }
        self.start_send(node, payload, AddressingMode::Functional)
    }

    fn start_send(
        &mut self,
        node: NodeHandle,
        payload: &[u8],
        addressing: AddressingMode,
    ) -> TransportResult<TransferId> {
        let target = self.target(node)?;
        codec::validate_payload(payload.len(), &target)?;
        if let Some(active) = self.ctx.nodes.get(&node).and_then(|n| n.sending) {
            return Err(TransportError::NodeBusy { node, active });
        }
        let id = self
            .ctx
            .allocate_id(node)
            .ok_or(TransportError::InvalidNode(node))?;
        self.ctx
            .insert_session(Session::new_outbound(id, addressing, payload.to_vec()));
        if let Some(n) = self.ctx.nodes.get_mut(&node) {
            n.sending = Some(id);
        }
        debug!(
            "Node {node} sending {} bytes {addressing} as transfer {id}",
            payload.len()
        );
        let mut tx = Transmitter::new(id, target);
        if tx.start(&mut self.ctx) == Disposition::Keep {
            let listener = self.listeners.subscribe(Box::new(tx));
            if let Some(n) = self.ctx.nodes.get_mut(&node) {
                n.transmitters.push(listener);
            }
        }
        Ok(id)
    }

    /// Delivers a frame observed on the bus, including echoes of the engine's own frames
    pub fn on_frame(&mut self, frame: CanFrame, timestamp: Timestamp) {
        self.ctx.now = timestamp;
        self.dispatch(Event::FrameObserved { frame, timestamp });
    }

    /// Advances the engine's clock, expiring timers
    pub fn on_tick(&mut self, timestamp: Timestamp) {
        self.ctx.now = timestamp;
        self.dispatch(Event::TimeAdvanced { timestamp });
    }

    fn dispatch(&mut self, event: Event) {
        self.listeners.dispatch(&event, &mut self.ctx);
        let listeners = &self.listeners;
        for n in self.ctx.nodes.values_mut() {
            n.transmitters.retain(|id| listeners.contains(*id));
        }
    }

    /// Current state of a transfer
    pub fn status(&self, id: TransferId) -> TransportResult<SessionState> {
        self.session(id)
            .map(|s| s.state())
            .ok_or(TransportError::UnknownTransfer(id))
    }

    /// Session of a transfer still held by the registry
    pub fn session(&self, id: TransferId) -> Option<&Session> {
        self.ctx.session(id)
    }

    /// Returns the terminal result of a transfer if it has finished, reclaiming its session
    pub fn poll_completion(&mut self, id: TransferId) -> TransportResult<Option<Completion>> {
        let entry = self
            .ctx
            .sessions
            .get(&id)
            .ok_or(TransportError::UnknownTransfer(id))?;
        match entry.session.completion() {
            Some(c) => {
                self.ctx.sessions.remove(&id);
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    /// Takes the next reassembled inbound transfer of a node, if there is one.
    /// A reception that failed is returned as [TransportError::InboundFailed], in the order it
    /// happened
    pub fn take_inbound(&mut self, node: NodeHandle) -> TransportResult<Option<InboundTransfer>> {
        let queue = self.inbound_queue(node)?;
        let rx = queue.lock().map_err(|_| TransportError::Poisoned)?;
        rx.try_recv().ok().map(inbound_result).transpose()
    }

    fn inbound_queue(&self, node: NodeHandle) -> TransportResult<InboundQueue> {
        self.ctx
            .nodes
            .get(&node)
            .map(|n| n.inbound_rx.clone())
            .ok_or(TransportError::InvalidNode(node))
    }

    fn take_completion_rx(
        &mut self,
        id: TransferId,
    ) -> TransportResult<mpsc::Receiver<Completion>> {
        let entry = self
            .ctx
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::UnknownTransfer(id))?;
        entry
            .completion_rx
            .take()
            .ok_or(TransportError::AlreadyWaiting(id))
    }

    fn restore_completion_rx(&mut self, id: TransferId, rx: mpsc::Receiver<Completion>) {
        if let Some(entry) = self.ctx.sessions.get_mut(&id) {
            entry.completion_rx = Some(rx);
        }
    }
}

/// Thread safe handle to a [TransportEngine]
#[derive(Debug, Clone)]
pub struct DiagTransport {
    engine: Arc<Mutex<TransportEngine>>,
}

impl DiagTransport {
    /// Creates a transport transmitting on `bus`
    pub fn new<B: CanBus + 'static>(bus: B) -> Self {
        Self::from_engine(TransportEngine::new(bus))
    }

    /// Wraps an existing engine
    pub fn from_engine(engine: TransportEngine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// Runs `f` with exclusive access to the engine
    pub fn with_engine<T>(
        &self,
        f: impl FnOnce(&mut TransportEngine) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut engine = self.engine.lock().map_err(|_| TransportError::Poisoned)?;
        f(&mut engine)
    }

    /// See [TransportEngine::add_node]
    pub fn add_node(&self, node: NodeHandle, target: Target) -> TransportResult<()> {
        self.with_engine(|e| e.add_node(node, target))
    }

    /// See [TransportEngine::remove_node]
    pub fn remove_node(&self, node: NodeHandle) -> TransportResult<()> {
        self.with_engine(|e| e.remove_node(node))
    }

    /// See [TransportEngine::configure_target]
    pub fn configure_target(
        &self,
        node: NodeHandle,
        physical: u32,
        functional: u32,
        response: u32,
    ) -> TransportResult<()> {
        self.with_engine(|e| e.configure_target(node, physical, functional, response))
    }

    /// See [TransportEngine::send_diagnostic_request]
    pub fn send_diagnostic_request(
        &self,
        node: NodeHandle,
        payload: &[u8],
    ) -> TransportResult<TransferId> {
        self.with_engine(|e| e.send_diagnostic_request(node, payload))
    }

    /// See [TransportEngine::send_functional_request]
    pub fn send_functional_request(
        &self,
        node: NodeHandle,
        payload: &[u8],
    ) -> TransportResult<TransferId> {
        self.with_engine(|e| e.send_functional_request(node, payload))
    }

    /// See [TransportEngine::on_frame]
    pub fn on_frame(&self, frame: CanFrame, timestamp: Timestamp) -> TransportResult<()> {
        self.with_engine(|e| {
            e.on_frame(frame, timestamp);
            Ok(())
        })
    }

    /// See [TransportEngine::on_tick]
    pub fn on_tick(&self, timestamp: Timestamp) -> TransportResult<()> {
        self.with_engine(|e| {
            e.on_tick(timestamp);
            Ok(())
        })
    }

    /// See [TransportEngine::status]
    pub fn status(&self, id: TransferId) -> TransportResult<SessionState> {
        self.with_engine(|e| e.status(id))
    }

    /// Blocks until a transfer reaches its terminal state, or `timeout` passes.
    ///
    /// The engine is not locked while waiting, so another thread can keep driving it.
    /// Once the result has been returned, the transfer's session is reclaimed.
    pub fn wait_for_completion(
        &self,
        id: TransferId,
        timeout: Duration,
    ) -> TransportResult<Completion> {
        let rx = self.with_engine(|e| e.take_completion_rx(id))?;
        match rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.with_engine(|e| {
                    e.ctx.sessions.remove(&id);
                    Ok(())
                })?;
                Ok(completion)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.with_engine(|e| {
                    e.restore_completion_rx(id, rx);
                    Ok(())
                })?;
                Err(TransportError::WaitTimeout(id))
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::TransferAborted(id)),
        }
    }

    /// Blocks until the node has reassembled an inbound transfer, or `timeout` passes.
    /// Failed receptions are returned as [TransportError::InboundFailed]
    pub fn wait_for_inbound(
        &self,
        node: NodeHandle,
        timeout: Duration,
    ) -> TransportResult<InboundTransfer> {
        let queue = self.with_engine(|e| e.inbound_queue(node))?;
        let rx = queue.lock().map_err(|_| TransportError::Poisoned)?;
        match rx.recv_timeout(timeout) {
            Ok(item) => inbound_result(item),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::InboundTimeout(node)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::InvalidNode(node)),
        }
    }
}
