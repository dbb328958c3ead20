//! Simulated CAN bus for testing transport nodes without hardware
//!
//! Every node attached to a [Simulation] gets its own [SimulationPort] to transmit on. Frames
//! are queued and only delivered when the simulation is stepped, so tests are deterministic:
//! the sender sees its own frame as an echo ([Direction::Tx]), every other node sees it as
//! [Direction::Rx].

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, warn};

use crate::{
    channel::{CanBus, CanFrame, ChannelError, ChannelResult, Direction, Timestamp},
    registry::{DiagTransport, TransportEngine},
};

/// Port number frames injected with [Simulation::inject] appear to come from
pub const EXTERNAL_PORT: usize = usize::MAX;

/// Bound on frames delivered by one call to [Simulation::deliver], so two misbehaving nodes
/// cannot ping-pong forever
const MAX_DELIVERIES: usize = 100_000;

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<(usize, CanFrame)>,
    history: Vec<(Timestamp, CanFrame)>,
    echo_disabled: Vec<usize>,
    muted: Vec<usize>,
    offline: Vec<usize>,
}

type SharedBus = Arc<Mutex<BusState>>;

fn lock(bus: &SharedBus) -> MutexGuard<'_, BusState> {
    bus.lock().unwrap_or_else(|e| e.into_inner())
}

/// One node's connection to the simulated bus
#[derive(Debug, Clone)]
pub struct SimulationPort {
    port: usize,
    bus: SharedBus,
}

impl SimulationPort {
    /// Port number
    pub fn port(&self) -> usize {
        self.port
    }
}

impl CanBus for SimulationPort {
    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        let mut bus = self
            .bus
            .lock()
            .map_err(|_| ChannelError::Other("simulation bus poisoned".into()))?;
        if bus.offline.contains(&self.port) {
            return Err(ChannelError::InterfaceNotOpen);
        }
        bus.queue.push_back((self.port, *frame));
        Ok(())
    }
}

/// Anything that can sit on the simulated bus
pub trait SimulatedNode {
    /// A frame was seen on the bus
    fn observe(&mut self, frame: CanFrame, timestamp: Timestamp);
    /// Time moved on
    fn tick(&mut self, timestamp: Timestamp);
}

impl SimulatedNode for TransportEngine {
    fn observe(&mut self, frame: CanFrame, timestamp: Timestamp) {
        self.on_frame(frame, timestamp)
    }

    fn tick(&mut self, timestamp: Timestamp) {
        self.on_tick(timestamp)
    }
}

impl SimulatedNode for DiagTransport {
    fn observe(&mut self, frame: CanFrame, timestamp: Timestamp) {
        if let Err(e) = self.on_frame(frame, timestamp) {
            warn!("Simulated node dropped frame: {e}");
        }
    }

    fn tick(&mut self, timestamp: Timestamp) {
        if let Err(e) = self.on_tick(timestamp) {
            warn!("Simulated node missed tick: {e}");
        }
    }
}

/// A simulated bus and the nodes on it
#[derive(Debug)]
pub struct Simulation<N> {
    bus: SharedBus,
    nodes: Vec<N>,
    now: Timestamp,
    tick: Duration,
}

impl<N: SimulatedNode> Simulation<N> {
    /// Creates an empty simulation, whose clock advances in steps of `tick`
    pub fn new(tick: Duration) -> Self {
        Self {
            bus: Arc::new(Mutex::new(BusState::default())),
            nodes: Vec::new(),
            now: Duration::ZERO,
            tick,
        }
    }

    /// Attaches a node, built around its port. Returns the node's index
    pub fn attach(&mut self, build: impl FnOnce(SimulationPort) -> N) -> usize {
        let port = SimulationPort {
            port: self.nodes.len(),
            bus: self.bus.clone(),
        };
        self.nodes.push(build(port));
        self.nodes.len() - 1
    }

    /// Node at `index`
    pub fn node(&self, index: usize) -> &N {
        &self.nodes[index]
    }

    /// Mutable node at `index`
    pub fn node_mut(&mut self, index: usize) -> &mut N {
        &mut self.nodes[index]
    }

    /// Current simulated time
    pub fn now(&self) -> Timestamp {
        self.now
    }

    fn set_flag(list: &mut Vec<usize>, port: usize, on: bool) {
        list.retain(|p| *p != port);
        if on {
            list.push(port);
        }
    }

    /// Whether a node sees echoes of its own frames. Without them, it never gets transmit
    /// confirmation
    pub fn set_echo(&self, port: usize, enabled: bool) {
        Self::set_flag(&mut lock(&self.bus).echo_disabled, port, !enabled);
    }

    /// Frames sent by a muted node are echoed back to it, but nobody else sees them
    pub fn set_muted(&self, port: usize, muted: bool) {
        Self::set_flag(&mut lock(&self.bus).muted, port, muted);
    }

    /// An offline node's port rejects every frame
    pub fn set_offline(&self, port: usize, offline: bool) {
        Self::set_flag(&mut lock(&self.bus).offline, port, offline);
    }

    /// Puts a frame on the bus as if sent by a node outside the simulation
    pub fn inject(&self, frame: CanFrame) {
        lock(&self.bus).queue.push_back((EXTERNAL_PORT, frame));
    }

    /// Every frame delivered so far, with the time it was delivered at
    pub fn history(&self) -> Vec<(Timestamp, CanFrame)> {
        lock(&self.bus).history.clone()
    }

    /// Frames delivered so far which were sent on `id`
    pub fn frames_on(&self, id: u32) -> Vec<CanFrame> {
        lock(&self.bus)
            .history
            .iter()
            .filter(|(_, f)| f.id() == id)
            .map(|(_, f)| *f)
            .collect()
    }

    /// Delivers queued frames until the bus is quiet, including frames sent in reaction to
    /// the ones delivered. Returns how many were delivered
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES {
            let (sender, frame, echo, muted) = {
                let mut bus = lock(&self.bus);
                let Some((sender, frame)) = bus.queue.pop_front() else {
                    break;
                };
                bus.history.push((self.now, frame));
                let echo = !bus.echo_disabled.contains(&sender);
                let muted = bus.muted.contains(&sender);
                (sender, frame, echo, muted)
            };
            debug!("Sim {:?} port {sender}: 0x{:04X} {:02X?}", self.now, frame.id(), frame.data());
            for (port, node) in self.nodes.iter_mut().enumerate() {
                if port == sender {
                    if echo {
                        node.observe(frame.with_direction(Direction::Tx), self.now);
                    }
                } else if !muted {
                    node.observe(frame.with_direction(Direction::Rx), self.now);
                }
            }
            delivered += 1;
        }
        if delivered == MAX_DELIVERIES {
            warn!("Simulation bus did not go quiet");
        }
        delivered
    }

    /// Advances the clock by `duration`, one tick at a time, delivering frames as they are sent
    pub fn advance(&mut self, duration: Duration) {
        let end = self.now + duration;
        self.deliver();
        while self.now < end {
            self.now = (self.now + self.tick).min(end);
            let now = self.now;
            for node in self.nodes.iter_mut() {
                node.tick(now);
            }
            self.deliver();
        }
    }

    /// Steps the clock until `done` returns true, or `limit` passes. Returns whether `done`
    /// was reached
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let end = self.now + limit;
        self.deliver();
        while !done(&mut *self) {
            if self.now >= end {
                return false;
            }
            let tick = self.tick;
            self.advance(tick);
        }
        true
    }
}
