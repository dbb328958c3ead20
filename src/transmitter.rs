//! Drives one outbound transfer from its first frame to its terminal state
//!
//! ```text
//!            +-------------------------------------------------+
//!            v                                                 |
//! Sending -> WaitingEcho -+-> WaitingStMin ---------------------+
//!                         +-> WaitingFlowControl --(CTS)--> Sending
//!                         +-> WaitingResponse --(SF/FF)--> Done
//!                         +-> Done
//! ```
//!
//! A frame only counts as sent once the bus has echoed it back. The transfer completes when
//! the echo of the final frame is seen (or, with `await_response`, when the peer starts its
//! response).

use std::time::Duration;

use log::{debug, error, warn};

use crate::{
    channel::{CanFrame, Direction, Timestamp},
    codec::{self, FlowStatus, Pci},
    config::Target,
    event_bus::{Disposition, Event, Listener},
    registry::EngineContext,
    session::{AddressingMode, ErrorFlags, TransferId},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
/// Where a [Transmitter] is in its transfer
pub enum Phase {
    /// About to hand the next frame to the bus
    Sending,
    /// Frame handed to the bus, waiting for its echo (N_As)
    WaitingEcho,
    /// Waiting for the separation time before the next consecutive frame
    WaitingStMin,
    /// Waiting for the peer's flow control (N_Bs)
    WaitingFlowControl,
    /// Every frame sent, waiting for the peer to start responding (P2 client)
    WaitingResponse,
    /// Terminal
    Done,
}

/// Outbound state machine of a single transfer
#[derive(Debug)]
pub struct Transmitter {
    transfer: TransferId,
    target: Target,
    fc_source: u32,
    phase: Phase,
    last_frame: Option<CanFrame>,
    sent_at: Timestamp,
    echoed_at: Timestamp,
    fc_due: bool,
    send_on_echo: bool,
    block_remaining: Option<u8>,
    st_min: Duration,
}

impl Transmitter {
    /// Creates a transmitter for an outbound session already held by the registry.
    /// The target is captured as is, reconfiguring the node does not affect the transfer
    pub fn new(transfer: TransferId, target: Target) -> Self {
        Self {
            transfer,
            fc_source: target.flow_control_source(),
            target,
            phase: Phase::Sending,
            last_frame: None,
            sent_at: Duration::ZERO,
            echoed_at: Duration::ZERO,
            fc_due: false,
            send_on_echo: false,
            block_remaining: None,
            st_min: Duration::ZERO,
        }
    }

    /// Transfer being sent
    pub fn transfer(&self) -> TransferId {
        self.transfer
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Sends the first frame
    pub fn start(&mut self, ctx: &mut EngineContext) -> Disposition {
        let now = ctx.now();
        self.send_next(now, ctx)
    }

    fn finish(&mut self, ctx: &mut EngineContext, outcome: Result<(), ErrorFlags>) -> Disposition {
        self.phase = Phase::Done;
        ctx.conclude(self.transfer, outcome);
        Disposition::Remove
    }

    fn send_next(&mut self, now: Timestamp, ctx: &mut EngineContext) -> Disposition {
        let Some(session) = ctx.session_mut(self.transfer) else {
            warn!("Transfer {} vanished while sending", self.transfer);
            self.phase = Phase::Done;
            return Disposition::Remove;
        };
        let frame = match codec::encode_next(session, &self.target) {
            Ok(Some(frame)) => frame,
            Ok(None) => return self.finish(ctx, Ok(())),
            Err(e) => {
                error!("Cannot encode next frame of {}: {e}", self.transfer);
                return self.finish(ctx, Err(ErrorFlags::SEND_TIMEOUT));
            }
        };
        session.record_sent(frame);
        match codec::decode(&frame) {
            Pci::First { .. } => {
                self.fc_due = true;
                self.block_remaining = None;
            }
            Pci::Consecutive { .. } => {
                if let Some(n) = self.block_remaining.as_mut() {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        self.fc_due = true;
                    }
                }
            }
            _ => {}
        }
        if ctx.send(&frame).is_err() {
            return self.finish(ctx, Err(ErrorFlags::SEND_TIMEOUT));
        }
        self.last_frame = Some(frame);
        self.sent_at = now;
        self.phase = Phase::WaitingEcho;
        Disposition::Keep
    }

    fn on_echo(&mut self, now: Timestamp, ctx: &mut EngineContext) -> Disposition {
        self.echoed_at = now;
        let Some(session) = ctx.session(self.transfer) else {
            self.phase = Phase::Done;
            return Disposition::Remove;
        };
        if session.is_segmented() {
            if self.target.await_response && session.addressing() == AddressingMode::Physical {
                debug!("{} sent, waiting for response", self.transfer);
                self.phase = Phase::WaitingResponse;
                return Disposition::Keep;
            }
            return self.finish(ctx, Ok(()));
        }
        if self.fc_due {
            self.phase = Phase::WaitingFlowControl;
            return Disposition::Keep;
        }
        // Flow control already arrived, first frame of the block is not held back by STmin
        if std::mem::take(&mut self.send_on_echo) {
            self.phase = Phase::Sending;
            return self.send_next(now, ctx);
        }
        self.phase = Phase::WaitingStMin;
        self.send_when_separated(now, ctx)
    }

    fn send_when_separated(&mut self, now: Timestamp, ctx: &mut EngineContext) -> Disposition {
        if now.saturating_sub(self.echoed_at) >= self.st_min {
            self.phase = Phase::Sending;
            self.send_next(now, ctx)
        } else {
            Disposition::Keep
        }
    }

    fn on_flow_control(
        &mut self,
        frame: &CanFrame,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
        now: Timestamp,
        ctx: &mut EngineContext,
    ) -> Disposition {
        let expecting = self.fc_due
            && matches!(self.phase, Phase::WaitingEcho | Phase::WaitingFlowControl);
        if !expecting {
            debug!("Ignoring unsolicited flow control for {} in {}", self.transfer, self.phase);
            return Disposition::Keep;
        }
        if let Some(session) = ctx.session_mut(self.transfer) {
            session.record_received(*frame);
        }
        match status {
            FlowStatus::ContinueToSend => {
                self.block_remaining = (block_size != 0).then_some(block_size);
                self.st_min = codec::st_min_to_duration(st_min);
                self.fc_due = false;
                debug!(
                    "{} got flow control, BS {block_size}, STmin {:?}",
                    self.transfer, self.st_min
                );
                if self.phase == Phase::WaitingFlowControl {
                    self.phase = Phase::Sending;
                    return self.send_next(now, ctx);
                }
                self.send_on_echo = true;
                Disposition::Keep
            }
            FlowStatus::Wait => {
                error!("{} received flow control Wait, which is not supported", self.transfer);
                self.finish(ctx, Err(ErrorFlags::FLOW_CONTROL_ERROR))
            }
            FlowStatus::Overflow => {
                error!("{} rejected by peer, buffer overflow", self.transfer);
                self.finish(ctx, Err(ErrorFlags::OVERFLOW))
            }
            FlowStatus::Reserved(x) => {
                error!("{} received reserved flow status {x:#X}", self.transfer);
                self.finish(ctx, Err(ErrorFlags::FLOW_CONTROL_ERROR))
            }
        }
    }

    fn on_frame(&mut self, frame: &CanFrame, now: Timestamp, ctx: &mut EngineContext) -> Disposition {
        if frame.direction() == Direction::Tx {
            let own = self.last_frame.is_some_and(|f| f.same_wire_content(frame));
            if own && self.phase == Phase::WaitingEcho {
                return self.on_echo(now, ctx);
            }
            return Disposition::Keep;
        }
        if frame.id() != self.fc_source {
            return Disposition::Keep;
        }
        match codec::decode(frame) {
            Pci::FlowControl {
                status,
                block_size,
                st_min,
            } => self.on_flow_control(frame, status, block_size, st_min, now, ctx),
            Pci::Single { .. } | Pci::First { .. } if self.phase == Phase::WaitingResponse => {
                debug!("{} response started", self.transfer);
                self.finish(ctx, Ok(()))
            }
            _ => Disposition::Keep,
        }
    }

    fn check_timers(&mut self, now: Timestamp, ctx: &mut EngineContext) -> Disposition {
        let margin = self.target.fault_tolerance;
        let net = self.target.network;
        let since_echo = now.saturating_sub(self.echoed_at);
        match self.phase {
            Phase::WaitingEcho if now.saturating_sub(self.sent_at) > net.n_as + margin => {
                error!("{} frame not confirmed within N_As", self.transfer);
                self.finish(ctx, Err(ErrorFlags::SEND_TIMEOUT))
            }
            Phase::WaitingFlowControl if since_echo > net.n_bs + margin => {
                error!("{} no flow control within N_Bs", self.transfer);
                self.finish(ctx, Err(ErrorFlags::BS_TIMEOUT))
            }
            Phase::WaitingStMin if since_echo > self.st_min + net.n_cs + margin => {
                error!("{} consecutive frame not sent within N_Cs", self.transfer);
                self.finish(ctx, Err(ErrorFlags::SEND_TIMEOUT))
            }
            Phase::WaitingStMin => self.send_when_separated(now, ctx),
            Phase::WaitingResponse if since_echo > self.target.session.p2_client + margin => {
                error!("{} no response within P2 client", self.transfer);
                self.finish(ctx, Err(ErrorFlags::RESPONSE_TIMEOUT))
            }
            _ => Disposition::Keep,
        }
    }
}

impl Listener<EngineContext> for Transmitter {
    fn wants(&self, event: &Event) -> bool {
        match event {
            Event::FrameObserved { frame, .. } => {
                frame.id() == self.fc_source || self.last_frame.is_some_and(|f| f.id() == frame.id())
            }
            Event::TimeAdvanced { .. } => true,
        }
    }

    fn react(&mut self, event: &Event, ctx: &mut EngineContext) -> Disposition {
        let now = event.timestamp();
        if let Some(frame) = event.frame() {
            if self.on_frame(frame, now, ctx) == Disposition::Remove {
                return Disposition::Remove;
            }
        }
        if self.phase == Phase::Done {
            return Disposition::Remove;
        }
        self.check_timers(now, ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        channel::{CanBus, ChannelError, ChannelResult},
        registry::TransportEngine,
        session::{Completion, SessionState},
    };

    #[derive(Clone, Default)]
    struct Capture {
        frames: Arc<Mutex<Vec<CanFrame>>>,
        reject: bool,
    }

    impl CanBus for Capture {
        fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
            if self.reject {
                return Err(ChannelError::BufferFull);
            }
            self.frames.lock().unwrap().push(*frame);
            Ok(())
        }
    }

    impl Capture {
        fn last(&self) -> CanFrame {
            *self.frames.lock().unwrap().last().unwrap()
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    fn ms(x: u64) -> Duration {
        Duration::from_millis(x)
    }

    fn fc(data: &[u8]) -> CanFrame {
        CanFrame::new(0x7E8, data).with_direction(Direction::Rx)
    }

    fn setup(target: Target) -> (Capture, TransportEngine) {
        let _ = env_logger::try_init();
        let bus = Capture::default();
        let mut engine = TransportEngine::new(bus.clone());
        engine.add_node(1, target).unwrap();
        (bus, engine)
    }

    fn echo_last(bus: &Capture, engine: &mut TransportEngine, at: u64) {
        engine.on_frame(bus.last(), ms(at));
    }

    #[test]
    fn block_size_gates_consecutive_frames() {
        let (bus, mut e) = setup(Target::default());
        // FF (6) + 5 CFs of 7
        let id = e.send_diagnostic_request(1, &[0x5A; 41]).unwrap();
        echo_last(&bus, &mut e, 1);
        assert_eq!(bus.count(), 1);
        e.on_frame(fc(&[0x30, 0x02, 0x00]), ms(2));
        assert_eq!(bus.count(), 2);
        echo_last(&bus, &mut e, 3);
        assert_eq!(bus.count(), 3);
        echo_last(&bus, &mut e, 4);
        // Block exhausted, waiting for the next flow control
        assert_eq!(bus.count(), 3);
        e.on_frame(fc(&[0x30, 0x00, 0x00]), ms(5));
        for t in 6..9 {
            echo_last(&bus, &mut e, t);
        }
        assert_eq!(bus.count(), 6);
        assert_eq!(e.status(id).unwrap(), SessionState::SendComplete);
        assert_eq!(e.session(id).unwrap().received().len(), 2);
    }

    #[test]
    fn st_min_delays_consecutive_frames() {
        let (bus, mut e) = setup(Target::default());
        e.send_diagnostic_request(1, &[0x11; 20]).unwrap();
        echo_last(&bus, &mut e, 0);
        e.on_frame(fc(&[0x30, 0x00, 0x0A]), ms(1));
        assert_eq!(bus.count(), 2);
        echo_last(&bus, &mut e, 2);
        e.on_tick(ms(5));
        assert_eq!(bus.count(), 2);
        e.on_tick(ms(12));
        assert_eq!(bus.count(), 3);
    }

    #[test]
    fn flow_control_before_echo_sends_on_echo() {
        let (bus, mut e) = setup(Target::default());
        e.send_diagnostic_request(1, &[0x11; 30]).unwrap();
        e.on_frame(fc(&[0x30, 0x00, 0x0A]), ms(1));
        assert_eq!(bus.count(), 1);
        // First CF goes out with the echo, the next one waits STmin
        echo_last(&bus, &mut e, 2);
        assert_eq!(bus.count(), 2);
        echo_last(&bus, &mut e, 3);
        e.on_tick(ms(12));
        assert_eq!(bus.count(), 2);
        e.on_tick(ms(13));
        assert_eq!(bus.count(), 3);
    }

    #[test]
    fn flow_control_wait_is_unsupported() {
        let (bus, mut e) = setup(Target::default());
        let id = e.send_diagnostic_request(1, &[0x22; 12]).unwrap();
        echo_last(&bus, &mut e, 1);
        e.on_frame(fc(&[0x31, 0x00, 0x00]), ms(2));
        assert_eq!(
            e.poll_completion(id).unwrap(),
            Some(Completion::Failed(ErrorFlags::FLOW_CONTROL_ERROR))
        );
        assert_eq!(bus.count(), 1);
    }

    #[test]
    fn overflow_fails_in_the_same_dispatch() {
        let (bus, mut e) = setup(Target::default());
        let id = e.send_diagnostic_request(1, &[0x22; 12]).unwrap();
        echo_last(&bus, &mut e, 1);
        e.on_frame(fc(&[0x32, 0x00, 0x00]), ms(2));
        assert_eq!(e.status(id).unwrap(), SessionState::Failed);
        assert_eq!(e.session(id).unwrap().errors(), ErrorFlags::OVERFLOW);
    }

    #[test]
    fn unsolicited_flow_control_is_ignored() {
        let (bus, mut e) = setup(Target::default());
        let id = e.send_diagnostic_request(1, &[0x3E, 0x00]).unwrap();
        e.on_frame(fc(&[0x32, 0x00, 0x00]), ms(1));
        assert_eq!(e.status(id).unwrap(), SessionState::Unfinished);
        echo_last(&bus, &mut e, 2);
        assert_eq!(e.status(id).unwrap(), SessionState::SendComplete);
    }

    #[test]
    fn missing_flow_control_times_out() {
        let (bus, mut e) = setup(Target::default());
        let id = e.send_diagnostic_request(1, &[0x22; 12]).unwrap();
        echo_last(&bus, &mut e, 100);
        e.on_tick(ms(1100));
        assert_eq!(e.status(id).unwrap(), SessionState::Unfinished);
        e.on_tick(ms(1111));
        assert_eq!(e.session(id).unwrap().errors(), ErrorFlags::BS_TIMEOUT);
    }

    #[test]
    fn missing_echo_times_out() {
        let (_bus, mut e) = setup(Target::default());
        let id = e.send_diagnostic_request(1, &[0x3E, 0x00]).unwrap();
        e.on_tick(ms(1010));
        assert_eq!(e.status(id).unwrap(), SessionState::Unfinished);
        e.on_tick(ms(1011));
        assert_eq!(e.session(id).unwrap().errors(), ErrorFlags::SEND_TIMEOUT);
    }

    #[test]
    fn rejected_frame_fails_transfer() {
        let _ = env_logger::try_init();
        let bus = Capture {
            reject: true,
            ..Capture::default()
        };
        let mut e = TransportEngine::new(bus);
        e.add_node(1, Target::default()).unwrap();
        let id = e.send_diagnostic_request(1, &[0x3E, 0x00]).unwrap();
        assert_eq!(
            e.poll_completion(id).unwrap(),
            Some(Completion::Failed(ErrorFlags::SEND_TIMEOUT))
        );
    }

    #[test]
    fn response_must_start_within_p2() {
        let target = Target {
            await_response: true,
            ..Target::default()
        };
        let (bus, mut e) = setup(target);
        let ok = e.send_diagnostic_request(1, &[0x22, 0xF1, 0x90]).unwrap();
        echo_last(&bus, &mut e, 0);
        assert_eq!(e.status(ok).unwrap(), SessionState::Unfinished);
        e.on_frame(fc(&[0x10, 0x14, 0x62, 0xF1, 0x90, 0x57, 0x30, 0x4C]), ms(40));
        assert_eq!(e.status(ok).unwrap(), SessionState::SendComplete);

        let late = e.send_diagnostic_request(1, &[0x22, 0xF1, 0x91]).unwrap();
        echo_last(&bus, &mut e, 1000);
        // P2 client (150ms) + margin (10ms)
        e.on_tick(ms(1160));
        assert_eq!(e.status(late).unwrap(), SessionState::Unfinished);
        e.on_tick(ms(1161));
        assert_eq!(e.session(late).unwrap().errors(), ErrorFlags::RESPONSE_TIMEOUT);
    }
}
