//! Reassembles inbound transfers addressed to a node
//!
//! Every node has exactly one receiver, which lives for as long as the node is registered.
//! It only tracks one segmented reception at a time. Single frames are always accepted.

use log::{debug, error, warn};

use crate::{
    channel::{CanFrame, Direction, Timestamp},
    codec::{self, FlowStatus, Pci},
    config::{FlowControlParams, Target},
    event_bus::{Disposition, Event, Listener},
    registry::EngineContext,
    session::{AddressingMode, ErrorFlags, NodeHandle, TransferId},
};

#[derive(Debug)]
struct Reception {
    transfer: TransferId,
    expected_sn: u8,
    block_count: u8,
    block_size: u8,
    last_activity: Timestamp,
    fc_frame: Option<CanFrame>,
    fc_sent_at: Timestamp,
}

/// Inbound state machine of a node
#[derive(Debug)]
pub struct Receiver {
    node: NodeHandle,
    active: Option<Reception>,
}

impl Receiver {
    /// Creates the receiver of `node`
    pub fn new(node: NodeHandle) -> Self {
        Self { node, active: None }
    }

    /// Transfer currently being reassembled
    pub fn active_transfer(&self) -> Option<TransferId> {
        self.active.as_ref().map(|r| r.transfer)
    }

    fn abort(&mut self, ctx: &mut EngineContext, flags: ErrorFlags) {
        if let Some(r) = self.active.take() {
            ctx.conclude(r.transfer, Err(flags));
        }
    }

    fn send_flow_control(
        &mut self,
        target: &Target,
        params: FlowControlParams,
        now: Timestamp,
        ctx: &mut EngineContext,
    ) -> Result<CanFrame, ErrorFlags> {
        let frame = codec::encode_flow_control(target.flow_control_address(), params, target)
            .map_err(|e| {
                error!("Node {} cannot encode flow control: {e}", self.node);
                ErrorFlags::SEND_TIMEOUT
            })?;
        ctx.send(&frame).map_err(|_| ErrorFlags::SEND_TIMEOUT)?;
        if let Some(r) = self.active.as_mut() {
            r.fc_frame = Some(frame);
            r.fc_sent_at = now;
            r.last_activity = now;
            if let Some(session) = ctx.session_mut(r.transfer) {
                session.record_sent(frame);
            }
        }
        Ok(frame)
    }

    fn reject(&mut self, target: &Target, now: Timestamp, ctx: &mut EngineContext, status: FlowStatus) {
        let params = FlowControlParams {
            status,
            block_size: 0,
            st_min: 0,
        };
        if let Ok(frame) = codec::encode_flow_control(target.flow_control_address(), params, target) {
            debug!("Node {} replying {status} at {now:?}", self.node);
            // No session to fail, a rejected frame is only logged by send
            let _ = ctx.send(&frame);
        }
    }

    fn on_single(
        &mut self,
        frame: &CanFrame,
        mode: AddressingMode,
        data: &[u8],
        ctx: &mut EngineContext,
    ) {
        if self.active.is_some() {
            warn!("Node {} got a single frame mid reception, aborting it", self.node);
            self.abort(ctx, ErrorFlags::FLOW_CONTROL_ERROR);
        }
        let Some(id) = ctx.open_inbound(self.node, mode, data.len()) else {
            return;
        };
        if let Some(session) = ctx.session_mut(id) {
            session.append(data);
            session.record_received(*frame);
        }
        ctx.conclude(id, Ok(()));
    }

    fn on_first(
        &mut self,
        frame: &CanFrame,
        mode: AddressingMode,
        len: usize,
        data: &[u8],
        target: &Target,
        now: Timestamp,
        ctx: &mut EngineContext,
    ) {
        if mode == AddressingMode::Functional {
            warn!("Node {} ignoring functionally addressed first frame", self.node);
            return;
        }
        if len <= codec::max_single_frame_payload(frame.len()) {
            warn!("Node {} ignoring first frame announcing only {len} bytes", self.node);
            return;
        }
        if self.active.is_some() {
            warn!("Node {} already receiving, rejecting first frame", self.node);
            self.reject(target, now, ctx, FlowStatus::Overflow);
            return;
        }
        if len > target.max_rx_payload {
            error!(
                "Node {} cannot take {len} bytes (max {})",
                self.node, target.max_rx_payload
            );
            self.reject(target, now, ctx, FlowStatus::Overflow);
            return;
        }
        if target.flow_control.status != FlowStatus::ContinueToSend {
            self.reject(target, now, ctx, target.flow_control.status);
            return;
        }
        let Some(id) = ctx.open_inbound(self.node, mode, len) else {
            return;
        };
        if let Some(session) = ctx.session_mut(id) {
            session.append(data);
            session.record_received(*frame);
        }
        self.active = Some(Reception {
            transfer: id,
            expected_sn: 1,
            block_count: 0,
            block_size: target.flow_control.block_size,
            last_activity: now,
            fc_frame: None,
            fc_sent_at: now,
        });
        if let Err(flags) = self.send_flow_control(target, target.flow_control, now, ctx) {
            self.abort(ctx, flags);
        }
    }

    fn on_consecutive(
        &mut self,
        frame: &CanFrame,
        sn: u8,
        data: &[u8],
        target: &Target,
        now: Timestamp,
        ctx: &mut EngineContext,
    ) {
        let Some(r) = self.active.as_mut() else {
            debug!("Node {} ignoring consecutive frame outside a reception", self.node);
            return;
        };
        if sn != r.expected_sn {
            error!(
                "Node {} expected sequence {}, got {sn}",
                self.node, r.expected_sn
            );
            self.abort(ctx, ErrorFlags::FLOW_CONTROL_ERROR);
            return;
        }
        r.expected_sn = (r.expected_sn + 1) & 0x0F;
        r.last_activity = now;
        let transfer = r.transfer;
        let Some(session) = ctx.session_mut(transfer) else {
            self.active = None;
            return;
        };
        session.append(data);
        session.record_received(*frame);
        if session.remaining() == 0 {
            self.active = None;
            ctx.conclude(transfer, Ok(()));
            return;
        }
        r.block_count += 1;
        if r.block_size != 0 && r.block_count == r.block_size {
            r.block_count = 0;
            if let Err(flags) = self.send_flow_control(target, target.flow_control, now, ctx) {
                self.abort(ctx, flags);
            }
        }
    }

    fn check_timers(&mut self, target: &Target, now: Timestamp, ctx: &mut EngineContext) {
        let Some(r) = self.active.as_ref() else {
            return;
        };
        let margin = target.fault_tolerance;
        if r.fc_frame.is_some() && now.saturating_sub(r.fc_sent_at) > target.network.n_ar + margin
        {
            error!("Node {} flow control not confirmed within N_Ar", self.node);
            self.abort(ctx, ErrorFlags::SEND_TIMEOUT);
        } else if now.saturating_sub(r.last_activity) > target.network.n_cr + margin {
            error!("Node {} no consecutive frame within N_Cr", self.node);
            self.abort(ctx, ErrorFlags::CR_TIMEOUT);
        }
    }
}

impl Listener<EngineContext> for Receiver {
    fn wants(&self, event: &Event) -> bool {
        match event {
            Event::FrameObserved { .. } => true,
            Event::TimeAdvanced { .. } => self.active.is_some(),
        }
    }

    fn react(&mut self, event: &Event, ctx: &mut EngineContext) -> Disposition {
        let Some(target) = ctx.target(self.node) else {
            return Disposition::Remove;
        };
        let now = event.timestamp();
        if let Some(frame) = event.frame() {
            if frame.direction() == Direction::Tx {
                if let Some(r) = self.active.as_mut() {
                    if r.fc_frame.is_some_and(|f| f.same_wire_content(frame)) {
                        r.fc_frame = None;
                        r.last_activity = now;
                    }
                }
            } else if let Some(mode) = target.rx_addressing(frame.id()) {
                match codec::decode(frame) {
                    Pci::Single { data, .. } => self.on_single(frame, mode, data, ctx),
                    Pci::First { len, data } => {
                        self.on_first(frame, mode, len, data, &target, now, ctx)
                    }
                    Pci::Consecutive { sn, data } if mode == AddressingMode::Physical => {
                        self.on_consecutive(frame, sn, data, &target, now, ctx)
                    }
                    _ => {}
                }
            }
        }
        self.check_timers(&target, now, ctx);
        Disposition::Keep
    }
}
