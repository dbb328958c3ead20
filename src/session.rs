//! A single in-flight ISO-TP transfer

use std::fmt;

use bitflags::bitflags;

use crate::channel::{CanFrame, Direction};

/// Handle of a configured node
pub type NodeHandle = u16;

/// Opaque identifier of a transfer.
///
/// The node handle lives in the upper 16 bits, a per node rolling counter in the lower 16 bits
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferId(u32);

impl TransferId {
    /// Packs a node handle and counter into a transfer ID
    pub fn new(node: NodeHandle, counter: u16) -> Self {
        Self(((node as u32) << 16) | counter as u32)
    }

    /// Node the transfer belongs to
    pub fn node(&self) -> NodeHandle {
        (self.0 >> 16) as NodeHandle
    }

    /// Per node counter value
    pub fn counter(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Raw packed value
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl From<u32> for TransferId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Addressing mode of a transfer
pub enum AddressingMode {
    /// 1 to 1 communication
    Physical,
    /// 1 to n broadcast. Only single frame transfers are permitted
    Functional,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Lifecycle state of a session
pub enum SessionState {
    /// Transfer is still in progress
    Unfinished,
    /// Every frame was transmitted and confirmed by the bus
    SendComplete,
    /// Inbound payload fully reassembled
    Received,
    /// Transfer aborted, see [ErrorFlags]
    Failed,
}

impl SessionState {
    /// True for every state except [SessionState::Unfinished]
    pub fn is_terminal(&self) -> bool {
        *self != SessionState::Unfinished
    }
}

bitflags! {
    /// Reasons a session failed. More than one can be set
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ErrorFlags: u8 {
        /// A frame was not confirmed by the bus within N_As, or could not be handed to it
        const SEND_TIMEOUT = 0b0000_0001;
        /// No response started within P2 client
        const RESPONSE_TIMEOUT = 0b0000_0010;
        /// No flow control frame within N_Bs
        const BS_TIMEOUT = 0b0000_0100;
        /// Malformed or unsupported flow control, or out of sequence consecutive frame
        const FLOW_CONTROL_ERROR = 0b0000_1000;
        /// Peer signalled a buffer overflow
        const OVERFLOW = 0b0001_0000;
        /// No consecutive frame within N_Cr while receiving
        const CR_TIMEOUT = 0b0010_0000;
    }
}

/// Terminal result of a transfer, as reported to whoever waits on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Outbound transfer fully sent
    SendComplete,
    /// Inbound transfer fully reassembled
    Received(Vec<u8>),
    /// Transfer failed
    Failed(ErrorFlags),
}

/// One transfer, inbound or outbound.
///
/// Only the transmitter or receiver which created a session mutates it.
#[derive(Debug, Clone)]
pub struct Session {
    id: TransferId,
    direction: Direction,
    addressing: AddressingMode,
    payload: Vec<u8>,
    expected_len: usize,
    cursor: usize,
    sequence: u8,
    segmented: bool,
    state: SessionState,
    errors: ErrorFlags,
    sent: Vec<CanFrame>,
    received: Vec<CanFrame>,
}

impl Session {
    /// Creates a session which transmits `payload`
    pub fn new_outbound(id: TransferId, addressing: AddressingMode, payload: Vec<u8>) -> Self {
        let expected_len = payload.len();
        Self {
            id,
            direction: Direction::Tx,
            addressing,
            payload,
            expected_len,
            cursor: 0,
            sequence: 0,
            segmented: false,
            state: SessionState::Unfinished,
            errors: ErrorFlags::empty(),
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Creates a session which reassembles `expected_len` inbound bytes
    pub fn new_inbound(id: TransferId, addressing: AddressingMode, expected_len: usize) -> Self {
        Self {
            id,
            direction: Direction::Rx,
            addressing,
            payload: Vec::with_capacity(expected_len),
            expected_len,
            cursor: 0,
            sequence: 0,
            segmented: false,
            state: SessionState::Unfinished,
            errors: ErrorFlags::empty(),
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Transfer ID
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// [Direction::Tx] for outbound sessions, [Direction::Rx] for inbound ones
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Addressing mode
    pub fn addressing(&self) -> AddressingMode {
        self.addressing
    }

    /// Payload bytes. For inbound sessions, only what was reassembled so far
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total length of the transfer
    pub fn payload_len(&self) -> usize {
        self.expected_len
    }

    /// Bytes segmented (outbound) or reassembled (inbound) so far
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes left to segment or reassemble
    pub fn remaining(&self) -> usize {
        self.expected_len - self.cursor
    }

    /// Current sequence number
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// True once every frame of an outbound payload has been produced.
    /// This does not mean the peer has received them
    pub fn is_segmented(&self) -> bool {
        self.segmented
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Error bits, only meaningful once [SessionState::Failed]
    pub fn errors(&self) -> ErrorFlags {
        self.errors
    }

    /// Frames handed to the bus on behalf of this session
    pub fn sent(&self) -> &[CanFrame] {
        &self.sent
    }

    /// Frames received for this session
    pub fn received(&self) -> &[CanFrame] {
        &self.received
    }

    /// Terminal result, or [None] while unfinished
    pub fn completion(&self) -> Option<Completion> {
        match self.state {
            SessionState::Unfinished => None,
            SessionState::SendComplete => Some(Completion::SendComplete),
            SessionState::Received => Some(Completion::Received(self.payload.clone())),
            SessionState::Failed => Some(Completion::Failed(self.errors)),
        }
    }

    /// Slice of the outbound payload not yet segmented
    pub(crate) fn unsent(&self) -> &[u8] {
        &self.payload[self.cursor..]
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.cursor = (self.cursor + bytes).min(self.expected_len);
    }

    pub(crate) fn set_segmented(&mut self) {
        self.segmented = true;
    }

    pub(crate) fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Pre-increments the 4 bit sequence number and returns it
    pub(crate) fn next_sequence(&mut self) -> u8 {
        self.sequence = (self.sequence + 1) & 0x0F;
        self.sequence
    }

    /// Appends reassembled bytes, never past the announced length.
    /// Returns how many bytes were taken
    pub(crate) fn append(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.payload.extend_from_slice(&data[..take]);
        self.cursor += take;
        take
    }

    pub(crate) fn record_sent(&mut self, frame: CanFrame) {
        self.sent.push(frame);
    }

    pub(crate) fn record_received(&mut self, frame: CanFrame) {
        self.received.push(frame);
    }

    /// Marks the session as successfully finished
    pub(crate) fn complete(&mut self) {
        self.state = match self.direction {
            Direction::Tx => SessionState::SendComplete,
            Direction::Rx => SessionState::Received,
        };
    }

    pub(crate) fn fail(&mut self, errors: ErrorFlags) {
        self.errors |= errors;
        self.state = SessionState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_id_packs_node_and_counter() {
        let id = TransferId::new(0x0012, 0xBEEF);
        assert_eq!(id.raw(), 0x0012_BEEF);
        assert_eq!(id.node(), 0x0012);
        assert_eq!(id.counter(), 0xBEEF);
        assert_eq!(id.to_string(), "0x0012BEEF");
    }

    #[test]
    fn sequence_wraps_after_15() {
        let mut s = Session::new_outbound(TransferId::new(1, 1), AddressingMode::Physical, vec![]);
        let seq: Vec<u8> = (0..17).map(|_| s.next_sequence()).collect();
        assert_eq!(
            seq,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0, 1]
        );
    }

    #[test]
    fn append_never_exceeds_announced_length() {
        let mut s = Session::new_inbound(TransferId::new(1, 1), AddressingMode::Physical, 10);
        assert_eq!(s.append(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(s.append(&[7, 8, 9, 10, 0xCC, 0xCC, 0xCC]), 4);
        assert_eq!(s.remaining(), 0);
        assert_eq!(s.payload(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn failure_bits_accumulate() {
        let mut s = Session::new_outbound(TransferId::new(1, 1), AddressingMode::Physical, vec![1]);
        assert_eq!(s.completion(), None);
        s.fail(ErrorFlags::OVERFLOW);
        s.fail(ErrorFlags::FLOW_CONTROL_ERROR);
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(
            s.completion(),
            Some(Completion::Failed(
                ErrorFlags::OVERFLOW | ErrorFlags::FLOW_CONTROL_ERROR
            ))
        );
    }

    #[test]
    fn completion_depends_on_direction() {
        let mut tx = Session::new_outbound(TransferId::new(1, 1), AddressingMode::Physical, vec![1]);
        tx.complete();
        assert_eq!(tx.state(), SessionState::SendComplete);

        let mut rx = Session::new_inbound(TransferId::new(1, 2), AddressingMode::Physical, 1);
        rx.append(&[0x7E]);
        rx.complete();
        assert_eq!(rx.completion(), Some(Completion::Received(vec![0x7E])));
    }
}
