//! Module for the CAN frame model and the bus the transport engine writes to
//!
//! The engine never reads from a bus on its own. Whoever owns the physical (or simulated)
//! interface hands it every observed frame, and implements [CanBus] so the engine can transmit.

use std::{fmt, time::Duration};

use bitflags::bitflags;

/// Timestamp of an observed frame or a timer tick.
///
/// This is the time since an arbitrary (but fixed) epoch chosen by the host, frames and
/// ticks must use the same base.
pub type Timestamp = Duration;

/// Largest data field of a CAN-FD frame
pub const MAX_FRAME_DATA: usize = 64;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by the CAN bus collaborator
pub enum ChannelError {
    /// Underlying IO Error with the bus
    IOError(std::io::Error),
    /// Timeout when writing a frame to the bus
    WriteTimeout,
    /// The bus' Tx buffer is full
    BufferFull,
    /// The interface is not open
    InterfaceNotOpen,
    /// The frame cannot be carried by the bus (EG: FD frame on a classic CAN bus)
    FrameNotSupported,
    /// Other error
    Other(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to bus"),
            ChannelError::BufferFull => write!(f, "bus Transmit buffer is full"),
            ChannelError::InterfaceNotOpen => write!(f, "bus interface is not open"),
            ChannelError::FrameNotSupported => write!(f, "frame cannot be carried by the bus"),
            ChannelError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::IOError(io_err) = self {
            Some(io_err)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::IOError(e)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Direction of a frame as seen by the node observing it
pub enum Direction {
    /// Frame was transmitted by this node (An echo of our own transmission)
    Tx,
    /// Frame was received from another node
    Rx,
}

bitflags! {
    /// Flag bits of a CAN frame
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FrameFlags: u8 {
        /// Remote transmission request
        const REMOTE = 0b0000_0001;
        /// Wakeup frame
        const WAKEUP = 0b0000_0010;
        /// Error frame
        const ERROR = 0b0000_0100;
        /// CAN-FD frame
        const FD = 0b0000_1000;
        /// CAN-FD bit rate switch
        const BRS = 0b0001_0000;
        /// CAN-FD error state indicator
        const ESI = 0b0010_0000;
    }
}

/// A CAN or CAN-FD frame
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    direction: Direction,
    flags: FrameFlags,
    len: u8,
    data: [u8; MAX_FRAME_DATA],
}

impl CanFrame {
    /// Creates a new outbound frame. Anything past 64 bytes of `data` is dropped,
    /// and frames longer than 8 bytes are flagged as CAN-FD.
    pub fn new(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(MAX_FRAME_DATA);
        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[..len].copy_from_slice(&data[..len]);
        let flags = if len > 8 {
            FrameFlags::FD
        } else {
            FrameFlags::empty()
        };
        Self {
            id,
            direction: Direction::Tx,
            flags,
            len: len as u8,
            data: buf,
        }
    }

    /// Returns the frame with its direction replaced
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Returns the frame with additional flag bits set
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// CAN Identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Direction of the frame
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Flag bits
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Number of data bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if the frame carries no data
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Data bytes of the frame
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// True if `other` is the same frame on the wire (Identifier and data), ignoring direction.
    pub fn same_wire_content(&self, other: &CanFrame) -> bool {
        self.id == other.id && self.data() == other.data()
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:04X}", self.id))
            .field("direction", &self.direction)
            .field("flags", &self.flags)
            .field("data", &format_args!("{:02X?}", self.data()))
            .finish()
    }
}

/// The bus the engine transmits frames on.
///
/// Implementations must eventually report every transmitted frame back to the engine
/// as an observed frame with [Direction::Tx]. The engine uses these echoes as
/// transmit confirmation (N_As), so a bus which never echoes will cause every transfer to
/// fail with a send timeout.
pub trait CanBus: Send {
    /// Hands a frame to the bus for transmission
    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()>;
}
