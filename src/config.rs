//! Per node ISO-TP timing and addressing configuration
//!
//! A [Target] describes everything the engine needs to talk to (or act as) one logical
//! diagnostic node: the three CAN identifiers, the ISO-TP network layer timers,
//! the session layer timers, the frame length class and the padding policy.

use std::time::Duration;

use crate::{
    TransportError, TransportResult,
    codec::{FlowStatus, dlc_to_len},
    session::AddressingMode,
};

/// Largest standard (11bit) CAN Identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest extended (29bit) CAN Identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Padding byte used when a frame has to be extended and no fill byte is configured
pub const DEFAULT_FILL_BYTE: u8 = 0xCC;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Which side of the diagnostic conversation a node plays
pub enum Role {
    /// Diagnostic client. Requests go out on the physical or functional address,
    /// responses (and flow control for our requests) come back on the response address.
    Tester,
    /// Diagnostic server. Requests arrive on the physical or functional address,
    /// responses go out on the response address.
    Ecu,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Frame padding policy
pub enum Padding {
    /// Pad short frames to at least 8 bytes with the fill byte
    Pad(u8),
    /// Send frames with their natural length. CAN-FD frames over 8 bytes are still
    /// extended to the next valid DLC length, as the bus cannot carry anything else
    NoPad,
}

impl Padding {
    /// Byte used to extend frames
    pub fn fill_byte(&self) -> u8 {
        match self {
            Padding::Pad(b) => *b,
            Padding::NoPad => DEFAULT_FILL_BYTE,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Frame length class, expressed as a CAN DLC code.
///
/// * 8 - Classic CAN, 8 bytes
/// * 9..=15 - CAN-FD, 12, 16, 20, 24, 32, 48 or 64 bytes
pub struct FrameLength(pub u8);

impl FrameLength {
    /// Classic CAN 8 byte frames
    pub const CLASSIC: FrameLength = FrameLength(8);
    /// CAN-FD 64 byte frames
    pub const FD_64: FrameLength = FrameLength(15);

    /// Maximum number of data bytes in a frame of this class.
    /// Returns [None] if the class cannot carry ISO-TP (DLC below 8, or not a DLC at all)
    pub fn max_data_len(&self) -> Option<usize> {
        match self.0 {
            8..=15 => dlc_to_len(self.0),
            _ => None,
        }
    }

    /// True if frames of this class must be sent as CAN-FD
    pub fn is_fd(&self) -> bool {
        self.0 > 8
    }
}

impl Default for FrameLength {
    fn default() -> Self {
        Self::CLASSIC
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// ISO-TP network layer timers
pub struct NetworkTimings {
    /// Sender: time for a frame to be confirmed as transmitted
    pub n_as: Duration,
    /// Receiver: time for a frame (flow control) to be confirmed as transmitted
    pub n_ar: Duration,
    /// Sender: time until reception of the next flow control frame
    pub n_bs: Duration,
    /// Receiver: time until transmission of the next flow control frame
    pub n_br: Duration,
    /// Sender: time until transmission of the next consecutive frame, on top of STmin
    pub n_cs: Duration,
    /// Receiver: time until reception of the next consecutive frame
    pub n_cr: Duration,
}

impl Default for NetworkTimings {
    fn default() -> Self {
        Self {
            n_as: Duration::from_millis(1000),
            n_ar: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_br: Duration::from_millis(50),
            n_cs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Session layer timers
pub struct SessionTimings {
    /// Time for the server to start its response
    pub p2_server: Duration,
    /// Extended server response time after a 'response pending'
    pub p2_server_ex: Duration,
    /// Time the client waits for the start of a response
    pub p2_client: Duration,
    /// Extended client wait time after a 'response pending'
    pub p2_client_ex: Duration,
    /// Client keep-alive interval of a non-default session
    pub s3_client: Duration,
    /// Server timeout of a non-default session
    pub s3_server: Duration,
}

impl SessionTimings {
    /// Builds the timer set from the server side values, deriving the client timers
    /// by adding the worst case network delay to them
    pub fn derived_from_server(
        p2_server: Duration,
        p2_server_ex: Duration,
        network_delay: Duration,
    ) -> Self {
        Self {
            p2_server,
            p2_server_ex,
            p2_client: p2_server + network_delay,
            p2_client_ex: p2_server_ex + network_delay,
            s3_client: Duration::from_millis(2000),
            s3_server: Duration::from_millis(5000),
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::derived_from_server(
            Duration::from_millis(50),
            Duration::from_millis(5000),
            Duration::from_millis(100),
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Flow control reply sent by a node when it receives a First Frame
pub struct FlowControlParams {
    /// Flow status
    pub status: FlowStatus,
    /// Block size. 0 means the sender may send all consecutive frames without waiting
    pub block_size: u8,
    /// Minimum separation time, in raw STmin encoding
    pub st_min: u8,
}

impl Default for FlowControlParams {
    fn default() -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size: 8,
            st_min: 20,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Diagnostic configuration of one logical node
pub struct Target {
    /// Physical request address
    pub physical_address: u32,
    /// Functional (broadcast) request address
    pub functional_address: u32,
    /// Response address
    pub response_address: u32,
    /// Identifiers are 29bit instead of 11bit
    pub extended_ids: bool,
    /// Which side of the conversation this node plays
    pub role: Role,
    /// ISO-TP network layer timers
    pub network: NetworkTimings,
    /// Session layer timers
    pub session: SessionTimings,
    /// Largest frame length class the node may use
    pub frame_length: FrameLength,
    /// Frame padding policy
    pub padding: Padding,
    /// Flow control reply used when receiving segmented transfers
    pub flow_control: FlowControlParams,
    /// Tolerance added to every timeout before it is considered expired
    pub fault_tolerance: Duration,
    /// Largest inbound transfer accepted. Larger First Frames are answered with an overflow
    pub max_rx_payload: usize,
    /// A physical send is only complete once the peer starts responding within P2 client
    pub await_response: bool,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            physical_address: 0x07E0,
            functional_address: 0x07DF,
            response_address: 0x07E8,
            extended_ids: false,
            role: Role::Tester,
            network: NetworkTimings::default(),
            session: SessionTimings::default(),
            frame_length: FrameLength::CLASSIC,
            padding: Padding::Pad(DEFAULT_FILL_BYTE),
            flow_control: FlowControlParams::default(),
            fault_tolerance: Duration::from_millis(10),
            max_rx_payload: 4095,
            await_response: false,
        }
    }
}

impl Target {
    /// Returns a copy of the target with the addressing triple replaced
    pub fn with_addresses(mut self, physical: u32, functional: u32, response: u32) -> Self {
        self.physical_address = physical;
        self.functional_address = functional;
        self.response_address = response;
        self
    }

    /// Rejects configurations the engine cannot operate with
    pub fn validate(&self) -> TransportResult<()> {
        if self.frame_length.max_data_len().is_none() {
            return Err(TransportError::InvalidConfig(format!(
                "frame length class {} is not a DLC between 8 and 15",
                self.frame_length.0
            )));
        }
        if self.physical_address == self.response_address {
            return Err(TransportError::InvalidConfig(format!(
                "physical and response address are both 0x{:04X}",
                self.physical_address
            )));
        }
        let max_id = if self.extended_ids {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        for id in [
            self.physical_address,
            self.functional_address,
            self.response_address,
        ] {
            if id > max_id {
                return Err(TransportError::InvalidConfig(format!(
                    "identifier 0x{id:X} does not fit in a {} bit ID",
                    if self.extended_ids { 29 } else { 11 }
                )));
            }
        }
        if self.max_rx_payload == 0 {
            return Err(TransportError::InvalidConfig(
                "max_rx_payload must be at least 1 byte".into(),
            ));
        }
        Ok(())
    }

    /// Identifier this node transmits data frames on
    pub fn tx_address(&self, mode: AddressingMode) -> u32 {
        match (self.role, mode) {
            (Role::Tester, AddressingMode::Physical) => self.physical_address,
            (Role::Tester, AddressingMode::Functional) => self.functional_address,
            (Role::Ecu, _) => self.response_address,
        }
    }

    /// Identifier the peer sends flow control on, for transfers this node transmits
    pub fn flow_control_source(&self) -> u32 {
        match self.role {
            Role::Tester => self.response_address,
            Role::Ecu => self.physical_address,
        }
    }

    /// Identifier this node sends its flow control replies on
    pub fn flow_control_address(&self) -> u32 {
        match self.role {
            Role::Tester => self.physical_address,
            Role::Ecu => self.response_address,
        }
    }

    /// Addressing mode of an inbound frame, or [None] if the identifier isn't one
    /// this node receives on
    pub fn rx_addressing(&self, id: u32) -> Option<AddressingMode> {
        match self.role {
            Role::Tester if id == self.response_address => Some(AddressingMode::Physical),
            Role::Ecu if id == self.physical_address => Some(AddressingMode::Physical),
            Role::Ecu if id == self.functional_address => Some(AddressingMode::Functional),
            _ => None,
        }
    }
}
