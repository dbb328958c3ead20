#![warn(
    missing_docs,
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! An event driven ISO-TP (ISO15765-2) transport engine, for carrying diagnostic payloads
//! larger than a single CAN frame.
//!
//! ## How it works
//!
//! The engine owns no hardware and spawns no threads. It is handed a [channel::CanBus] to
//! transmit on, and is driven by whoever reads the bus:
//!
//! * Every frame seen on the bus is passed to [TransportEngine::on_frame]. This includes the
//!   engine's own transmissions, which serve as transmit confirmation.
//! * The current time is passed to [TransportEngine::on_tick] periodically, which expires
//!   the ISO-TP timers.
//!
//! Internally, every in flight transfer is a [session::Session]. Outbound sessions are driven
//! by a [transmitter::Transmitter], inbound ones by the node's [receiver::Receiver], both of
//! which are listeners on the engine's [event_bus::EventBus].
//!
//! ## Nodes
//!
//! A node is one logical diagnostic endpoint, configured with a [config::Target]. A node can
//! act as a tester (sending requests, receiving responses) or as an ECU (receiving requests,
//! sending responses), so that both ends of a conversation can be simulated with the same
//! engine.
//!
//! ## Threading
//!
//! [TransportEngine] is single threaded. [DiagTransport] wraps one in an `Arc<Mutex<_>>`, and
//! lets callers block on [DiagTransport::wait_for_completion] without holding the lock.

pub mod channel;
pub mod codec;
pub mod config;
pub mod event_bus;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod simulation;
pub mod transmitter;

use channel::ChannelError;
use codec::CodecError;
use session::{NodeHandle, TransferId};

pub use config::Target;
pub use registry::{DiagTransport, InboundTransfer, TransportEngine};
pub use session::{Completion, ErrorFlags, SessionState};

/// Transport result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
/// Errors returned to callers of the transport.
///
/// Protocol failures of an outbound transfer are not errors here, they are reported as
/// [Completion::Failed] with the reason in [ErrorFlags]. Inbound transfers have nobody waiting
/// on their ID, so their failures come out of the node's inbound queue as
/// [TransportError::InboundFailed]
pub enum TransportError {
    /// No node with this handle
    #[error("Node {0} does not exist")]
    InvalidNode(NodeHandle),
    /// A node with this handle is already registered
    #[error("Node {0} already exists")]
    NodeExists(NodeHandle),
    /// No transfer with this ID, or it was already reclaimed
    #[error("Transfer {0} does not exist")]
    UnknownTransfer(TransferId),
    /// The node is still sending another transfer
    #[error("Node {node} is still sending transfer {active}")]
    NodeBusy {
        /// Node the send was for
        node: NodeHandle,
        /// Transfer in flight
        active: TransferId,
    },
    /// Target configuration rejected
    #[error("Invalid target configuration: {0}")]
    InvalidConfig(String),
    /// Payload cannot be encoded
    #[error("Payload cannot be encoded")]
    Codec(
        #[from]
        #[source]
        CodecError,
    ),
    /// Functional transfers must fit in a single frame
    #[error("Functional payload of {len} bytes exceeds the single frame limit of {max}")]
    FunctionalTooLong {
        /// Payload length
        len: usize,
        /// Largest single frame payload
        max: usize,
    },
    /// Transfer did not finish before the wait timed out. It is still in flight
    #[error("Timeout waiting for transfer {0}")]
    WaitTimeout(TransferId),
    /// Nothing was received by the node before the wait timed out
    #[error("Timeout waiting for a transfer to node {0}")]
    InboundTimeout(NodeHandle),
    /// An inbound transfer to the node was abandoned before it was fully received
    #[error("Inbound transfer {id} failed: {errors:?}")]
    InboundFailed {
        /// Transfer ID the reception ran under
        id: TransferId,
        /// Why it failed
        errors: ErrorFlags,
    },
    /// Another caller is already waiting on this transfer
    #[error("Transfer {0} is already being waited on")]
    AlreadyWaiting(TransferId),
    /// Transfer was dropped before finishing, because its node was removed
    #[error("Transfer {0} was aborted")]
    TransferAborted(TransferId),
    /// Error with the underlying bus
    #[error("Bus error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
    /// A thread panicked while holding the engine
    #[error("Transport engine lock was poisoned")]
    Poisoned,
}
