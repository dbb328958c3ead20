//! ISO-TP frame codec
//!
//! Translates between a [Session]'s payload + cursor and individual CAN frames, and classifies
//! inbound frames by their protocol control information (PCI).
//!
//! | PCI nibble | Frame             | Layout                                            |
//! |------------|-------------------|---------------------------------------------------|
//! | `0x0`      | Single            | `[0x0L, data..]` or (CAN-FD) `[0x00, LL, data..]` |
//! | `0x1`      | First             | `[0x1L, LL, data..]` or `[0x10, 0x00, L32 BE, data..]` |
//! | `0x2`      | Consecutive       | `[0x2N, data..]`                                  |
//! | `0x3`      | Flow control      | `[0x3S, BS, STmin]`                               |

use std::time::Duration;

use log::debug;

use crate::{
    channel::{CanFrame, FrameFlags},
    config::{FlowControlParams, Padding, Target},
    session::Session,
};

/// Codec result
pub type CodecResult<T> = Result<T, CodecError>;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Largest length which fits in the 12 bit First Frame length field
pub const MAX_SHORT_FF_LEN: usize = 0x0FFF;

const DLC_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Reasons a payload cannot be represented under a target's configuration
pub enum CodecError {
    /// The frame length class is not a usable DLC
    #[error("Frame length class {0} cannot carry ISO-TP frames")]
    InvalidFrameLength(u8),
    /// Payload does not fit in the 32 bit First Frame length escape
    #[error("Payload of {0} bytes is too large for ISO-TP")]
    PayloadTooLarge(usize),
    /// Zero length payloads cannot be sent
    #[error("Payload is empty")]
    EmptyPayload,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Flow status of a flow control frame
pub enum FlowStatus {
    /// Sender may continue with the next block
    ContinueToSend,
    /// Sender must wait for another flow control frame
    Wait,
    /// Receiver cannot take the transfer
    Overflow,
    /// Reserved status nibble
    #[strum(disabled)]
    Reserved(u8),
}

impl FlowStatus {
    /// Status nibble
    pub fn nibble(&self) -> u8 {
        match self {
            FlowStatus::ContinueToSend => 0x0,
            FlowStatus::Wait => 0x1,
            FlowStatus::Overflow => 0x2,
            FlowStatus::Reserved(x) => *x & 0x0F,
        }
    }
}

impl From<u8> for FlowStatus {
    fn from(nibble: u8) -> Self {
        match nibble & 0x0F {
            0x0 => FlowStatus::ContinueToSend,
            0x1 => FlowStatus::Wait,
            0x2 => FlowStatus::Overflow,
            x => FlowStatus::Reserved(x),
        }
    }
}

/// Decoded view of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci<'a> {
    /// Complete payload in one frame
    Single {
        /// Payload length
        len: usize,
        /// Payload
        data: &'a [u8],
    },
    /// Start of a segmented transfer
    First {
        /// Total payload length announced
        len: usize,
        /// First slice of the payload
        data: &'a [u8],
    },
    /// Continuation of a segmented transfer
    Consecutive {
        /// 4 bit sequence number
        sn: u8,
        /// Payload slice. May include padding on the last frame
        data: &'a [u8],
    },
    /// Flow control from the receiver of a segmented transfer
    FlowControl {
        /// Flow status
        status: FlowStatus,
        /// Block size
        block_size: u8,
        /// Raw STmin
        st_min: u8,
    },
    /// Not an ISO-TP frame
    Unrecognized,
}

/// Data length of a DLC code
pub fn dlc_to_len(dlc: u8) -> Option<usize> {
    DLC_LENGTHS.get(dlc as usize).copied()
}

/// Smallest DLC code that can carry `len` bytes
pub fn len_to_dlc(len: usize) -> Option<u8> {
    DLC_LENGTHS
        .iter()
        .position(|l| *l >= len)
        .map(|dlc| dlc as u8)
}

/// Length a frame with `used` bytes is sent with, under the padding policy
pub fn padded_len(used: usize, padding: Padding) -> usize {
    let min = match padding {
        Padding::Pad(_) => used.max(8),
        Padding::NoPad => used,
    };
    if min <= 8 {
        min
    } else {
        len_to_dlc(min)
            .and_then(dlc_to_len)
            .unwrap_or(crate::channel::MAX_FRAME_DATA)
    }
}

/// Largest payload which fits a Single Frame of `frame_len` bytes
pub fn max_single_frame_payload(frame_len: usize) -> usize {
    if frame_len <= 8 {
        frame_len.saturating_sub(1)
    } else {
        frame_len.saturating_sub(2)
    }
}

/// Converts a raw STmin byte into a duration.
/// Reserved values are treated as the largest valid value (127ms)
pub fn st_min_to_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw as u64 - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Converts a duration into the nearest raw STmin byte, clamping to 127ms
pub fn duration_to_st_min(duration: Duration) -> u8 {
    let micros = duration.as_micros();
    if micros == 0 {
        0
    } else if micros < 1000 {
        0xF0 + (micros.div_ceil(100)).min(9) as u8
    } else {
        duration.as_millis().min(0x7F) as u8
    }
}

fn frame_len_of(target: &Target) -> CodecResult<usize> {
    target
        .frame_length
        .max_data_len()
        .ok_or(CodecError::InvalidFrameLength(target.frame_length.0))
}

/// Checks that a payload can be transferred under a target's configuration
pub fn validate_payload(len: usize, target: &Target) -> CodecResult<()> {
    frame_len_of(target)?;
    if len == 0 {
        return Err(CodecError::EmptyPayload);
    }
    if len as u64 > u32::MAX as u64 {
        return Err(CodecError::PayloadTooLarge(len));
    }
    Ok(())
}

fn build_frame(id: u32, mut buf: Vec<u8>, target: &Target) -> CanFrame {
    let len = padded_len(buf.len(), target.padding);
    buf.resize(len, target.padding.fill_byte());
    let frame = CanFrame::new(id, &buf);
    if target.frame_length.is_fd() {
        frame.with_flags(FrameFlags::FD)
    } else {
        frame
    }
}

/// Encodes the whole payload as a Single Frame.
///
/// Returns [None] if the payload is too large for one frame, or the session has already
/// started segmenting.
pub fn encode_single_frame(session: &mut Session, target: &Target) -> CodecResult<Option<CanFrame>> {
    let frame_len = frame_len_of(target)?;
    let len = session.payload_len();
    if session.cursor() != 0 || session.is_segmented() || len > max_single_frame_payload(frame_len) {
        return Ok(None);
    }
    let mut buf = Vec::with_capacity(frame_len);
    if len <= 7 {
        buf.push(PCI_SINGLE | len as u8);
    } else {
        buf.push(PCI_SINGLE);
        buf.push(len as u8);
    }
    buf.extend_from_slice(session.unsent());
    session.advance(len);
    session.set_segmented();
    Ok(Some(build_frame(
        target.tx_address(session.addressing()),
        buf,
        target,
    )))
}

/// Encodes the First Frame of a segmented transfer.
///
/// Returns [None] if the payload fits a Single Frame, or the First Frame was already produced.
pub fn encode_first_frame(session: &mut Session, target: &Target) -> CodecResult<Option<CanFrame>> {
    let frame_len = frame_len_of(target)?;
    let len = session.payload_len();
    if session.cursor() != 0 || len <= max_single_frame_payload(frame_len) {
        return Ok(None);
    }
    let mut buf = Vec::with_capacity(frame_len);
    if len <= MAX_SHORT_FF_LEN {
        buf.push(PCI_FIRST | ((len >> 8) & 0x0F) as u8);
        buf.push((len & 0xFF) as u8);
    } else {
        let escaped = u32::try_from(len).map_err(|_| CodecError::PayloadTooLarge(len))?;
        buf.push(PCI_FIRST);
        buf.push(0x00);
        buf.extend_from_slice(&escaped.to_be_bytes());
    }
    let chunk = (frame_len - buf.len()).min(len);
    buf.extend_from_slice(&session.unsent()[..chunk]);
    session.advance(chunk);
    session.reset_sequence();
    Ok(Some(build_frame(
        target.tx_address(session.addressing()),
        buf,
        target,
    )))
}

/// Encodes the next Consecutive Frame. The last one marks the session as segmented.
///
/// Returns [None] before the First Frame, or once everything has been segmented.
pub fn encode_consecutive_frame(
    session: &mut Session,
    target: &Target,
) -> CodecResult<Option<CanFrame>> {
    let frame_len = frame_len_of(target)?;
    if session.cursor() == 0 || session.remaining() == 0 || session.is_segmented() {
        return Ok(None);
    }
    let sn = session.next_sequence();
    let chunk = (frame_len - 1).min(session.remaining());
    let mut buf = Vec::with_capacity(frame_len);
    buf.push(PCI_CONSECUTIVE | sn);
    buf.extend_from_slice(&session.unsent()[..chunk]);
    session.advance(chunk);
    if session.remaining() == 0 {
        session.set_segmented();
    }
    Ok(Some(build_frame(
        target.tx_address(session.addressing()),
        buf,
        target,
    )))
}

/// Produces the next frame of an outbound session, choosing the frame type from the
/// cursor and payload length
pub fn encode_next(session: &mut Session, target: &Target) -> CodecResult<Option<CanFrame>> {
    let frame_len = frame_len_of(target)?;
    if session.is_segmented() {
        return Ok(None);
    }
    match session.cursor() {
        0 if session.payload_len() <= max_single_frame_payload(frame_len) => {
            encode_single_frame(session, target)
        }
        0 => encode_first_frame(session, target),
        _ => encode_consecutive_frame(session, target),
    }
}

/// Encodes a flow control frame
pub fn encode_flow_control(
    id: u32,
    params: FlowControlParams,
    target: &Target,
) -> CodecResult<CanFrame> {
    frame_len_of(target)?;
    let buf = vec![
        PCI_FLOW_CONTROL | params.status.nibble(),
        params.block_size,
        params.st_min,
    ];
    Ok(build_frame(id, buf, target))
}

/// Classifies an inbound frame
pub fn decode(frame: &CanFrame) -> Pci<'_> {
    let data = frame.data();
    let Some(pci) = data.first() else {
        return Pci::Unrecognized;
    };
    match pci & 0xF0 {
        PCI_SINGLE => {
            let nibble = (pci & 0x0F) as usize;
            let (len, start) = if nibble == 0 && data.len() > 8 {
                (data.get(1).copied().unwrap_or(0) as usize, 2)
            } else {
                (nibble, 1)
            };
            if len == 0 || data.len() < start + len {
                debug!("Malformed single frame {data:02X?}");
                return Pci::Unrecognized;
            }
            Pci::Single {
                len,
                data: &data[start..start + len],
            }
        }
        PCI_FIRST => {
            if data.len() < 2 {
                return Pci::Unrecognized;
            }
            let short = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
            if short != 0 {
                return Pci::First {
                    len: short,
                    data: &data[2..],
                };
            }
            if data.len() < 6 {
                return Pci::Unrecognized;
            }
            let len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
            if len <= MAX_SHORT_FF_LEN {
                debug!("First frame escape used for short length {len}");
            }
            Pci::First {
                len,
                data: &data[6..],
            }
        }
        PCI_CONSECUTIVE => Pci::Consecutive {
            sn: pci & 0x0F,
            data: &data[1..],
        },
        PCI_FLOW_CONTROL => {
            if data.len() < 3 {
                return Pci::Unrecognized;
            }
            Pci::FlowControl {
                status: FlowStatus::from(pci & 0x0F),
                block_size: data[1],
                st_min: data[2],
            }
        }
        _ => Pci::Unrecognized,
    }
}
