//! APCI (Application Protocol Control Information).
//!
//! The 6-byte header of a CS104 APDU, containing the frame format and
//! sequence numbers.

use crate::error::{Iec60870Error, Result};

/// Start byte for CS104 frames.
pub const START_BYTE: u8 = 0x68;

/// Minimum APDU length (APCI only, no ASDU).
pub const MIN_APDU_LENGTH: usize = 4;

/// Maximum APDU length.
pub const MAX_APDU_LENGTH: usize = 253;

/// Sequence numbers count modulo 2^15.
pub const SEQ_MODULO: u16 = 32768;

/// Advance a sequence number by one.
#[inline]
pub const fn seq_next(seq: u16) -> u16 {
    seq.wrapping_add(1) & (SEQ_MODULO - 1)
}

/// Number of steps from `from` forward to `to`, modulo 2^15.
#[inline]
pub const fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from) & (SEQ_MODULO - 1)
}

/// APCI frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// I format: numbered information transfer
    IFrame,
    /// S format: numbered supervisory (acknowledgment)
    SFrame,
    /// U format: unnumbered control
    UFrame,
}

/// U-frame function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UFunction {
    /// STARTDT act
    StartDtAct,
    /// STARTDT con
    StartDtCon,
    /// STOPDT act
    StopDtAct,
    /// STOPDT con
    StopDtCon,
    /// TESTFR act
    TestFrAct,
    /// TESTFR con
    TestFrCon,
}

impl UFunction {
    /// Control field byte for this U-function.
    #[inline]
    pub const fn control_byte(&self) -> u8 {
        match self {
            Self::StartDtAct => 0x07,
            Self::StartDtCon => 0x0B,
            Self::StopDtAct => 0x13,
            Self::StopDtCon => 0x23,
            Self::TestFrAct => 0x43,
            Self::TestFrCon => 0x83,
        }
    }

    /// Parse U-function from control byte.
    #[inline]
    pub fn from_control_byte(byte: u8) -> Result<Self> {
        match byte {
            0x07 => Ok(Self::StartDtAct),
            0x0B => Ok(Self::StartDtCon),
            0x13 => Ok(Self::StopDtAct),
            0x23 => Ok(Self::StopDtCon),
            0x43 => Ok(Self::TestFrAct),
            0x83 => Ok(Self::TestFrCon),
            _ => Err(Iec60870Error::invalid_frame(format!(
                "unknown U-frame function 0x{:02X}",
                byte
            ))),
        }
    }

    /// The confirmation that answers this activation, if any.
    #[inline]
    pub const fn confirmation(&self) -> Option<Self> {
        match self {
            Self::StartDtAct => Some(Self::StartDtCon),
            Self::StopDtAct => Some(Self::StopDtCon),
            Self::TestFrAct => Some(Self::TestFrCon),
            _ => None,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::StartDtAct => "STARTDT act",
            Self::StartDtCon => "STARTDT con",
            Self::StopDtAct => "STOPDT act",
            Self::StopDtCon => "STOPDT con",
            Self::TestFrAct => "TESTFR act",
            Self::TestFrCon => "TESTFR con",
        }
    }
}

/// APCI control field.
///
/// ```text
/// +--------+--------+--------+--------+--------+--------+
/// | 0x68   | Length | CF1    | CF2    | CF3    | CF4    |
/// +--------+--------+--------+--------+--------+--------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apci {
    /// I-frame with send and receive sequence numbers.
    IFrame {
        /// Send sequence number N(S)
        send_seq: u16,
        /// Receive sequence number N(R)
        recv_seq: u16,
    },
    /// S-frame with receive sequence number only.
    SFrame {
        /// Receive sequence number N(R)
        recv_seq: u16,
    },
    /// U-frame with function code.
    UFrame {
        /// U-frame function
        function: UFunction,
    },
}

impl Apci {
    /// Create an I-frame APCI.
    #[inline]
    pub fn i_frame(send_seq: u16, recv_seq: u16) -> Self {
        Self::IFrame { send_seq, recv_seq }
    }

    /// Create an S-frame APCI.
    #[inline]
    pub fn s_frame(recv_seq: u16) -> Self {
        Self::SFrame { recv_seq }
    }

    /// Create a U-frame APCI.
    #[inline]
    pub fn u_frame(function: UFunction) -> Self {
        Self::UFrame { function }
    }

    /// Get the frame format.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::IFrame { .. } => FrameType::IFrame,
            Self::SFrame { .. } => FrameType::SFrame,
            Self::UFrame { .. } => FrameType::UFrame,
        }
    }

    /// Parse the 4-byte control field.
    #[inline]
    pub fn parse(control: &[u8]) -> Result<Self> {
        if control.len() < 4 {
            return Err(Iec60870Error::invalid_frame("control field too short"));
        }

        let recv_seq = || (u16::from(control[3]) << 7) | u16::from(control[2] >> 1);

        match control[0] & 0x03 {
            0x00 | 0x02 => Ok(Self::IFrame {
                send_seq: (u16::from(control[1]) << 7) | u16::from(control[0] >> 1),
                recv_seq: recv_seq(),
            }),
            0x01 => Ok(Self::SFrame {
                recv_seq: recv_seq(),
            }),
            _ => Ok(Self::UFrame {
                function: UFunction::from_control_byte(control[0])?,
            }),
        }
    }

    /// Encode the 4-byte control field.
    #[inline]
    pub fn encode(&self) -> [u8; 4] {
        let seq = |n: u16| [((n & 0x7F) << 1) as u8, ((n >> 7) & 0xFF) as u8];
        match self {
            Self::IFrame { send_seq, recv_seq } => {
                let [s1, s2] = seq(*send_seq);
                let [r1, r2] = seq(*recv_seq);
                [s1, s2, r1, r2]
            }
            Self::SFrame { recv_seq } => {
                let [r1, r2] = seq(*recv_seq);
                [0x01, 0x00, r1, r2]
            }
            Self::UFrame { function } => [function.control_byte(), 0x00, 0x00, 0x00],
        }
    }

    /// Encode the 6-byte APDU header for an ASDU of `asdu_len` bytes.
    #[inline]
    pub fn encode_header(&self, asdu_len: usize) -> [u8; 6] {
        let [c1, c2, c3, c4] = self.encode();
        [START_BYTE, (MIN_APDU_LENGTH + asdu_len) as u8, c1, c2, c3, c4]
    }

    /// Check if this is an I-frame.
    #[inline]
    pub fn is_i_frame(&self) -> bool {
        matches!(self, Self::IFrame { .. })
    }

    /// Check if this is an S-frame.
    #[inline]
    pub fn is_s_frame(&self) -> bool {
        matches!(self, Self::SFrame { .. })
    }

    /// Check if this is a U-frame.
    #[inline]
    pub fn is_u_frame(&self) -> bool {
        matches!(self, Self::UFrame { .. })
    }

    /// Send sequence number (I-frame only).
    #[inline]
    pub fn send_seq(&self) -> Option<u16> {
        match self {
            Self::IFrame { send_seq, .. } => Some(*send_seq),
            _ => None,
        }
    }

    /// Receive sequence number (I-frame and S-frame).
    #[inline]
    pub fn recv_seq(&self) -> Option<u16> {
        match self {
            Self::IFrame { recv_seq, .. } | Self::SFrame { recv_seq } => Some(*recv_seq),
            _ => None,
        }
    }
}

impl std::fmt::Display for Apci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IFrame { send_seq, recv_seq } => write!(f, "I(S={}, R={})", send_seq, recv_seq),
            Self::SFrame { recv_seq } => write!(f, "S(R={})", recv_seq),
            Self::UFrame { function } => write!(f, "U({})", function.name()),
        }
    }
}
