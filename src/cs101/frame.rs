//! FT1.2 frames of IEC 60870-5-101 (IEC 60870-5-1/-2).
//!
//! ```text
//! single character:  E5
//! fixed length:      10 | C | A.. | CS | 16
//! variable length:   68 | L | L | 68 | C | A.. | ASDU | CS | 16
//! ```
//!
//! `CS` is the sum modulo 256 of the control field, the link address and the
//! user data. `L` counts the same bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::error::{Iec60870Error, Result};

/// Single character acknowledgment.
pub const SINGLE_CHAR: u8 = 0xE5;

/// Start byte of a fixed length frame.
pub const FIXED_START: u8 = 0x10;

/// Start byte of a variable length frame.
pub const VARIABLE_START: u8 = 0x68;

/// End byte of fixed and variable length frames.
pub const END_BYTE: u8 = 0x16;

const PRM: u8 = 0x40;
const FCB_ACD: u8 = 0x20;
const FCV_DFC: u8 = 0x10;

/// Function codes sent by the primary (initiating) station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryFunction {
    /// Reset of remote link
    ResetRemoteLink = 0,
    /// Reset of user process
    ResetUserProcess = 1,
    /// Test function for link
    TestFunctionLink = 2,
    /// User data, confirm expected
    UserDataConfirmed = 3,
    /// User data, no reply expected
    UserDataNoReply = 4,
    /// Request for access demand
    RequestAccessDemand = 8,
    /// Request status of link
    RequestLinkStatus = 9,
    /// Request user data class 1
    RequestClass1 = 10,
    /// Request user data class 2
    RequestClass2 = 11,
}

impl PrimaryFunction {
    /// Parse a primary function code.
    pub fn from_u8(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::ResetRemoteLink,
            1 => Self::ResetUserProcess,
            2 => Self::TestFunctionLink,
            3 => Self::UserDataConfirmed,
            4 => Self::UserDataNoReply,
            8 => Self::RequestAccessDemand,
            9 => Self::RequestLinkStatus,
            10 => Self::RequestClass1,
            11 => Self::RequestClass2,
            other => {
                return Err(Iec60870Error::link_layer(format!(
                    "unknown primary function {}",
                    other
                )))
            }
        })
    }

    /// True for functions that use the frame count bit (FCV=1).
    pub const fn uses_fcb(self) -> bool {
        matches!(
            self,
            Self::TestFunctionLink
                | Self::UserDataConfirmed
                | Self::RequestClass1
                | Self::RequestClass2
        )
    }
}

/// Function codes sent by the secondary (responding) station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryFunction {
    /// Positive acknowledgment
    Ack = 0,
    /// Message not accepted, link busy
    Nack = 1,
    /// User data
    RespUserData = 8,
    /// Requested data not available
    RespNackNoData = 9,
    /// Status of link or access demand
    StatusOfLink = 11,
    /// Link service not functioning
    LinkServiceNotFunctioning = 14,
    /// Link service not implemented
    LinkServiceNotImplemented = 15,
}

impl SecondaryFunction {
    /// Parse a secondary function code.
    pub fn from_u8(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Ack,
            1 => Self::Nack,
            8 => Self::RespUserData,
            9 => Self::RespNackNoData,
            11 => Self::StatusOfLink,
            14 => Self::LinkServiceNotFunctioning,
            15 => Self::LinkServiceNotImplemented,
            other => {
                return Err(Iec60870Error::link_layer(format!(
                    "unknown secondary function {}",
                    other
                )))
            }
        })
    }
}

/// Link control field.
///
/// Primary frames carry PRM=1, FCB and FCV; secondary frames carry PRM=0,
/// ACD and DFC in the same bit positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField(pub u8);

impl ControlField {
    /// Control field of a primary frame.
    pub const fn primary(function: PrimaryFunction, fcb: bool) -> Self {
        let mut raw = PRM | function as u8;
        if function.uses_fcb() {
            raw |= FCV_DFC;
            if fcb {
                raw |= FCB_ACD;
            }
        }
        Self(raw)
    }

    /// Control field of a secondary frame.
    pub const fn secondary(function: SecondaryFunction, acd: bool, dfc: bool) -> Self {
        let mut raw = function as u8;
        if acd {
            raw |= FCB_ACD;
        }
        if dfc {
            raw |= FCV_DFC;
        }
        Self(raw)
    }

    /// True if sent by the primary station.
    pub const fn is_primary(self) -> bool {
        self.0 & PRM != 0
    }

    /// Frame count bit (primary).
    pub const fn fcb(self) -> bool {
        self.0 & FCB_ACD != 0
    }

    /// Frame count bit valid (primary).
    pub const fn fcv(self) -> bool {
        self.0 & FCV_DFC != 0
    }

    /// Access demand: class 1 data available (secondary).
    pub const fn acd(self) -> bool {
        self.0 & FCB_ACD != 0
    }

    /// Data flow control: further messages may overflow (secondary).
    pub const fn dfc(self) -> bool {
        self.0 & FCV_DFC != 0
    }

    /// Raw function code (low nibble).
    pub const fn function_code(self) -> u8 {
        self.0 & 0x0F
    }

    /// Primary function of this field.
    pub fn primary_function(self) -> Result<PrimaryFunction> {
        PrimaryFunction::from_u8(self.function_code())
    }

    /// Secondary function of this field.
    pub fn secondary_function(self) -> Result<SecondaryFunction> {
        SecondaryFunction::from_u8(self.function_code())
    }
}

/// One FT1.2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ft12Frame {
    /// Single character acknowledgment (0xE5)
    SingleChar,
    /// Fixed length frame
    Fixed {
        /// Control field
        control: ControlField,
        /// Link address
        address: u16,
    },
    /// Variable length frame carrying an ASDU
    Variable {
        /// Control field
        control: ControlField,
        /// Link address
        address: u16,
        /// Encoded ASDU
        asdu: Bytes,
    },
}

impl Ft12Frame {
    /// Control field, if the frame has one.
    pub fn control(&self) -> Option<ControlField> {
        match self {
            Self::SingleChar => None,
            Self::Fixed { control, .. } | Self::Variable { control, .. } => Some(*control),
        }
    }

    /// Link address, if the frame has one.
    pub fn address(&self) -> Option<u16> {
        match self {
            Self::SingleChar => None,
            Self::Fixed { address, .. } | Self::Variable { address, .. } => Some(*address),
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// FT1.2 codec for `tokio_util::codec::Framed`.
#[derive(Debug, Clone, Copy)]
pub struct Ft12Codec {
    address_length: u8,
}

impl Ft12Codec {
    /// Create a codec for link addresses of `address_length` bytes (0..=2).
    pub fn new(address_length: u8) -> Self {
        Self {
            address_length: address_length.min(2),
        }
    }

    fn read_address(&self, bytes: &[u8]) -> u16 {
        match self.address_length {
            0 => 0,
            1 => bytes[0] as u16,
            _ => u16::from_le_bytes([bytes[0], bytes[1]]),
        }
    }

    fn write_address(&self, dst: &mut BytesMut, address: u16) -> Result<()> {
        match self.address_length {
            0 => {}
            1 => {
                let address = u8::try_from(address).map_err(|_| {
                    Iec60870Error::link_layer(format!("link address {} exceeds one byte", address))
                })?;
                dst.put_u8(address);
            }
            _ => dst.put_u16_le(address),
        }
        Ok(())
    }
}

impl Default for Ft12Codec {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Decoder for Ft12Codec {
    type Item = Ft12Frame;
    type Error = Iec60870Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let al = self.address_length as usize;
        loop {
            let skip = src
                .iter()
                .position(|b| matches!(*b, SINGLE_CHAR | FIXED_START | VARIABLE_START))
                .unwrap_or(src.len());
            if skip > 0 {
                trace!(skipped = skip, "discarding bytes before frame start");
                src.advance(skip);
            }
            let Some(&start) = src.first() else {
                return Ok(None);
            };

            match start {
                SINGLE_CHAR => {
                    src.advance(1);
                    return Ok(Some(Ft12Frame::SingleChar));
                }
                FIXED_START => {
                    let total = 4 + al;
                    if src.len() < total {
                        return Ok(None);
                    }
                    let body = &src[1..2 + al];
                    if src[2 + al] != checksum(body) || src[3 + al] != END_BYTE {
                        warn!("invalid fixed frame, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    let control = ControlField(body[0]);
                    let address = self.read_address(&body[1..]);
                    src.advance(total);
                    return Ok(Some(Ft12Frame::Fixed { control, address }));
                }
                _ => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let length = src[1] as usize;
                    if src[2] != src[1] || src[3] != VARIABLE_START || length < 1 + al {
                        warn!(length, "invalid variable frame header, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    let total = 4 + length + 2;
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }
                    let body = &src[4..4 + length];
                    if src[4 + length] != checksum(body) || src[5 + length] != END_BYTE {
                        warn!(length, "invalid variable frame checksum, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    let control = ControlField(body[0]);
                    let address = self.read_address(&body[1..]);
                    let asdu = Bytes::copy_from_slice(&body[1 + al..]);
                    src.advance(total);
                    return Ok(Some(Ft12Frame::Variable {
                        control,
                        address,
                        asdu,
                    }));
                }
            }
        }
    }
}

impl Encoder<Ft12Frame> for Ft12Codec {
    type Error = Iec60870Error;

    fn encode(&mut self, item: Ft12Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let al = self.address_length as usize;
        match item {
            Ft12Frame::SingleChar => dst.put_u8(SINGLE_CHAR),
            Ft12Frame::Fixed { control, address } => {
                let mut body = BytesMut::with_capacity(1 + al);
                body.put_u8(control.0);
                self.write_address(&mut body, address)?;
                dst.reserve(4 + al);
                dst.put_u8(FIXED_START);
                dst.put_slice(&body);
                dst.put_u8(checksum(&body));
                dst.put_u8(END_BYTE);
            }
            Ft12Frame::Variable {
                control,
                address,
                asdu,
            } => {
                let length = 1 + al + asdu.len();
                if length > u8::MAX as usize {
                    return Err(Iec60870Error::AsduTooLarge {
                        size: asdu.len(),
                        max: u8::MAX as usize - 1 - al,
                    });
                }
                let mut body = BytesMut::with_capacity(length);
                body.put_u8(control.0);
                self.write_address(&mut body, address)?;
                body.put_slice(&asdu);
                dst.reserve(length + 6);
                dst.put_u8(VARIABLE_START);
                dst.put_u8(length as u8);
                dst.put_u8(length as u8);
                dst.put_u8(VARIABLE_START);
                dst.put_slice(&body);
                dst.put_u8(checksum(&body));
                dst.put_u8(END_BYTE);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &mut Ft12Codec, frame: Ft12Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_control_field_bits() {
        let c = ControlField::primary(PrimaryFunction::RequestClass2, true);
        assert_eq!(c.0, 0x7B);
        assert!(c.is_primary() && c.fcb() && c.fcv());

        let c = ControlField::primary(PrimaryFunction::RequestLinkStatus, true);
        assert_eq!(c.0, 0x49);
        assert!(!c.fcv());

        let c = ControlField::secondary(SecondaryFunction::RespUserData, true, false);
        assert_eq!(c.0, 0x28);
        assert!(!c.is_primary() && c.acd() && !c.dfc());
        assert_eq!(c.secondary_function().unwrap(), SecondaryFunction::RespUserData);

        assert!(PrimaryFunction::from_u8(5).is_err());
    }

    #[test]
    fn test_fixed_frame() {
        let mut codec = Ft12Codec::new(1);
        let frame = Ft12Frame::Fixed {
            control: ControlField::primary(PrimaryFunction::RequestLinkStatus, false),
            address: 3,
        };
        let mut buf = encode(&mut codec, frame.clone());
        assert_eq!(&buf[..], &[0x10, 0x49, 0x03, 0x4C, 0x16]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_variable_frame_two_byte_address() {
        let mut codec = Ft12Codec::new(2);
        let frame = Ft12Frame::Variable {
            control: ControlField::primary(PrimaryFunction::UserDataConfirmed, true),
            address: 0x0102,
            asdu: Bytes::from_static(&[0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x14]),
        };
        let mut buf = encode(&mut codec, frame.clone());
        assert_eq!(&buf[..4], &[0x68, 13, 13, 0x68]);
        assert_eq!(buf[buf.len() - 1], END_BYTE);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_partial_and_single_char() {
        let mut codec = Ft12Codec::new(1);
        let mut buf = BytesMut::from(&[0xE5, 0x10, 0x49][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ft12Frame::SingleChar));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x03, 0x4C, 0x16]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Ft12Frame::Fixed { address: 3, .. })
        ));
    }

    #[test]
    fn test_resync_after_bad_checksum() {
        let mut codec = Ft12Codec::new(1);
        let mut buf = BytesMut::from(&[0x00, 0x10, 0x49, 0x03, 0x00, 0x16, 0x10, 0x0B, 0x01, 0x0C, 0x16][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Ft12Frame::Fixed {
                control: ControlField::secondary(SecondaryFunction::StatusOfLink, false, false),
                address: 1,
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_address_overflow() {
        let mut codec = Ft12Codec::new(1);
        let frame = Ft12Frame::Fixed {
            control: ControlField::primary(PrimaryFunction::ResetRemoteLink, false),
            address: 300,
        };
        assert!(codec.encode(frame, &mut BytesMut::new()).is_err());
    }
}
