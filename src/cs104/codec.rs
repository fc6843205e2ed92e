//! CS104 APDU codec for tokio.
//!
//! Frames and parses APDUs with the tokio-util codec framework.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::apci::{Apci, UFunction, MAX_APDU_LENGTH, MIN_APDU_LENGTH, START_BYTE};
use crate::error::Iec60870Error;
use crate::params::AppLayerParameters;
use crate::types::Asdu;

/// A CS104 APDU (Application Protocol Data Unit).
///
/// Contains the APCI header and, for I-frames, the ASDU. A received I-frame
/// whose payload cannot be decoded carries `asdu: None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Apdu {
    /// APCI (Application Protocol Control Information)
    pub apci: Apci,
    /// ASDU (Application Service Data Unit), I-frames only
    pub asdu: Option<Asdu>,
}

impl Apdu {
    /// Create an I-frame APDU with ASDU.
    pub fn i_frame(send_seq: u16, recv_seq: u16, asdu: Asdu) -> Self {
        Self {
            apci: Apci::i_frame(send_seq, recv_seq),
            asdu: Some(asdu),
        }
    }

    /// Create an S-frame APDU.
    pub fn s_frame(recv_seq: u16) -> Self {
        Self {
            apci: Apci::s_frame(recv_seq),
            asdu: None,
        }
    }

    /// Create a U-frame APDU.
    pub fn u_frame(function: UFunction) -> Self {
        Self {
            apci: Apci::u_frame(function),
            asdu: None,
        }
    }
}

impl std::fmt::Display for Apdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.apci)?;
        if let Some(asdu) = &self.asdu {
            write!(
                f,
                " [{}] COT={} CA={}",
                asdu.header.type_id, asdu.header.cot, asdu.header.common_address
            )?;
        }
        Ok(())
    }
}

/// CS104 codec.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_util::codec::Framed;
/// use voltage_iec60870::cs104::{Apdu, ApduCodec, UFunction};
///
/// let stream = TcpStream::connect("192.168.1.100:2404").await?;
/// let mut framed = Framed::new(stream, ApduCodec::default());
/// framed.send(Apdu::u_frame(UFunction::StartDtAct)).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ApduCodec {
    params: AppLayerParameters,
    state: DecodeState,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    #[default]
    Start,
    Body {
        length: usize,
    },
}

impl ApduCodec {
    /// Create a codec using the given application layer parameters.
    pub fn new(params: AppLayerParameters) -> Self {
        Self {
            params,
            state: DecodeState::Start,
        }
    }

    /// Application layer parameters used for ASDUs.
    pub fn params(&self) -> &AppLayerParameters {
        &self.params
    }
}

impl Decoder for ApduCodec {
    type Item = Apdu;
    type Error = Iec60870Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Start => {
                    let skip = src.iter().position(|b| *b == START_BYTE).unwrap_or(src.len());
                    if skip > 0 {
                        trace!(skipped = skip, "discarding bytes before start byte");
                        src.advance(skip);
                    }
                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let length = src[1] as usize;
                    if !(MIN_APDU_LENGTH..=MAX_APDU_LENGTH).contains(&length) {
                        warn!(length, "invalid APDU length, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    self.state = DecodeState::Body { length };
                }

                DecodeState::Body { length } => {
                    if src.len() < 2 + length {
                        src.reserve(2 + length - src.len());
                        return Ok(None);
                    }

                    let frame = src.split_to(2 + length);
                    self.state = DecodeState::Start;

                    let apci = Apci::parse(&frame[2..6])?;
                    let asdu = if apci.is_i_frame() {
                        match Asdu::parse_with(&frame[6..], &self.params) {
                            Ok(asdu) => Some(asdu),
                            Err(e) => {
                                warn!(%apci, error = %e, "dropping undecodable ASDU");
                                None
                            }
                        }
                    } else {
                        None
                    };

                    return Ok(Some(Apdu { apci, asdu }));
                }
            }
        }
    }
}

impl Encoder<Apdu> for ApduCodec {
    type Error = Iec60870Error;

    fn encode(&mut self, item: Apdu, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let asdu_len = item
            .asdu
            .as_ref()
            .map(|a| a.encoded_len_with(&self.params))
            .unwrap_or(0);

        if asdu_len > MAX_APDU_LENGTH - MIN_APDU_LENGTH {
            return Err(Iec60870Error::AsduTooLarge {
                size: asdu_len,
                max: MAX_APDU_LENGTH - MIN_APDU_LENGTH,
            });
        }

        dst.reserve(6 + asdu_len);
        let start = dst.len();
        dst.extend_from_slice(&item.apci.encode_header(asdu_len));

        if let Some(asdu) = &item.asdu {
            if let Err(e) = asdu.encode_with(dst, &self.params) {
                dst.truncate(start);
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cot, TypeId};

    #[test]
    fn test_decode_u_frame() {
        let mut codec = ApduCodec::default();
        let mut buf = BytesMut::from(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00][..]);

        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(apdu.apci, Apci::u_frame(UFunction::StartDtAct));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_s_frame() {
        let mut codec = ApduCodec::default();
        let mut buf = BytesMut::from(&[0x68, 0x04, 0x01, 0x00, 0xC8, 0x00][..]);

        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert!(apdu.apci.is_s_frame());
        assert_eq!(apdu.apci.recv_seq(), Some(100));
    }

    #[test]
    fn test_encode_u_and_s_frames() {
        let mut codec = ApduCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Apdu::u_frame(UFunction::StartDtAct), &mut buf)
            .unwrap();
        codec.encode(Apdu::s_frame(100), &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[0x68, 0x04, 0x07, 0x00, 0x00, 0x00, 0x68, 0x04, 0x01, 0x00, 0xC8, 0x00]
        );
    }

    #[test]
    fn test_i_frame_roundtrip() {
        let mut codec = ApduCodec::default();
        let mut buf = BytesMut::new();

        let asdu = Asdu::interrogation_command(1, 20);
        codec
            .encode(Apdu::i_frame(10, 5, asdu), &mut buf)
            .unwrap();
        assert_eq!(buf[0], START_BYTE);
        // 4 (control) + 6 (header) + 3 (IOA) + 1 (QOI)
        assert_eq!(buf[1], 14);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.apci, Apci::i_frame(10, 5));
        let asdu = decoded.asdu.unwrap();
        assert_eq!(asdu.header.type_id, TypeId::InterrogationCommand);
        assert_eq!(asdu.header.cot, Cot::Activation);
        assert_eq!(&asdu.raw_data[..], &[0, 0, 0, 20]);
    }

    #[test]
    fn test_compact_params() {
        let params = AppLayerParameters {
            size_of_cot: 1,
            size_of_ca: 1,
            size_of_ioa: 2,
            ..AppLayerParameters::cs104()
        };
        let mut codec = ApduCodec::new(params);
        let mut buf = BytesMut::new();
        codec
            .encode(Apdu::i_frame(0, 0, Asdu::interrogation_command(3, 20)), &mut buf)
            .unwrap();
        assert_eq!(buf[1], 4 + 4 + 2 + 1);

        let asdu = codec.decode(&mut buf).unwrap().unwrap().asdu.unwrap();
        assert_eq!(asdu.header.common_address, 3);
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = ApduCodec::default();

        let mut buf = BytesMut::from(&[0x68, 0x04][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x07, 0x00, 0x00, 0x00]);
        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert!(apdu.apci.is_u_frame());
    }

    #[test]
    fn test_decode_skip_garbage() {
        let mut codec = ApduCodec::default();
        let mut buf = BytesMut::from(&[0xFF, 0xAA, 0x68, 0x04, 0x07, 0x00, 0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().apci.is_u_frame());
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut codec = ApduCodec::default();
        // length 2 is below the minimum; the decoder resyncs on the next start byte
        let mut buf =
            BytesMut::from(&[0x68, 0x02, 0x00, 0x68, 0x04, 0x43, 0x00, 0x00, 0x00][..]);
        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(apdu.apci, Apci::u_frame(UFunction::TestFrAct));
    }

    #[test]
    fn test_undecodable_asdu_keeps_i_frame() {
        let mut codec = ApduCodec::default();
        // I-frame N(S)=1 with unknown type id 0xC8
        let mut buf = BytesMut::from(
            &[0x68, 0x0A, 0x02, 0x00, 0x00, 0x00, 0xC8, 0x01, 0x03, 0x00, 0x01, 0x00][..],
        );
        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(apdu.apci.send_seq(), Some(1));
        assert!(apdu.asdu.is_none());
    }

    #[test]
    fn test_encode_too_large() {
        let mut codec = ApduCodec::new(AppLayerParameters {
            max_asdu_size: 255,
            ..AppLayerParameters::cs104()
        });
        let mut asdu = Asdu::with_type(TypeId::MeasuredFloat, Cot::Spontaneous, 1);
        for i in 0..40u32 {
            asdu.push(crate::types::InformationObject::new(i, vec![0u8; 5]))
                .unwrap();
        }
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Apdu::i_frame(0, 0, asdu), &mut buf),
            Err(Iec60870Error::AsduTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }
}
