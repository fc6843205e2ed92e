//! IEC 60870-5 ASDU (Application Service Data Unit).
//!
//! ASDU contains the actual data (measurements, commands, etc.). The width of
//! the COT, common address and IOA fields is taken from
//! [`AppLayerParameters`]; the plain `parse`/`encode` functions use the CS104
//! defaults.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Iec60870Error, Result};
use crate::params::AppLayerParameters;
use crate::types::{Cot, TypeId};

/// Largest number of information objects in one ASDU.
pub const MAX_OBJECTS: u8 = 127;

/// Variable Structure Qualifier (VSQ).
///
/// Defines the structure of information objects in an ASDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vsq {
    /// Number of information objects (0-127)
    pub count: u8,
    /// If true, addresses are sequential (SQ=1)
    pub sequence: bool,
}

impl Vsq {
    /// Create a new VSQ.
    #[inline]
    pub const fn new(count: u8, sequence: bool) -> Self {
        Self { count, sequence }
    }

    /// Parse VSQ from byte.
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        Self {
            count: value & 0x7F,
            sequence: (value & 0x80) != 0,
        }
    }

    /// Encode VSQ to byte.
    #[inline]
    pub const fn as_u8(&self) -> u8 {
        (self.count & 0x7F) | if self.sequence { 0x80 } else { 0 }
    }
}

/// Information Object Address (IOA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ioa(pub u32);

impl Ioa {
    /// Create IOA from u32 (lower 24 bits).
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value & 0x00FF_FFFF)
    }

    /// Parse a little-endian IOA of `size` bytes (1..=3).
    #[inline]
    pub fn from_bytes(bytes: &[u8], size: u8) -> Result<Self> {
        let size = size as usize;
        if bytes.len() < size {
            return Err(Iec60870Error::invalid_asdu("IOA too short"));
        }
        let value = bytes[..size]
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32);
        Ok(Self(value))
    }

    /// Write the IOA using `size` bytes (little-endian).
    #[inline]
    pub fn write(&self, buf: &mut BytesMut, size: u8) {
        buf.put_slice(&self.0.to_le_bytes()[..size as usize]);
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Ioa {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Display for Ioa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ASDU header (data unit identifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsduHeader {
    /// Type identification
    pub type_id: TypeId,
    /// Variable structure qualifier
    pub vsq: Vsq,
    /// Cause of transmission
    pub cot: Cot,
    /// Test flag (if true, this is a test ASDU)
    pub test: bool,
    /// Negative flag (if true, negative confirmation)
    pub negative: bool,
    /// Originator address (0 if not used)
    pub originator: u8,
    /// Common address of ASDU (station address)
    pub common_address: u16,
}

impl AsduHeader {
    /// Create a new ASDU header.
    pub fn new(type_id: TypeId, count: u8, cot: Cot, common_address: u16) -> Self {
        Self {
            type_id,
            vsq: Vsq::new(count, false),
            cot,
            test: false,
            negative: false,
            originator: 0,
            common_address,
        }
    }

    /// Parse a CS104 header. Returns the header and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        Self::parse_with(data, &AppLayerParameters::cs104())
    }

    /// Parse the header using the given field sizes.
    pub fn parse_with(data: &[u8], params: &AppLayerParameters) -> Result<(Self, usize)> {
        let size = params.header_size();
        if data.len() < size {
            return Err(Iec60870Error::invalid_asdu("ASDU header too short"));
        }

        let type_id = TypeId::from_u8(data[0])?;
        let vsq = Vsq::from_u8(data[1]);

        // COT in lower 6 bits, negative in bit 6, test in bit 7
        let cot = Cot::from_u8(data[2])?;
        let test = (data[2] & 0x80) != 0;
        let negative = (data[2] & 0x40) != 0;

        let mut pos = 3;
        let originator = if params.size_of_cot == 2 {
            pos += 1;
            data[3]
        } else {
            0
        };

        let common_address = if params.size_of_ca == 2 {
            u16::from_le_bytes([data[pos], data[pos + 1]])
        } else {
            data[pos] as u16
        };

        Ok((
            Self {
                type_id,
                vsq,
                cot,
                test,
                negative,
                originator,
                common_address,
            },
            size,
        ))
    }

    /// Encode a CS104 header.
    pub fn encode(&self, buf: &mut BytesMut) {
        self.encode_with(buf, &AppLayerParameters::cs104());
    }

    /// Encode the header using the given field sizes.
    ///
    /// A zero originator is replaced by the configured originator address.
    pub fn encode_with(&self, buf: &mut BytesMut, params: &AppLayerParameters) {
        buf.put_u8(self.type_id.as_u8());
        buf.put_u8(self.vsq.as_u8());

        let mut cot_byte = self.cot.as_u8();
        if self.test {
            cot_byte |= 0x80;
        }
        if self.negative {
            cot_byte |= 0x40;
        }
        buf.put_u8(cot_byte);

        if params.size_of_cot == 2 {
            let originator = if self.originator != 0 {
                self.originator
            } else {
                params.originator_address
            };
            buf.put_u8(originator);
        }

        if params.size_of_ca == 2 {
            buf.put_u16_le(self.common_address);
        } else {
            buf.put_u8(self.common_address as u8);
        }
    }
}

/// Information object: address and element bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct InformationObject {
    /// Information object address
    pub ioa: Ioa,
    /// Raw element bytes (value, quality, time tag)
    pub data: Bytes,
}

impl InformationObject {
    /// Create a new information object.
    pub fn new(ioa: impl Into<Ioa>, data: impl Into<Bytes>) -> Self {
        Self {
            ioa: ioa.into(),
            data: data.into(),
        }
    }
}

/// Complete ASDU.
///
/// ASDUs built locally carry their information objects in `objects`; received
/// ASDUs keep the undecoded payload in `raw_data` and are split with
/// [`Asdu::information_objects`].
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    /// ASDU header
    pub header: AsduHeader,
    /// Information objects
    pub objects: Vec<InformationObject>,
    /// Raw payload following the header
    pub raw_data: Bytes,
}

impl Asdu {
    /// Create a new ASDU.
    pub fn new(header: AsduHeader) -> Self {
        Self {
            header,
            objects: Vec::new(),
            raw_data: Bytes::new(),
        }
    }

    /// Create an empty ASDU for the given type, cause and station.
    pub fn with_type(type_id: TypeId, cot: Cot, common_address: u16) -> Self {
        Self::new(AsduHeader::new(type_id, 0, cot, common_address))
    }

    /// Mark the information objects as a sequence (SQ=1).
    ///
    /// Only the first IOA is transmitted; the others must be consecutive.
    pub fn sequence(mut self, sequence: bool) -> Self {
        self.header.vsq.sequence = sequence;
        self
    }

    /// Set the test flag.
    pub fn test(mut self, test: bool) -> Self {
        self.header.test = test;
        self
    }

    /// Append an information object and update the VSQ count.
    pub fn push(&mut self, object: InformationObject) -> Result<()> {
        if self.objects.len() >= MAX_OBJECTS as usize {
            return Err(Iec60870Error::invalid_asdu("too many information objects"));
        }
        if self.header.vsq.sequence {
            if let Some(first) = self.objects.first() {
                if object.ioa.value() != first.ioa.value() + self.objects.len() as u32 {
                    return Err(Iec60870Error::invalid_asdu(
                        "sequence ASDU requires consecutive IOAs",
                    ));
                }
            }
        }
        self.objects.push(object);
        self.header.vsq.count = self.objects.len() as u8;
        Ok(())
    }

    /// Type identification.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.header.type_id
    }

    /// Cause of transmission.
    #[inline]
    pub fn cot(&self) -> Cot {
        self.header.cot
    }

    /// Common address.
    #[inline]
    pub fn common_address(&self) -> u16 {
        self.header.common_address
    }

    /// Copy of this ASDU with a different cause and negative flag.
    pub fn mirror(&self, cot: Cot, negative: bool) -> Self {
        let mut asdu = self.clone();
        asdu.header.cot = cot;
        asdu.header.negative = negative;
        asdu
    }

    /// Parse a CS104 ASDU from bytes (after APCI).
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_with(data, &AppLayerParameters::cs104())
    }

    /// Parse an ASDU using the given field sizes.
    pub fn parse_with(data: &[u8], params: &AppLayerParameters) -> Result<Self> {
        let (header, header_len) = AsduHeader::parse_with(data, params)?;
        Ok(Self {
            header,
            objects: Vec::new(),
            raw_data: Bytes::copy_from_slice(&data[header_len..]),
        })
    }

    /// Split the payload into information objects.
    ///
    /// For received ASDUs the payload is cut by the element size of the type
    /// identification; with SQ=1 the IOAs are derived from the first one.
    pub fn information_objects(
        &self,
        params: &AppLayerParameters,
    ) -> Result<Vec<InformationObject>> {
        if !self.objects.is_empty() {
            return Ok(self.objects.clone());
        }

        let count = self.header.vsq.count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let ioa_size = params.size_of_ioa as usize;
        let element = self.header.type_id.element_size();
        let data = &self.raw_data;
        let needed = if self.header.vsq.sequence {
            ioa_size + count * element
        } else {
            count * (ioa_size + element)
        };
        if data.len() < needed {
            return Err(Iec60870Error::invalid_asdu(format!(
                "{} payload truncated: {} bytes, need {}",
                self.header.type_id,
                data.len(),
                needed
            )));
        }

        let mut objects = Vec::with_capacity(count);
        if self.header.vsq.sequence {
            let base = Ioa::from_bytes(data, params.size_of_ioa)?.value();
            for i in 0..count {
                let start = ioa_size + i * element;
                objects.push(InformationObject {
                    ioa: Ioa::new(base + i as u32),
                    data: data.slice(start..start + element),
                });
            }
        } else {
            for i in 0..count {
                let start = i * (ioa_size + element);
                objects.push(InformationObject {
                    ioa: Ioa::from_bytes(&data[start..], params.size_of_ioa)?,
                    data: data.slice(start + ioa_size..start + ioa_size + element),
                });
            }
        }
        Ok(objects)
    }

    /// Encode a CS104 ASDU to bytes.
    pub fn encode(&self) -> Result<BytesMut> {
        let params = AppLayerParameters::cs104();
        let mut buf = BytesMut::with_capacity(self.encoded_len_with(&params));
        self.encode_with(&mut buf, &params)?;
        Ok(buf)
    }

    /// Encode a CS104 ASDU directly into the provided buffer.
    #[inline]
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<()> {
        self.encode_with(buf, &AppLayerParameters::cs104())
    }

    /// Encode the ASDU with the given field sizes.
    ///
    /// Fails with [`Iec60870Error::AsduTooLarge`] when the result would exceed
    /// `max_asdu_size`; nothing is written in that case.
    pub fn encode_with(&self, buf: &mut BytesMut, params: &AppLayerParameters) -> Result<()> {
        let size = self.encoded_len_with(params);
        if size > params.max_asdu_size {
            return Err(Iec60870Error::AsduTooLarge {
                size,
                max: params.max_asdu_size,
            });
        }
        if self.header.common_address > params.max_common_address() {
            return Err(Iec60870Error::invalid_asdu(format!(
                "common address {} does not fit in {} byte(s)",
                self.header.common_address, params.size_of_ca
            )));
        }
        if let Some(obj) = self.objects.iter().find(|o| o.ioa.value() > params.max_ioa()) {
            return Err(Iec60870Error::invalid_asdu(format!(
                "IOA {} does not fit in {} byte(s)",
                obj.ioa, params.size_of_ioa
            )));
        }

        buf.reserve(size);
        self.header.encode_with(buf, params);

        if self.objects.is_empty() {
            buf.put_slice(&self.raw_data);
            return Ok(());
        }

        for (i, obj) in self.objects.iter().enumerate() {
            if i == 0 || !self.header.vsq.sequence {
                obj.ioa.write(buf, params.size_of_ioa);
            }
            buf.put_slice(&obj.data);
        }
        Ok(())
    }

    /// Encoded length with the given field sizes.
    pub fn encoded_len_with(&self, params: &AppLayerParameters) -> usize {
        let mut len = params.header_size();
        if self.objects.is_empty() {
            return len + self.raw_data.len();
        }
        let ioa_size = params.size_of_ioa as usize;
        for (i, obj) in self.objects.iter().enumerate() {
            if i == 0 || !self.header.vsq.sequence {
                len += ioa_size;
            }
            len += obj.data.len();
        }
        len
    }

    /// Encoded length with CS104 field sizes.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.encoded_len_with(&AppLayerParameters::cs104())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact() -> AppLayerParameters {
        AppLayerParameters {
            size_of_cot: 1,
            originator_address: 0,
            size_of_ca: 1,
            size_of_ioa: 2,
            max_asdu_size: 249,
        }
    }

    #[test]
    fn test_vsq() {
        assert_eq!(Vsq::new(10, false).as_u8(), 10);
        assert_eq!(Vsq::new(10, true).as_u8(), 0x8A);

        let vsq = Vsq::from_u8(0x8A);
        assert_eq!(vsq.count, 10);
        assert!(vsq.sequence);
    }

    #[test]
    fn test_ioa_sizes() {
        let mut buf = BytesMut::new();
        Ioa::new(0x123456).write(&mut buf, 3);
        assert_eq!(&buf[..], &[0x56, 0x34, 0x12]);
        assert_eq!(Ioa::from_bytes(&buf, 3).unwrap().value(), 0x123456);

        let mut buf = BytesMut::new();
        Ioa::new(0x1234).write(&mut buf, 2);
        assert_eq!(&buf[..], &[0x34, 0x12]);
        assert_eq!(Ioa::from_bytes(&buf, 2).unwrap().value(), 0x1234);
        assert_eq!(Ioa::from_bytes(&[0x7F], 1).unwrap().value(), 0x7F);

        assert!(Ioa::from_bytes(&[0x01], 2).is_err());
    }

    #[test]
    fn test_asdu_header() {
        let header = AsduHeader::new(TypeId::MeasuredFloat, 5, Cot::Spontaneous, 1);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[13, 5, 3, 0, 1, 0]);

        let (parsed, len) = AsduHeader::parse(&buf).unwrap();
        assert_eq!(len, 6);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_asdu_header_flags_and_originator() {
        let mut header = AsduHeader::new(TypeId::SingleCommand, 1, Cot::ActivationConfirm, 0x0102);
        header.test = true;
        header.negative = true;

        let params = AppLayerParameters::cs104().originator_address(7);
        let mut buf = BytesMut::new();
        header.encode_with(&mut buf, &params);
        assert_eq!(&buf[..], &[45, 1, 0xC7, 7, 0x02, 0x01]);

        let (parsed, _) = AsduHeader::parse_with(&buf, &params).unwrap();
        assert!(parsed.test);
        assert!(parsed.negative);
        assert_eq!(parsed.originator, 7);
        assert_eq!(parsed.cot, Cot::ActivationConfirm);
    }

    #[test]
    fn test_asdu_header_compact() {
        let header = AsduHeader::new(TypeId::SinglePoint, 1, Cot::Spontaneous, 5);
        let mut buf = BytesMut::new();
        header.encode_with(&mut buf, &compact());
        assert_eq!(&buf[..], &[1, 1, 3, 5]);

        let (parsed, len) = AsduHeader::parse_with(&buf, &compact()).unwrap();
        assert_eq!(len, 4);
        assert_eq!(parsed.common_address, 5);
        assert_eq!(parsed.originator, 0);
    }

    #[test]
    fn test_asdu_header_errors() {
        assert!(AsduHeader::parse(&[1, 1, 3, 0, 1]).is_err());
        assert!(matches!(
            AsduHeader::parse(&[200, 1, 3, 0, 1, 0]),
            Err(Iec60870Error::UnknownTypeId(200))
        ));
        assert!(matches!(
            AsduHeader::parse(&[1, 1, 0, 0, 1, 0]),
            Err(Iec60870Error::UnknownCot(0))
        ));
    }

    #[test]
    fn test_push_updates_count() {
        let mut asdu = Asdu::with_type(TypeId::SinglePoint, Cot::Spontaneous, 1);
        asdu.push(InformationObject::new(100u32, vec![0x01])).unwrap();
        asdu.push(InformationObject::new(200u32, vec![0x00])).unwrap();
        assert_eq!(asdu.header.vsq.count, 2);
        assert_eq!(asdu.encoded_len(), 6 + 2 * 4);

        let buf = asdu.encode().unwrap();
        assert_eq!(
            &buf[..],
            &[1, 2, 3, 0, 1, 0, 100, 0, 0, 0x01, 200, 0, 0, 0x00]
        );
    }

    #[test]
    fn test_sequence_encodes_first_ioa_only() {
        let mut asdu = Asdu::with_type(TypeId::SinglePoint, Cot::Spontaneous, 1).sequence(true);
        for i in 0..3u32 {
            asdu.push(InformationObject::new(10 + i, vec![i as u8])).unwrap();
        }
        assert!(asdu
            .push(InformationObject::new(20u32, vec![0]))
            .is_err());

        let buf = asdu.encode().unwrap();
        assert_eq!(&buf[..], &[1, 0x83, 3, 0, 1, 0, 10, 0, 0, 0, 1, 2]);

        let parsed = Asdu::parse(&buf).unwrap();
        let objects = parsed
            .information_objects(&AppLayerParameters::cs104())
            .unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[2].ioa.value(), 12);
        assert_eq!(&objects[2].data[..], &[2]);
    }

    #[test]
    fn test_information_objects_non_sequence() {
        let data = [13, 2, 3, 0, 1, 0, 1, 0, 0, 0, 0, 0x80, 0x3F, 0, 2, 0, 0, 0, 0, 0, 0x40, 0x80];
        let asdu = Asdu::parse(&data).unwrap();
        let objects = asdu
            .information_objects(&AppLayerParameters::cs104())
            .unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].ioa.value(), 1);
        assert_eq!(objects[1].ioa.value(), 2);
        assert_eq!(objects[1].data.len(), 5);
        assert_eq!(objects[1].data[4], 0x80);
    }

    #[test]
    fn test_information_objects_truncated() {
        let data = [13, 2, 3, 0, 1, 0, 1, 0, 0, 0, 0, 0x80, 0x3F, 0];
        let asdu = Asdu::parse(&data).unwrap();
        assert!(matches!(
            asdu.information_objects(&AppLayerParameters::cs104()),
            Err(Iec60870Error::InvalidAsdu(_))
        ));
    }

    #[test]
    fn test_encode_compact_params() {
        let params = compact();
        let mut asdu = Asdu::with_type(TypeId::MeasuredScaled, Cot::Periodic, 3);
        asdu.push(InformationObject::new(0x0201u32, vec![0x10, 0x00, 0x00]))
            .unwrap();

        let mut buf = BytesMut::new();
        asdu.encode_with(&mut buf, &params).unwrap();
        assert_eq!(&buf[..], &[11, 1, 1, 3, 0x01, 0x02, 0x10, 0x00, 0x00]);
        assert_eq!(asdu.encoded_len_with(&params), buf.len());

        let parsed = Asdu::parse_with(&buf, &params).unwrap();
        let objects = parsed.information_objects(&params).unwrap();
        assert_eq!(objects[0].ioa.value(), 0x0201);
    }

    #[test]
    fn test_encode_rejects_out_of_range_fields() {
        let params = compact();
        let mut asdu = Asdu::with_type(TypeId::SinglePoint, Cot::Spontaneous, 300);
        asdu.push(InformationObject::new(1u32, vec![0])).unwrap();
        assert!(asdu.encode_with(&mut BytesMut::new(), &params).is_err());

        let mut asdu = Asdu::with_type(TypeId::SinglePoint, Cot::Spontaneous, 1);
        asdu.push(InformationObject::new(0x10000u32, vec![0])).unwrap();
        assert!(asdu.encode_with(&mut BytesMut::new(), &params).is_err());
    }

    #[test]
    fn test_encode_too_large() {
        let mut asdu = Asdu::with_type(TypeId::MeasuredFloatTime56, Cot::Spontaneous, 1);
        for i in 0..20u32 {
            asdu.push(InformationObject::new(i, vec![0u8; 12])).unwrap();
        }
        let mut buf = BytesMut::new();
        let err = asdu
            .encode_with(&mut buf, &AppLayerParameters::cs104())
            .unwrap_err();
        assert!(matches!(err, Iec60870Error::AsduTooLarge { size: 306, max: 249 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mirror() {
        let mut asdu = Asdu::with_type(TypeId::SingleCommand, Cot::Activation, 1);
        asdu.push(InformationObject::new(5u32, vec![0x81])).unwrap();
        let con = asdu.mirror(Cot::ActivationConfirm, true);
        assert_eq!(con.cot(), Cot::ActivationConfirm);
        assert!(con.header.negative);
        assert_eq!(con.objects, asdu.objects);
    }
}
