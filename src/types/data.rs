//! Data point types.
//!
//! Unified representation of monitoring information objects: the master side
//! produces [`DataPoint`]s from received ASDUs and the slave side encodes them
//! into information elements.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Iec60870Error, Result};
use crate::types::{Asdu, Cot, Cp24Time2a, Cp56Time2a, InformationObject, TimeTagKind, TypeId};

/// Full scale of a normalized value (2^15).
const NORMALIZED_SCALE: f32 = 32768.0;

/// Convert a raw normalized value (NVA) to the range -1.0..1.0.
#[inline]
pub fn normalized_from_raw(raw: i16) -> f32 {
    raw as f32 / NORMALIZED_SCALE
}

/// Convert a value in -1.0..1.0 to NVA, clamping out-of-range input.
#[inline]
pub fn normalized_to_raw(value: f32) -> i16 {
    let scaled = (value * NORMALIZED_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Double-point information value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoublePointValue {
    /// Indeterminate or intermediate (00)
    Indeterminate = 0,
    /// Determined OFF (01)
    Off = 1,
    /// Determined ON (10)
    On = 2,
    /// Indeterminate (11)
    IndeterminateOrFaulty = 3,
}

impl DoublePointValue {
    /// Parse from byte (lower 2 bits).
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Indeterminate,
            1 => Self::Off,
            2 => Self::On,
            _ => Self::IndeterminateOrFaulty,
        }
    }

    /// Raw 2-bit value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Quality descriptor for single/double point information (SIQ/DIQ bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityDescriptor {
    /// Blocked (BL)
    pub blocked: bool,
    /// Substituted (SB)
    pub substituted: bool,
    /// Not topical (NT)
    pub not_topical: bool,
    /// Invalid (IV)
    pub invalid: bool,
}

/// Quality descriptor for measured values (QDS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeasuredQuality {
    /// Overflow (OV)
    pub overflow: bool,
    /// Blocked (BL)
    pub blocked: bool,
    /// Substituted (SB)
    pub substituted: bool,
    /// Not topical (NT)
    pub not_topical: bool,
    /// Invalid (IV)
    pub invalid: bool,
}

/// Quality flags for data points.
///
/// Packed into a single byte using the QDS bit positions:
/// ```text
/// IV(7) NT(6) SB(5) BL(4) EI(3) _ _ OV(0)
/// ```
/// so conversion to and from the wire is a mask.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Quality(u8);

macro_rules! quality_flag {
    ($get:ident, $set:ident, $mask:expr, $doc:literal) => {
        #[doc = $doc]
        #[inline(always)]
        pub const fn $get(&self) -> bool {
            (self.0 & $mask) != 0
        }

        #[doc = concat!("Set or clear: ", $doc)]
        #[inline(always)]
        pub const fn $set(self, value: bool) -> Self {
            if value {
                Self(self.0 | $mask)
            } else {
                Self(self.0 & !$mask)
            }
        }
    };
}

impl Quality {
    const OV: u8 = 0x01;
    const EI: u8 = 0x08;
    const BL: u8 = 0x10;
    const SB: u8 = 0x20;
    const NT: u8 = 0x40;
    const IV: u8 = 0x80;
    const SIQ_MASK: u8 = Self::BL | Self::SB | Self::NT | Self::IV;
    const QDS_MASK: u8 = Self::SIQ_MASK | Self::OV;

    /// Good quality (all flags false).
    #[allow(non_upper_case_globals)]
    pub const Good: Self = Self(0);

    /// Invalid quality.
    #[allow(non_upper_case_globals)]
    pub const Invalid: Self = Self(Self::IV);

    quality_flag!(overflow, set_overflow, Self::OV, "Overflow (OV)");
    quality_flag!(elapsed_time_invalid, set_elapsed_time_invalid, Self::EI, "Elapsed time invalid (EI)");
    quality_flag!(blocked, set_blocked, Self::BL, "Blocked (BL)");
    quality_flag!(substituted, set_substituted, Self::SB, "Substituted (SB)");
    quality_flag!(not_topical, set_not_topical, Self::NT, "Not topical (NT)");
    quality_flag!(invalid, set_invalid, Self::IV, "Invalid (IV)");

    /// Get the raw packed byte value.
    #[inline(always)]
    pub const fn as_raw(&self) -> u8 {
        self.0
    }

    /// Create from raw packed byte value.
    #[inline(always)]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Parse from QDS byte.
    #[inline(always)]
    pub const fn from_qds(byte: u8) -> Self {
        Self(byte & Self::QDS_MASK)
    }

    /// Parse from SIQ byte (value bit ignored).
    #[inline(always)]
    pub const fn from_siq(byte: u8) -> Self {
        Self(byte & Self::SIQ_MASK)
    }

    /// Parse from DIQ byte (value bits ignored).
    #[inline(always)]
    pub const fn from_diq(byte: u8) -> Self {
        Self::from_siq(byte)
    }

    /// Parse from the sequence octet of a binary counter reading.
    #[inline(always)]
    pub const fn from_bcr_flags(byte: u8) -> Self {
        Self(byte & Self::IV)
    }

    /// Encode as QDS byte.
    #[inline(always)]
    pub const fn to_qds(&self) -> u8 {
        self.0 & Self::QDS_MASK
    }

    /// Encode the quality bits of a SIQ/DIQ byte.
    #[inline(always)]
    pub const fn to_siq(&self) -> u8 {
        self.0 & Self::SIQ_MASK
    }

    /// Check if quality is good (no flags set).
    #[inline(always)]
    pub const fn is_good(&self) -> bool {
        self.0 == 0
    }

    /// Quality with only the invalid flag set based on a boolean.
    #[inline(always)]
    pub const fn with_invalid(invalid: bool) -> Self {
        Self::Good.set_invalid(invalid)
    }
}

impl From<QualityDescriptor> for Quality {
    fn from(qd: QualityDescriptor) -> Self {
        Quality::Good
            .set_blocked(qd.blocked)
            .set_substituted(qd.substituted)
            .set_not_topical(qd.not_topical)
            .set_invalid(qd.invalid)
    }
}

impl From<MeasuredQuality> for Quality {
    fn from(mq: MeasuredQuality) -> Self {
        Quality::Good
            .set_overflow(mq.overflow)
            .set_blocked(mq.blocked)
            .set_substituted(mq.substituted)
            .set_not_topical(mq.not_topical)
            .set_invalid(mq.invalid)
    }
}

impl From<Quality> for QualityDescriptor {
    fn from(q: Quality) -> Self {
        Self {
            blocked: q.blocked(),
            substituted: q.substituted(),
            not_topical: q.not_topical(),
            invalid: q.invalid(),
        }
    }
}

impl From<Quality> for MeasuredQuality {
    fn from(q: Quality) -> Self {
        Self {
            overflow: q.overflow(),
            blocked: q.blocked(),
            substituted: q.substituted(),
            not_topical: q.not_topical(),
            invalid: q.invalid(),
        }
    }
}

impl std::fmt::Debug for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Quality({})", self)
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_good() {
            return f.write_str("Good");
        }

        let flags = [
            (self.overflow(), "OV"),
            (self.blocked(), "BL"),
            (self.substituted(), "SB"),
            (self.not_topical(), "NT"),
            (self.invalid(), "IV"),
            (self.elapsed_time_invalid(), "EI"),
        ];
        let mut first = true;
        for (_, name) in flags.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// Data value types.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// Single-point information (M_SP_*)
    Single(bool),

    /// Double-point information (M_DP_*)
    Double(DoublePointValue),

    /// Normalized value -1.0 to +1.0 (M_ME_NA_1, M_ME_TD_1, M_ME_ND_1)
    Normalized(f32),

    /// Scaled value (M_ME_NB_1, M_ME_TE_1)
    Scaled(i16),

    /// Short floating point (M_ME_NC_1, M_ME_TF_1)
    Float(f32),

    /// Bitstring of 32 bits (M_BO_*)
    Bitstring(u32),

    /// Step position (M_ST_*): value in -64..=63, transient state flag
    StepPosition { value: i8, transient: bool },

    /// Binary counter reading (M_IT_*)
    BinaryCounter {
        value: i32,
        sequence: u8,
        carry: bool,
        adjusted: bool,
        invalid: bool,
    },
}

impl DataValue {
    /// Convert to f64 if numeric.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Single(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Double(v) => Some(match v {
                DoublePointValue::Off => 0.0,
                DoublePointValue::On => 1.0,
                _ => f64::NAN,
            }),
            Self::Normalized(v) => Some(*v as f64),
            Self::Scaled(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Bitstring(v) => Some(*v as f64),
            Self::StepPosition { value, .. } => Some(*value as f64),
            Self::BinaryCounter { value, .. } => Some(*value as f64),
        }
    }

    /// Convert to bool if boolean type.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Single(v) => Some(*v),
            Self::Double(DoublePointValue::Off) => Some(false),
            Self::Double(DoublePointValue::On) => Some(true),
            _ => None,
        }
    }

    /// Check if this is a boolean type.
    #[inline]
    pub const fn is_boolean(&self) -> bool {
        matches!(self, Self::Single(_) | Self::Double(_))
    }

    /// Check if this is a numeric type.
    #[inline]
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Normalized(_)
                | Self::Scaled(_)
                | Self::Float(_)
                | Self::StepPosition { .. }
                | Self::BinaryCounter { .. }
        )
    }
}

/// Unified data point representing an information object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Information object address (IOA)
    pub ioa: u32,
    /// Data value
    pub value: DataValue,
    /// Quality flags
    pub quality: Quality,
    /// Timestamp (if present). CP24 time tags are widened with a zero date.
    pub timestamp: Option<Cp56Time2a>,
}

impl DataPoint {
    /// Create a new data point.
    #[inline]
    pub const fn new(ioa: u32, value: DataValue) -> Self {
        Self {
            ioa,
            value,
            quality: Quality::Good,
            timestamp: None,
        }
    }

    /// Create a data point with quality.
    #[inline]
    pub const fn with_quality(ioa: u32, value: DataValue, quality: Quality) -> Self {
        Self {
            ioa,
            value,
            quality,
            timestamp: None,
        }
    }

    /// Create a data point with timestamp.
    #[inline]
    pub const fn with_timestamp(
        ioa: u32,
        value: DataValue,
        quality: Quality,
        timestamp: Cp56Time2a,
    ) -> Self {
        Self {
            ioa,
            value,
            quality,
            timestamp: Some(timestamp),
        }
    }

    /// Check if the data point has good quality.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.quality.is_good()
    }

    /// Get the value as f64 if numeric.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Get the value as bool if boolean.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    /// Encode the information element (without IOA) for `type_id`.
    ///
    /// The value variant must match the type. Time-tagged types require a
    /// timestamp.
    pub fn encode_element(&self, type_id: TypeId) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(type_id.element_size());
        let q = self.quality;

        match (type_id, &self.value) {
            (
                TypeId::SinglePoint | TypeId::SinglePointTime24 | TypeId::SinglePointTime56,
                DataValue::Single(v),
            ) => buf.put_u8(*v as u8 | q.to_siq()),
            (
                TypeId::DoublePoint | TypeId::DoublePointTime24 | TypeId::DoublePointTime56,
                DataValue::Double(v),
            ) => buf.put_u8(v.as_u8() | q.to_siq()),
            (
                TypeId::StepPosition | TypeId::StepPositionTime24 | TypeId::StepPositionTime56,
                DataValue::StepPosition { value, transient },
            ) => {
                if !(-64..=63).contains(value) {
                    return Err(Iec60870Error::invalid_asdu(format!(
                        "step position {} out of range",
                        value
                    )));
                }
                buf.put_u8((*value as u8 & 0x7F) | if *transient { 0x80 } else { 0 });
                buf.put_u8(q.to_qds());
            }
            (
                TypeId::Bitstring32 | TypeId::Bitstring32Time24 | TypeId::Bitstring32Time56,
                DataValue::Bitstring(v),
            ) => {
                buf.put_u32_le(*v);
                buf.put_u8(q.to_qds());
            }
            (
                TypeId::MeasuredNormalized
                | TypeId::MeasuredNormalizedTime24
                | TypeId::MeasuredNormalizedTime56,
                DataValue::Normalized(v),
            ) => {
                buf.put_i16_le(normalized_to_raw(*v));
                buf.put_u8(q.to_qds());
            }
            (TypeId::MeasuredNormalizedNoQuality, DataValue::Normalized(v)) => {
                buf.put_i16_le(normalized_to_raw(*v));
            }
            (
                TypeId::MeasuredScaled | TypeId::MeasuredScaledTime24 | TypeId::MeasuredScaledTime56,
                DataValue::Scaled(v),
            ) => {
                buf.put_i16_le(*v);
                buf.put_u8(q.to_qds());
            }
            (
                TypeId::MeasuredFloat | TypeId::MeasuredFloatTime24 | TypeId::MeasuredFloatTime56,
                DataValue::Float(v),
            ) => {
                buf.put_f32_le(*v);
                buf.put_u8(q.to_qds());
            }
            (
                TypeId::IntegratedTotals
                | TypeId::IntegratedTotalsTime24
                | TypeId::IntegratedTotalsTime56,
                DataValue::BinaryCounter {
                    value,
                    sequence,
                    carry,
                    adjusted,
                    invalid,
                },
            ) => {
                buf.put_i32_le(*value);
                let mut flags = sequence & 0x1F;
                if *carry {
                    flags |= 0x20;
                }
                if *adjusted {
                    flags |= 0x40;
                }
                if *invalid || q.invalid() {
                    flags |= 0x80;
                }
                buf.put_u8(flags);
            }
            (type_id, value) => {
                return Err(Iec60870Error::invalid_asdu(format!(
                    "cannot encode {:?} as {}",
                    value, type_id
                )))
            }
        }

        match type_id.time_tag() {
            TimeTagKind::None => {}
            TimeTagKind::Cp24 => {
                let ts = self.required_timestamp(type_id)?;
                buf.put_slice(&Cp24Time2a::from(ts).to_bytes());
            }
            TimeTagKind::Cp56 => {
                let ts = self.required_timestamp(type_id)?;
                buf.put_slice(&ts.to_bytes());
            }
        }

        Ok(buf.freeze())
    }

    fn required_timestamp(&self, type_id: TypeId) -> Result<Cp56Time2a> {
        self.timestamp.ok_or_else(|| {
            Iec60870Error::invalid_asdu(format!("{} requires a timestamp", type_id))
        })
    }
}

impl Asdu {
    /// Build a monitoring ASDU from data points of one type.
    ///
    /// With `sequence` set the points must have consecutive IOAs.
    pub fn from_points(
        type_id: TypeId,
        cot: Cot,
        common_address: u16,
        sequence: bool,
        points: &[DataPoint],
    ) -> Result<Self> {
        let mut asdu = Asdu::with_type(type_id, cot, common_address).sequence(sequence);
        for point in points {
            asdu.push_point(type_id, point)?;
        }
        Ok(asdu)
    }

    /// Append a data point encoded as `type_id`.
    pub fn push_point(&mut self, type_id: TypeId, point: &DataPoint) -> Result<()> {
        if type_id != self.header.type_id {
            return Err(Iec60870Error::invalid_asdu(format!(
                "{} point in {} ASDU",
                type_id, self.header.type_id
            )));
        }
        self.push(InformationObject::new(point.ioa, point.encode_element(type_id)?))
    }
}
