//! ASDU information object parser.
//!
//! Converts the information objects of a received ASDU into structured
//! [`DataPoint`] values (monitoring direction) or [`Command`] values
//! (control and system direction).

use crate::error::{Iec60870Error, Result};
use crate::params::AppLayerParameters;
use crate::types::{
    normalized_from_raw, Asdu, Command, Cp24Time2a, Cp56Time2a, DataPoint, DataValue,
    DoublePointValue, Quality, TimeTagKind, TypeId,
};

/// Parse a CS104 ASDU into a list of data points.
///
/// # Example
///
/// ```rust,ignore
/// let points = parse_asdu(&asdu)?;
/// for point in points {
///     println!("IOA {}: {:?} ({})", point.ioa, point.value, point.quality);
/// }
/// ```
pub fn parse_asdu(asdu: &Asdu) -> Result<Vec<DataPoint>> {
    parse_asdu_with(asdu, &AppLayerParameters::cs104())
}

/// Parse an ASDU into data points using the given field sizes.
///
/// Control and system types yield an empty list.
pub fn parse_asdu_with(asdu: &Asdu, params: &AppLayerParameters) -> Result<Vec<DataPoint>> {
    let type_id = asdu.header.type_id;
    if !type_id.is_monitoring() || type_id == TypeId::EndOfInit {
        return Ok(Vec::new());
    }

    asdu.information_objects(params)?
        .iter()
        .map(|obj| decode_point(type_id, obj.ioa.value(), &obj.data))
        .collect()
}

/// Parse the commands carried by a control or system direction ASDU.
///
/// Monitoring types yield an empty list, except end of initialization.
pub fn parse_commands_with(
    asdu: &Asdu,
    params: &AppLayerParameters,
) -> Result<Vec<(u32, Command)>> {
    let type_id = asdu.header.type_id;
    if !type_id.is_system() && !type_id.is_control() {
        return Ok(Vec::new());
    }

    asdu.information_objects(params)?
        .iter()
        .map(|obj| Ok((obj.ioa.value(), Command::decode(type_id, &obj.data)?)))
        .collect()
}

/// Decode one monitoring information element.
pub fn decode_point(type_id: TypeId, ioa: u32, data: &[u8]) -> Result<DataPoint> {
    let size = type_id.element_size();
    if data.len() < size {
        return Err(Iec60870Error::invalid_asdu(format!(
            "{} element too short: {} < {}",
            type_id,
            data.len(),
            size
        )));
    }

    let (value, quality, value_len) = match type_id {
        TypeId::SinglePoint | TypeId::SinglePointTime24 | TypeId::SinglePointTime56 => (
            DataValue::Single((data[0] & 0x01) != 0),
            Quality::from_siq(data[0]),
            1,
        ),
        TypeId::DoublePoint | TypeId::DoublePointTime24 | TypeId::DoublePointTime56 => (
            DataValue::Double(DoublePointValue::from_u8(data[0])),
            Quality::from_diq(data[0]),
            1,
        ),
        TypeId::StepPosition | TypeId::StepPositionTime24 | TypeId::StepPositionTime56 => (
            // VTI: 7-bit two's complement value, bit 7 transient
            DataValue::StepPosition {
                value: ((data[0] & 0x7F) << 1) as i8 >> 1,
                transient: (data[0] & 0x80) != 0,
            },
            Quality::from_qds(data[1]),
            2,
        ),
        TypeId::Bitstring32 | TypeId::Bitstring32Time24 | TypeId::Bitstring32Time56 => (
            DataValue::Bitstring(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            Quality::from_qds(data[4]),
            5,
        ),
        TypeId::MeasuredNormalized
        | TypeId::MeasuredNormalizedTime24
        | TypeId::MeasuredNormalizedTime56 => (
            DataValue::Normalized(normalized_from_raw(i16::from_le_bytes([data[0], data[1]]))),
            Quality::from_qds(data[2]),
            3,
        ),
        TypeId::MeasuredNormalizedNoQuality => (
            DataValue::Normalized(normalized_from_raw(i16::from_le_bytes([data[0], data[1]]))),
            Quality::Good,
            2,
        ),
        TypeId::MeasuredScaled | TypeId::MeasuredScaledTime24 | TypeId::MeasuredScaledTime56 => (
            DataValue::Scaled(i16::from_le_bytes([data[0], data[1]])),
            Quality::from_qds(data[2]),
            3,
        ),
        TypeId::MeasuredFloat | TypeId::MeasuredFloatTime24 | TypeId::MeasuredFloatTime56 => (
            DataValue::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            Quality::from_qds(data[4]),
            5,
        ),
        TypeId::IntegratedTotals
        | TypeId::IntegratedTotalsTime24
        | TypeId::IntegratedTotalsTime56 => {
            let flags = data[4];
            (
                DataValue::BinaryCounter {
                    value: i32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                    sequence: flags & 0x1F,
                    carry: (flags & 0x20) != 0,
                    adjusted: (flags & 0x40) != 0,
                    invalid: (flags & 0x80) != 0,
                },
                Quality::from_bcr_flags(flags),
                5,
            )
        }
        other => {
            return Err(Iec60870Error::invalid_asdu(format!(
                "{} is not a monitoring data type",
                other
            )))
        }
    };

    let timestamp = match type_id.time_tag() {
        TimeTagKind::None => None,
        TimeTagKind::Cp24 => Some(Cp24Time2a::from_bytes(&data[value_len..])?.to_cp56()),
        TimeTagKind::Cp56 => Some(Cp56Time2a::from_bytes(&data[value_len..])?),
    };

    Ok(DataPoint {
        ioa,
        value,
        quality,
        timestamp,
    })
}
