//! Control and system direction information objects.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Iec60870Error, Result};
use crate::types::{
    normalized_from_raw, normalized_to_raw, Asdu, AsduHeader, Cot, Cp16Time2a, Cp56Time2a,
    DoublePointValue, InformationObject, Ioa, TypeId,
};

/// Qualifier of interrogation for a station interrogation.
pub const QOI_STATION: u8 = 20;

/// Qualifier of counter interrogation: general request, no freeze.
pub const QCC_GENERAL: u8 = 5;

/// Fixed test bit pattern of C_TS_NA_1.
pub const TEST_PATTERN: u16 = 0x55AA;

/// Regulating step command state (RCS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommand {
    /// Next step lower
    Lower = 1,
    /// Next step higher
    Higher = 2,
}

/// Control or system command with its qualifier fields.
///
/// `time` on process commands selects the CP56Time2a variant of the type
/// (C_SC_TA_1 instead of C_SC_NA_1, and so on).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Single command (SCO)
    Single {
        state: bool,
        select: bool,
        qualifier: u8,
        time: Option<Cp56Time2a>,
    },
    /// Double command (DCO)
    Double {
        state: DoublePointValue,
        select: bool,
        qualifier: u8,
        time: Option<Cp56Time2a>,
    },
    /// Regulating step command (RCO)
    RegulatingStep {
        step: StepCommand,
        select: bool,
        qualifier: u8,
        time: Option<Cp56Time2a>,
    },
    /// Set-point command, normalized value
    SetpointNormalized {
        value: f32,
        select: bool,
        qualifier: u8,
        time: Option<Cp56Time2a>,
    },
    /// Set-point command, scaled value
    SetpointScaled {
        value: i16,
        select: bool,
        qualifier: u8,
        time: Option<Cp56Time2a>,
    },
    /// Set-point command, short floating point value
    SetpointFloat {
        value: f32,
        select: bool,
        qualifier: u8,
        time: Option<Cp56Time2a>,
    },
    /// Bitstring of 32 bit command
    Bitstring {
        value: u32,
        time: Option<Cp56Time2a>,
    },
    /// Interrogation command (QOI)
    Interrogation { qoi: u8 },
    /// Counter interrogation command (QCC)
    CounterInterrogation { qcc: u8 },
    /// Read command
    Read,
    /// Clock synchronization command
    ClockSync { time: Cp56Time2a },
    /// Test command with the fixed test pattern
    Test,
    /// Test command with counter and time tag
    TestWithTime { counter: u16, time: Cp56Time2a },
    /// Reset process command (QRP)
    ResetProcess { qrp: u8 },
    /// Delay acquisition command
    DelayAcquisition { delay: Cp16Time2a },
    /// End of initialization (COI)
    EndOfInit { coi: u8 },
}

#[inline]
fn select_bit(select: bool) -> u8 {
    if select {
        0x80
    } else {
        0
    }
}

impl Command {
    /// Single command, execute, no additional qualifier.
    pub fn single(state: bool) -> Self {
        Self::Single {
            state,
            select: false,
            qualifier: 0,
            time: None,
        }
    }

    /// Type identification used to transmit this command.
    pub fn type_id(&self) -> TypeId {
        match self {
            Self::Single { time: None, .. } => TypeId::SingleCommand,
            Self::Single { time: Some(_), .. } => TypeId::SingleCommandTime56,
            Self::Double { time: None, .. } => TypeId::DoubleCommand,
            Self::Double { time: Some(_), .. } => TypeId::DoubleCommandTime56,
            Self::RegulatingStep { time: None, .. } => TypeId::RegulatingStep,
            Self::RegulatingStep { time: Some(_), .. } => TypeId::RegulatingStepTime56,
            Self::SetpointNormalized { time: None, .. } => TypeId::SetpointNormalized,
            Self::SetpointNormalized { time: Some(_), .. } => TypeId::SetpointNormalizedTime56,
            Self::SetpointScaled { time: None, .. } => TypeId::SetpointScaled,
            Self::SetpointScaled { time: Some(_), .. } => TypeId::SetpointScaledTime56,
            Self::SetpointFloat { time: None, .. } => TypeId::SetpointFloat,
            Self::SetpointFloat { time: Some(_), .. } => TypeId::SetpointFloatTime56,
            Self::Bitstring { time: None, .. } => TypeId::Bitstring32Command,
            Self::Bitstring { time: Some(_), .. } => TypeId::Bitstring32CommandTime56,
            Self::Interrogation { .. } => TypeId::InterrogationCommand,
            Self::CounterInterrogation { .. } => TypeId::CounterInterrogation,
            Self::Read => TypeId::ReadCommand,
            Self::ClockSync { .. } => TypeId::ClockSync,
            Self::Test => TypeId::TestCommand,
            Self::TestWithTime { .. } => TypeId::TestCommandTime56,
            Self::ResetProcess { .. } => TypeId::ResetProcess,
            Self::DelayAcquisition { .. } => TypeId::DelayAcquisition,
            Self::EndOfInit { .. } => TypeId::EndOfInit,
        }
    }

    /// Check if this is the select phase of a select-before-operate sequence.
    pub fn is_select(&self) -> bool {
        matches!(
            self,
            Self::Single { select: true, .. }
                | Self::Double { select: true, .. }
                | Self::RegulatingStep { select: true, .. }
                | Self::SetpointNormalized { select: true, .. }
                | Self::SetpointScaled { select: true, .. }
                | Self::SetpointFloat { select: true, .. }
        )
    }

    /// Encode the information element (without IOA).
    pub fn encode_element(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.type_id().element_size());
        let time = match self {
            Self::Single {
                state,
                select,
                qualifier,
                time,
            } => {
                buf.put_u8(*state as u8 | ((qualifier & 0x1F) << 2) | select_bit(*select));
                time
            }
            Self::Double {
                state,
                select,
                qualifier,
                time,
            } => {
                buf.put_u8(state.as_u8() | ((qualifier & 0x1F) << 2) | select_bit(*select));
                time
            }
            Self::RegulatingStep {
                step,
                select,
                qualifier,
                time,
            } => {
                buf.put_u8(*step as u8 | ((qualifier & 0x1F) << 2) | select_bit(*select));
                time
            }
            Self::SetpointNormalized {
                value,
                select,
                qualifier,
                time,
            } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8((qualifier & 0x7F) | select_bit(*select));
                time
            }
            Self::SetpointScaled {
                value,
                select,
                qualifier,
                time,
            } => {
                buf.put_i16_le(*value);
                buf.put_u8((qualifier & 0x7F) | select_bit(*select));
                time
            }
            Self::SetpointFloat {
                value,
                select,
                qualifier,
                time,
            } => {
                buf.put_f32_le(*value);
                buf.put_u8((qualifier & 0x7F) | select_bit(*select));
                time
            }
            Self::Bitstring { value, time } => {
                buf.put_u32_le(*value);
                time
            }
            Self::Interrogation { qoi } => {
                buf.put_u8(*qoi);
                &None
            }
            Self::CounterInterrogation { qcc } => {
                buf.put_u8(*qcc);
                &None
            }
            Self::Read => &None,
            Self::ClockSync { time } => {
                buf.put_slice(&time.to_bytes());
                &None
            }
            Self::Test => {
                buf.put_u16_le(TEST_PATTERN);
                &None
            }
            Self::TestWithTime { counter, time } => {
                buf.put_u16_le(*counter);
                buf.put_slice(&time.to_bytes());
                &None
            }
            Self::ResetProcess { qrp } => {
                buf.put_u8(*qrp);
                &None
            }
            Self::DelayAcquisition { delay } => {
                buf.put_slice(&delay.to_bytes());
                &None
            }
            Self::EndOfInit { coi } => {
                buf.put_u8(*coi);
                &None
            }
        };
        if let Some(time) = time {
            buf.put_slice(&time.to_bytes());
        }
        buf.freeze()
    }

    /// Decode an information element of a control or system type.
    pub fn decode(type_id: TypeId, data: &[u8]) -> Result<Self> {
        let size = type_id.element_size();
        if data.len() < size {
            return Err(Iec60870Error::invalid_asdu(format!(
                "{} element too short: {} < {}",
                type_id,
                data.len(),
                size
            )));
        }

        let cp56_at = |pos: usize| Cp56Time2a::from_bytes(&data[pos..]);
        let optional_time = |pos: usize| -> Result<Option<Cp56Time2a>> {
            if type_id.has_time_tag() {
                cp56_at(pos).map(Some)
            } else {
                Ok(None)
            }
        };

        let command = match type_id {
            TypeId::SingleCommand | TypeId::SingleCommandTime56 => Self::Single {
                state: (data[0] & 0x01) != 0,
                select: (data[0] & 0x80) != 0,
                qualifier: (data[0] >> 2) & 0x1F,
                time: optional_time(1)?,
            },
            TypeId::DoubleCommand | TypeId::DoubleCommandTime56 => Self::Double {
                state: DoublePointValue::from_u8(data[0]),
                select: (data[0] & 0x80) != 0,
                qualifier: (data[0] >> 2) & 0x1F,
                time: optional_time(1)?,
            },
            TypeId::RegulatingStep | TypeId::RegulatingStepTime56 => Self::RegulatingStep {
                step: match data[0] & 0x03 {
                    1 => StepCommand::Lower,
                    2 => StepCommand::Higher,
                    other => {
                        return Err(Iec60870Error::invalid_asdu(format!(
                            "regulating step state {} not permitted",
                            other
                        )))
                    }
                },
                select: (data[0] & 0x80) != 0,
                qualifier: (data[0] >> 2) & 0x1F,
                time: optional_time(1)?,
            },
            TypeId::SetpointNormalized | TypeId::SetpointNormalizedTime56 => {
                Self::SetpointNormalized {
                    value: normalized_from_raw(i16::from_le_bytes([data[0], data[1]])),
                    select: (data[2] & 0x80) != 0,
                    qualifier: data[2] & 0x7F,
                    time: optional_time(3)?,
                }
            }
            TypeId::SetpointScaled | TypeId::SetpointScaledTime56 => Self::SetpointScaled {
                value: i16::from_le_bytes([data[0], data[1]]),
                select: (data[2] & 0x80) != 0,
                qualifier: data[2] & 0x7F,
                time: optional_time(3)?,
            },
            TypeId::SetpointFloat | TypeId::SetpointFloatTime56 => Self::SetpointFloat {
                value: f32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                select: (data[4] & 0x80) != 0,
                qualifier: data[4] & 0x7F,
                time: optional_time(5)?,
            },
            TypeId::Bitstring32Command | TypeId::Bitstring32CommandTime56 => Self::Bitstring {
                value: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                time: optional_time(4)?,
            },
            TypeId::InterrogationCommand => Self::Interrogation { qoi: data[0] },
            TypeId::CounterInterrogation => Self::CounterInterrogation { qcc: data[0] },
            TypeId::ReadCommand => Self::Read,
            TypeId::ClockSync => Self::ClockSync { time: cp56_at(0)? },
            TypeId::TestCommand => Self::Test,
            TypeId::TestCommandTime56 => Self::TestWithTime {
                counter: u16::from_le_bytes([data[0], data[1]]),
                time: cp56_at(2)?,
            },
            TypeId::ResetProcess => Self::ResetProcess { qrp: data[0] },
            TypeId::DelayAcquisition => Self::DelayAcquisition {
                delay: Cp16Time2a::from_bytes(data)?,
            },
            TypeId::EndOfInit => Self::EndOfInit { coi: data[0] },
            other => {
                return Err(Iec60870Error::invalid_asdu(format!(
                    "{} is not a command type",
                    other
                )))
            }
        };
        Ok(command)
    }

    /// Build a single-object ASDU carrying this command.
    pub fn to_asdu(&self, cot: Cot, common_address: u16, ioa: u32) -> Asdu {
        let mut asdu = Asdu::new(AsduHeader::new(self.type_id(), 1, cot, common_address));
        asdu.objects.push(InformationObject {
            ioa: Ioa::new(ioa),
            data: self.encode_element(),
        });
        asdu
    }
}

impl Asdu {
    /// Station interrogation command ASDU.
    pub fn interrogation_command(common_address: u16, qoi: u8) -> Self {
        Command::Interrogation { qoi }.to_asdu(Cot::Activation, common_address, 0)
    }

    /// Clock synchronization command ASDU.
    pub fn clock_sync_command(common_address: u16, time: Cp56Time2a) -> Self {
        Command::ClockSync { time }.to_asdu(Cot::Activation, common_address, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time() -> Cp56Time2a {
        Cp56Time2a {
            milliseconds: 1000,
            minutes: 2,
            hours: 3,
            day: 4,
            day_of_week: 5,
            month: 6,
            year: 25,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_command_encoding() {
        let cmd = Command::Single {
            state: true,
            select: true,
            qualifier: 1,
            time: None,
        };
        assert_eq!(cmd.type_id(), TypeId::SingleCommand);
        assert!(cmd.is_select());
        assert_eq!(&cmd.encode_element()[..], &[0x85]);
        assert_eq!(Command::decode(TypeId::SingleCommand, &[0x85]).unwrap(), cmd);

        assert_eq!(&Command::single(false).encode_element()[..], &[0x00]);
    }

    #[test]
    fn test_command_with_time() {
        let cmd = Command::Double {
            state: DoublePointValue::On,
            select: false,
            qualifier: 0,
            time: Some(time()),
        };
        assert_eq!(cmd.type_id(), TypeId::DoubleCommandTime56);
        let bytes = cmd.encode_element();
        assert_eq!(bytes.len(), TypeId::DoubleCommandTime56.element_size());
        assert_eq!(bytes[0], 0x02);
        assert_eq!(Command::decode(TypeId::DoubleCommandTime56, &bytes).unwrap(), cmd);
    }

    #[test]
    fn test_setpoint_encoding() {
        let cmd = Command::SetpointFloat {
            value: 1.0,
            select: false,
            qualifier: 0,
            time: None,
        };
        assert_eq!(&cmd.encode_element()[..], &[0x00, 0x00, 0x80, 0x3F, 0x00]);

        let cmd = Command::SetpointScaled {
            value: -100,
            select: true,
            qualifier: 0,
            time: None,
        };
        let bytes = cmd.encode_element();
        assert_eq!(&bytes[..], &[0x9C, 0xFF, 0x80]);
        assert_eq!(Command::decode(TypeId::SetpointScaled, &bytes).unwrap(), cmd);

        let cmd = Command::SetpointNormalized {
            value: -0.5,
            select: false,
            qualifier: 3,
            time: Some(time()),
        };
        let bytes = cmd.encode_element();
        assert_eq!(&bytes[..3], &[0x00, 0xC0, 0x03]);
        assert_eq!(
            Command::decode(TypeId::SetpointNormalizedTime56, &bytes).unwrap(),
            cmd
        );
    }

    #[test]
    fn test_regulating_step() {
        let bytes = [0x02];
        let cmd = Command::decode(TypeId::RegulatingStep, &bytes).unwrap();
        assert!(matches!(
            cmd,
            Command::RegulatingStep {
                step: StepCommand::Higher,
                ..
            }
        ));
        assert!(Command::decode(TypeId::RegulatingStep, &[0x03]).is_err());
    }

    #[test]
    fn test_system_commands() {
        assert_eq!(
            &Command::Interrogation { qoi: QOI_STATION }.encode_element()[..],
            &[20]
        );
        assert_eq!(&Command::Test.encode_element()[..], &[0xAA, 0x55]);
        assert!(Command::Read.encode_element().is_empty());
        assert_eq!(
            &Command::DelayAcquisition {
                delay: Cp16Time2a(500)
            }
            .encode_element()[..],
            &[0xF4, 0x01]
        );

        let cmd = Command::TestWithTime {
            counter: 7,
            time: time(),
        };
        let bytes = cmd.encode_element();
        assert_eq!(bytes.len(), 9);
        assert_eq!(Command::decode(TypeId::TestCommandTime56, &bytes).unwrap(), cmd);

        let cmd = Command::ClockSync { time: time() };
        assert_eq!(
            Command::decode(TypeId::ClockSync, &cmd.encode_element()).unwrap(),
            cmd
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(Command::decode(TypeId::SetpointFloat, &[0, 0, 0]).is_err());
        assert!(Command::decode(TypeId::MeasuredFloat, &[0; 5]).is_err());
    }

    #[test]
    fn test_to_asdu() {
        let asdu = Command::single(true).to_asdu(Cot::Activation, 1, 5000);
        assert_eq!(asdu.header.vsq.count, 1);
        assert_eq!(asdu.type_id(), TypeId::SingleCommand);
        let buf = asdu.encode().unwrap();
        assert_eq!(&buf[..], &[45, 1, 6, 0, 1, 0, 0x88, 0x13, 0x00, 0x01]);

        let asdu = Asdu::interrogation_command(1, QOI_STATION);
        assert_eq!(asdu.type_id(), TypeId::InterrogationCommand);
        assert_eq!(asdu.objects[0].ioa.value(), 0);
        assert_eq!(&asdu.objects[0].data[..], &[20]);
    }
}
