//! IEC 60870-5 Type Identification.
//!
//! Type identification defines the structure and meaning of information objects.

use crate::error::{Iec60870Error, Result};

/// Kind of time tag carried by an information element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeTagKind {
    /// No time tag
    None,
    /// Three octet binary time (CP24Time2a)
    Cp24,
    /// Seven octet binary time (CP56Time2a)
    Cp56,
}

/// IEC 60870-5 Type Identification.
///
/// Defines the type of information contained in an ASDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // ============================================
    // Process information in monitoring direction
    // ============================================
    /// Single-point information (M_SP_NA_1)
    SinglePoint = 1,

    /// Single-point information with time tag (M_SP_TA_1)
    SinglePointTime24 = 2,

    /// Double-point information (M_DP_NA_1)
    DoublePoint = 3,

    /// Double-point information with time tag (M_DP_TA_1)
    DoublePointTime24 = 4,

    /// Step position information (M_ST_NA_1)
    StepPosition = 5,

    /// Step position information with time tag (M_ST_TA_1)
    StepPositionTime24 = 6,

    /// Bitstring of 32 bit (M_BO_NA_1)
    Bitstring32 = 7,

    /// Bitstring of 32 bit with time tag (M_BO_TA_1)
    Bitstring32Time24 = 8,

    /// Measured value, normalized (M_ME_NA_1)
    MeasuredNormalized = 9,

    /// Measured value, normalized with time tag (M_ME_TA_1)
    MeasuredNormalizedTime24 = 10,

    /// Measured value, scaled (M_ME_NB_1)
    MeasuredScaled = 11,

    /// Measured value, scaled with time tag (M_ME_TB_1)
    MeasuredScaledTime24 = 12,

    /// Measured value, short floating point (M_ME_NC_1)
    MeasuredFloat = 13,

    /// Measured value, short floating point with time tag (M_ME_TC_1)
    MeasuredFloatTime24 = 14,

    /// Integrated totals (M_IT_NA_1)
    IntegratedTotals = 15,

    /// Integrated totals with time tag (M_IT_TA_1)
    IntegratedTotalsTime24 = 16,

    /// Measured value, normalized without quality descriptor (M_ME_ND_1)
    MeasuredNormalizedNoQuality = 21,

    /// Single-point information with time tag CP56Time2a (M_SP_TB_1)
    SinglePointTime56 = 30,

    /// Double-point information with time tag CP56Time2a (M_DP_TB_1)
    DoublePointTime56 = 31,

    /// Step position information with time tag CP56Time2a (M_ST_TB_1)
    StepPositionTime56 = 32,

    /// Bitstring of 32 bit with time tag CP56Time2a (M_BO_TB_1)
    Bitstring32Time56 = 33,

    /// Measured value, normalized with time tag CP56Time2a (M_ME_TD_1)
    MeasuredNormalizedTime56 = 34,

    /// Measured value, scaled with time tag CP56Time2a (M_ME_TE_1)
    MeasuredScaledTime56 = 35,

    /// Measured value, short floating point with time tag CP56Time2a (M_ME_TF_1)
    MeasuredFloatTime56 = 36,

    /// Integrated totals with time tag CP56Time2a (M_IT_TB_1)
    IntegratedTotalsTime56 = 37,

    // ============================================
    // Process information in control direction
    // ============================================
    /// Single command (C_SC_NA_1)
    SingleCommand = 45,

    /// Double command (C_DC_NA_1)
    DoubleCommand = 46,

    /// Regulating step command (C_RC_NA_1)
    RegulatingStep = 47,

    /// Set-point command, normalized (C_SE_NA_1)
    SetpointNormalized = 48,

    /// Set-point command, scaled (C_SE_NB_1)
    SetpointScaled = 49,

    /// Set-point command, short floating point (C_SE_NC_1)
    SetpointFloat = 50,

    /// Bitstring of 32 bit command (C_BO_NA_1)
    Bitstring32Command = 51,

    /// Single command with time tag CP56Time2a (C_SC_TA_1)
    SingleCommandTime56 = 58,

    /// Double command with time tag CP56Time2a (C_DC_TA_1)
    DoubleCommandTime56 = 59,

    /// Regulating step command with time tag CP56Time2a (C_RC_TA_1)
    RegulatingStepTime56 = 60,

    /// Set-point command, normalized with time tag CP56Time2a (C_SE_TA_1)
    SetpointNormalizedTime56 = 61,

    /// Set-point command, scaled with time tag CP56Time2a (C_SE_TB_1)
    SetpointScaledTime56 = 62,

    /// Set-point command, short floating point with time tag CP56Time2a (C_SE_TC_1)
    SetpointFloatTime56 = 63,

    /// Bitstring of 32 bit command with time tag CP56Time2a (C_BO_TA_1)
    Bitstring32CommandTime56 = 64,

    // ============================================
    // System information in monitoring direction
    // ============================================
    /// End of initialization (M_EI_NA_1)
    EndOfInit = 70,

    // ============================================
    // System information in control direction
    // ============================================
    /// Interrogation command (C_IC_NA_1)
    InterrogationCommand = 100,

    /// Counter interrogation command (C_CI_NA_1)
    CounterInterrogation = 101,

    /// Read command (C_RD_NA_1)
    ReadCommand = 102,

    /// Clock synchronization command (C_CS_NA_1)
    ClockSync = 103,

    /// Test command (C_TS_NA_1)
    TestCommand = 104,

    /// Reset process command (C_RP_NA_1)
    ResetProcess = 105,

    /// Delay acquisition command (C_CD_NA_1)
    DelayAcquisition = 106,

    /// Test command with time tag CP56Time2a (C_TS_TA_1)
    TestCommandTime56 = 107,
}

impl TypeId {
    /// Create TypeId from raw byte value.
    #[inline]
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::SinglePoint),
            2 => Ok(Self::SinglePointTime24),
            3 => Ok(Self::DoublePoint),
            4 => Ok(Self::DoublePointTime24),
            5 => Ok(Self::StepPosition),
            6 => Ok(Self::StepPositionTime24),
            7 => Ok(Self::Bitstring32),
            8 => Ok(Self::Bitstring32Time24),
            9 => Ok(Self::MeasuredNormalized),
            10 => Ok(Self::MeasuredNormalizedTime24),
            11 => Ok(Self::MeasuredScaled),
            12 => Ok(Self::MeasuredScaledTime24),
            13 => Ok(Self::MeasuredFloat),
            14 => Ok(Self::MeasuredFloatTime24),
            15 => Ok(Self::IntegratedTotals),
            16 => Ok(Self::IntegratedTotalsTime24),
            21 => Ok(Self::MeasuredNormalizedNoQuality),
            30 => Ok(Self::SinglePointTime56),
            31 => Ok(Self::DoublePointTime56),
            32 => Ok(Self::StepPositionTime56),
            33 => Ok(Self::Bitstring32Time56),
            34 => Ok(Self::MeasuredNormalizedTime56),
            35 => Ok(Self::MeasuredScaledTime56),
            36 => Ok(Self::MeasuredFloatTime56),
            37 => Ok(Self::IntegratedTotalsTime56),
            45 => Ok(Self::SingleCommand),
            46 => Ok(Self::DoubleCommand),
            47 => Ok(Self::RegulatingStep),
            48 => Ok(Self::SetpointNormalized),
            49 => Ok(Self::SetpointScaled),
            50 => Ok(Self::SetpointFloat),
            51 => Ok(Self::Bitstring32Command),
            58 => Ok(Self::SingleCommandTime56),
            59 => Ok(Self::DoubleCommandTime56),
            60 => Ok(Self::RegulatingStepTime56),
            61 => Ok(Self::SetpointNormalizedTime56),
            62 => Ok(Self::SetpointScaledTime56),
            63 => Ok(Self::SetpointFloatTime56),
            64 => Ok(Self::Bitstring32CommandTime56),
            70 => Ok(Self::EndOfInit),
            100 => Ok(Self::InterrogationCommand),
            101 => Ok(Self::CounterInterrogation),
            102 => Ok(Self::ReadCommand),
            103 => Ok(Self::ClockSync),
            104 => Ok(Self::TestCommand),
            105 => Ok(Self::ResetProcess),
            106 => Ok(Self::DelayAcquisition),
            107 => Ok(Self::TestCommandTime56),
            _ => Err(Iec60870Error::UnknownTypeId(value)),
        }
    }

    /// Convert to raw byte value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this type is in the monitoring direction (from RTU to master).
    #[inline]
    pub const fn is_monitoring(&self) -> bool {
        matches!(self.as_u8(), 1..=44 | 70)
    }

    /// Check if this type is in the control direction (from master to RTU).
    #[inline]
    pub const fn is_control(&self) -> bool {
        matches!(self.as_u8(), 45..=69 | 100..=107)
    }

    /// Check if this type is a system command (interrogation, clock sync, ...).
    #[inline]
    pub const fn is_system(&self) -> bool {
        matches!(self.as_u8(), 70 | 100..=107)
    }

    /// Kind of time tag carried by each information element of this type.
    #[inline]
    pub const fn time_tag(&self) -> TimeTagKind {
        match self {
            Self::SinglePointTime24
            | Self::DoublePointTime24
            | Self::StepPositionTime24
            | Self::Bitstring32Time24
            | Self::MeasuredNormalizedTime24
            | Self::MeasuredScaledTime24
            | Self::MeasuredFloatTime24
            | Self::IntegratedTotalsTime24 => TimeTagKind::Cp24,
            Self::SinglePointTime56
            | Self::DoublePointTime56
            | Self::StepPositionTime56
            | Self::Bitstring32Time56
            | Self::MeasuredNormalizedTime56
            | Self::MeasuredScaledTime56
            | Self::MeasuredFloatTime56
            | Self::IntegratedTotalsTime56
            | Self::SingleCommandTime56
            | Self::DoubleCommandTime56
            | Self::RegulatingStepTime56
            | Self::SetpointNormalizedTime56
            | Self::SetpointScaledTime56
            | Self::SetpointFloatTime56
            | Self::Bitstring32CommandTime56
            | Self::TestCommandTime56 => TimeTagKind::Cp56,
            _ => TimeTagKind::None,
        }
    }

    /// Check if this type contains a time tag.
    #[inline]
    pub const fn has_time_tag(&self) -> bool {
        !matches!(self.time_tag(), TimeTagKind::None)
    }

    /// Size in bytes of one information element (without the IOA).
    ///
    /// Clock synchronization carries its CP56Time2a as the element itself,
    /// so it reports 7 while `time_tag()` is `None`.
    #[inline]
    pub const fn element_size(&self) -> usize {
        let base = match self {
            Self::SinglePoint | Self::SinglePointTime24 | Self::SinglePointTime56 => 1,
            Self::DoublePoint | Self::DoublePointTime24 | Self::DoublePointTime56 => 1,
            Self::StepPosition | Self::StepPositionTime24 | Self::StepPositionTime56 => 2,
            Self::Bitstring32 | Self::Bitstring32Time24 | Self::Bitstring32Time56 => 5,
            Self::MeasuredNormalized
            | Self::MeasuredNormalizedTime24
            | Self::MeasuredNormalizedTime56 => 3,
            Self::MeasuredScaled | Self::MeasuredScaledTime24 | Self::MeasuredScaledTime56 => 3,
            Self::MeasuredFloat | Self::MeasuredFloatTime24 | Self::MeasuredFloatTime56 => 5,
            Self::IntegratedTotals
            | Self::IntegratedTotalsTime24
            | Self::IntegratedTotalsTime56 => 5,
            Self::MeasuredNormalizedNoQuality => 2,
            Self::SingleCommand | Self::SingleCommandTime56 => 1,
            Self::DoubleCommand | Self::DoubleCommandTime56 => 1,
            Self::RegulatingStep | Self::RegulatingStepTime56 => 1,
            Self::SetpointNormalized | Self::SetpointNormalizedTime56 => 3,
            Self::SetpointScaled | Self::SetpointScaledTime56 => 3,
            Self::SetpointFloat | Self::SetpointFloatTime56 => 5,
            Self::Bitstring32Command | Self::Bitstring32CommandTime56 => 4,
            Self::EndOfInit => 1,
            Self::InterrogationCommand => 1,
            Self::CounterInterrogation => 1,
            Self::ReadCommand => 0,
            Self::ClockSync => 7,
            Self::TestCommand => 2,
            Self::ResetProcess => 1,
            Self::DelayAcquisition => 2,
            Self::TestCommandTime56 => 2,
        };
        match self.time_tag() {
            TimeTagKind::None => base,
            TimeTagKind::Cp24 => base + 3,
            TimeTagKind::Cp56 => base + 7,
        }
    }

    /// Get the IEC standard name (e.g., "M_SP_NA_1").
    #[inline]
    pub const fn standard_name(&self) -> &'static str {
        match self {
            Self::SinglePoint => "M_SP_NA_1",
            Self::SinglePointTime24 => "M_SP_TA_1",
            Self::DoublePoint => "M_DP_NA_1",
            Self::DoublePointTime24 => "M_DP_TA_1",
            Self::StepPosition => "M_ST_NA_1",
            Self::StepPositionTime24 => "M_ST_TA_1",
            Self::Bitstring32 => "M_BO_NA_1",
            Self::Bitstring32Time24 => "M_BO_TA_1",
            Self::MeasuredNormalized => "M_ME_NA_1",
            Self::MeasuredNormalizedTime24 => "M_ME_TA_1",
            Self::MeasuredScaled => "M_ME_NB_1",
            Self::MeasuredScaledTime24 => "M_ME_TB_1",
            Self::MeasuredFloat => "M_ME_NC_1",
            Self::MeasuredFloatTime24 => "M_ME_TC_1",
            Self::IntegratedTotals => "M_IT_NA_1",
            Self::IntegratedTotalsTime24 => "M_IT_TA_1",
            Self::MeasuredNormalizedNoQuality => "M_ME_ND_1",
            Self::SinglePointTime56 => "M_SP_TB_1",
            Self::DoublePointTime56 => "M_DP_TB_1",
            Self::StepPositionTime56 => "M_ST_TB_1",
            Self::Bitstring32Time56 => "M_BO_TB_1",
            Self::MeasuredNormalizedTime56 => "M_ME_TD_1",
            Self::MeasuredScaledTime56 => "M_ME_TE_1",
            Self::MeasuredFloatTime56 => "M_ME_TF_1",
            Self::IntegratedTotalsTime56 => "M_IT_TB_1",
            Self::SingleCommand => "C_SC_NA_1",
            Self::DoubleCommand => "C_DC_NA_1",
            Self::RegulatingStep => "C_RC_NA_1",
            Self::SetpointNormalized => "C_SE_NA_1",
            Self::SetpointScaled => "C_SE_NB_1",
            Self::SetpointFloat => "C_SE_NC_1",
            Self::Bitstring32Command => "C_BO_NA_1",
            Self::SingleCommandTime56 => "C_SC_TA_1",
            Self::DoubleCommandTime56 => "C_DC_TA_1",
            Self::RegulatingStepTime56 => "C_RC_TA_1",
            Self::SetpointNormalizedTime56 => "C_SE_TA_1",
            Self::SetpointScaledTime56 => "C_SE_TB_1",
            Self::SetpointFloatTime56 => "C_SE_TC_1",
            Self::Bitstring32CommandTime56 => "C_BO_TA_1",
            Self::EndOfInit => "M_EI_NA_1",
            Self::InterrogationCommand => "C_IC_NA_1",
            Self::CounterInterrogation => "C_CI_NA_1",
            Self::ReadCommand => "C_RD_NA_1",
            Self::ClockSync => "C_CS_NA_1",
            Self::TestCommand => "C_TS_NA_1",
            Self::ResetProcess => "C_RP_NA_1",
            Self::DelayAcquisition => "C_CD_NA_1",
            Self::TestCommandTime56 => "C_TS_TA_1",
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.standard_name())
    }
}
