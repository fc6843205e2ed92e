//! IEC 60870-5 Cause of Transmission (COT).
//!
//! The cause of transmission defines the reason for sending an ASDU.
//! The raw octet also carries the test (T) and negative (P/N) bits; these are
//! kept separately in [`AsduHeader`](super::AsduHeader).

use crate::error::{Iec60870Error, Result};

/// Cause of Transmission (COT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cot {
    /// Periodic, cyclic (1)
    Periodic = 1,
    /// Background scan (2)
    Background = 2,
    /// Spontaneous (3)
    Spontaneous = 3,
    /// Initialized (4)
    Initialized = 4,
    /// Request or requested (5)
    Request = 5,
    /// Activation (6)
    Activation = 6,
    /// Activation confirmation (7)
    ActivationConfirm = 7,
    /// Deactivation (8)
    Deactivation = 8,
    /// Deactivation confirmation (9)
    DeactivationConfirm = 9,
    /// Activation termination (10)
    ActivationTermination = 10,
    /// Return information caused by a remote command (11)
    ReturnRemoteCommand = 11,
    /// Return information caused by a local command (12)
    ReturnLocalCommand = 12,
    /// File transfer (13)
    FileTransfer = 13,
    /// Interrogated by station interrogation (20)
    InterrogatedByStation = 20,
    /// Interrogated by group 1 interrogation (21)
    InterrogatedByGroup1 = 21,
    /// Interrogated by group 2 interrogation (22)
    InterrogatedByGroup2 = 22,
    /// Interrogated by group 3 interrogation (23)
    InterrogatedByGroup3 = 23,
    /// Interrogated by group 4 interrogation (24)
    InterrogatedByGroup4 = 24,
    /// Interrogated by group 5 interrogation (25)
    InterrogatedByGroup5 = 25,
    /// Interrogated by group 6 interrogation (26)
    InterrogatedByGroup6 = 26,
    /// Interrogated by group 7 interrogation (27)
    InterrogatedByGroup7 = 27,
    /// Interrogated by group 8 interrogation (28)
    InterrogatedByGroup8 = 28,
    /// Interrogated by group 9 interrogation (29)
    InterrogatedByGroup9 = 29,
    /// Interrogated by group 10 interrogation (30)
    InterrogatedByGroup10 = 30,
    /// Interrogated by group 11 interrogation (31)
    InterrogatedByGroup11 = 31,
    /// Interrogated by group 12 interrogation (32)
    InterrogatedByGroup12 = 32,
    /// Interrogated by group 13 interrogation (33)
    InterrogatedByGroup13 = 33,
    /// Interrogated by group 14 interrogation (34)
    InterrogatedByGroup14 = 34,
    /// Interrogated by group 15 interrogation (35)
    InterrogatedByGroup15 = 35,
    /// Interrogated by group 16 interrogation (36)
    InterrogatedByGroup16 = 36,
    /// Requested by general counter request (37)
    RequestedByGeneralCounter = 37,
    /// Requested by group 1 counter request (38)
    RequestedByGroup1Counter = 38,
    /// Requested by group 2 counter request (39)
    RequestedByGroup2Counter = 39,
    /// Requested by group 3 counter request (40)
    RequestedByGroup3Counter = 40,
    /// Requested by group 4 counter request (41)
    RequestedByGroup4Counter = 41,
    /// Unknown type identification (44)
    UnknownTypeId = 44,
    /// Unknown cause of transmission (45)
    UnknownCot = 45,
    /// Unknown common address of ASDU (46)
    UnknownCommonAddress = 46,
    /// Unknown information object address (47)
    UnknownIoa = 47,
}

const INTERROGATION_GROUPS: [Cot; 16] = [
    Cot::InterrogatedByGroup1,
    Cot::InterrogatedByGroup2,
    Cot::InterrogatedByGroup3,
    Cot::InterrogatedByGroup4,
    Cot::InterrogatedByGroup5,
    Cot::InterrogatedByGroup6,
    Cot::InterrogatedByGroup7,
    Cot::InterrogatedByGroup8,
    Cot::InterrogatedByGroup9,
    Cot::InterrogatedByGroup10,
    Cot::InterrogatedByGroup11,
    Cot::InterrogatedByGroup12,
    Cot::InterrogatedByGroup13,
    Cot::InterrogatedByGroup14,
    Cot::InterrogatedByGroup15,
    Cot::InterrogatedByGroup16,
];

impl Cot {
    /// Create COT from raw byte value (lower 6 bits).
    #[inline]
    pub fn from_u8(value: u8) -> Result<Self> {
        let cot = match value & 0x3F {
            1 => Self::Periodic,
            2 => Self::Background,
            3 => Self::Spontaneous,
            4 => Self::Initialized,
            5 => Self::Request,
            6 => Self::Activation,
            7 => Self::ActivationConfirm,
            8 => Self::Deactivation,
            9 => Self::DeactivationConfirm,
            10 => Self::ActivationTermination,
            11 => Self::ReturnRemoteCommand,
            12 => Self::ReturnLocalCommand,
            13 => Self::FileTransfer,
            20 => Self::InterrogatedByStation,
            v @ 21..=36 => INTERROGATION_GROUPS[(v - 21) as usize],
            37 => Self::RequestedByGeneralCounter,
            38 => Self::RequestedByGroup1Counter,
            39 => Self::RequestedByGroup2Counter,
            40 => Self::RequestedByGroup3Counter,
            41 => Self::RequestedByGroup4Counter,
            44 => Self::UnknownTypeId,
            45 => Self::UnknownCot,
            46 => Self::UnknownCommonAddress,
            47 => Self::UnknownIoa,
            other => return Err(Iec60870Error::UnknownCot(other)),
        };
        Ok(cot)
    }

    /// Convert to raw byte value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// COT used when answering an interrogation with the given qualifier.
    ///
    /// QOI 20 maps to station interrogation, 21..=36 to the group causes.
    pub fn for_interrogation(qoi: u8) -> Option<Self> {
        match qoi {
            20 => Some(Self::InterrogatedByStation),
            21..=36 => Some(INTERROGATION_GROUPS[(qoi - 21) as usize]),
            _ => None,
        }
    }

    /// COT used when answering a counter interrogation with the given request
    /// qualifier (lower 6 bits of QCC).
    pub fn for_counter_interrogation(rqt: u8) -> Option<Self> {
        match rqt & 0x3F {
            5 => Some(Self::RequestedByGeneralCounter),
            1 => Some(Self::RequestedByGroup1Counter),
            2 => Some(Self::RequestedByGroup2Counter),
            3 => Some(Self::RequestedByGroup3Counter),
            4 => Some(Self::RequestedByGroup4Counter),
            _ => None,
        }
    }

    /// Check if this is a positive confirmation.
    #[inline]
    pub const fn is_positive(&self) -> bool {
        matches!(
            self,
            Self::ActivationConfirm | Self::DeactivationConfirm | Self::ActivationTermination
        )
    }

    /// Check if this is a negative confirmation.
    #[inline]
    pub const fn is_negative(&self) -> bool {
        matches!(
            self,
            Self::UnknownTypeId | Self::UnknownCot | Self::UnknownCommonAddress | Self::UnknownIoa
        )
    }

    /// Check if this COT indicates an interrogation response.
    #[inline]
    pub const fn is_interrogation_response(&self) -> bool {
        matches!(self.as_u8(), 20..=36)
    }

    /// Check if this COT indicates a counter request response.
    #[inline]
    pub const fn is_counter_response(&self) -> bool {
        matches!(self.as_u8(), 37..=41)
    }

    /// Short name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Periodic => "Periodic",
            Self::Background => "Background",
            Self::Spontaneous => "Spontaneous",
            Self::Initialized => "Initialized",
            Self::Request => "Request",
            Self::Activation => "Activation",
            Self::ActivationConfirm => "ActivationConfirm",
            Self::Deactivation => "Deactivation",
            Self::DeactivationConfirm => "DeactivationConfirm",
            Self::ActivationTermination => "ActivationTermination",
            Self::ReturnRemoteCommand => "ReturnRemoteCommand",
            Self::ReturnLocalCommand => "ReturnLocalCommand",
            Self::FileTransfer => "FileTransfer",
            Self::InterrogatedByStation => "InterrogatedByStation",
            Self::InterrogatedByGroup1
            | Self::InterrogatedByGroup2
            | Self::InterrogatedByGroup3
            | Self::InterrogatedByGroup4
            | Self::InterrogatedByGroup5
            | Self::InterrogatedByGroup6
            | Self::InterrogatedByGroup7
            | Self::InterrogatedByGroup8
            | Self::InterrogatedByGroup9
            | Self::InterrogatedByGroup10
            | Self::InterrogatedByGroup11
            | Self::InterrogatedByGroup12
            | Self::InterrogatedByGroup13
            | Self::InterrogatedByGroup14
            | Self::InterrogatedByGroup15
            | Self::InterrogatedByGroup16 => "InterrogatedByGroup",
            Self::RequestedByGeneralCounter => "RequestedByGeneralCounter",
            Self::RequestedByGroup1Counter
            | Self::RequestedByGroup2Counter
            | Self::RequestedByGroup3Counter
            | Self::RequestedByGroup4Counter => "RequestedByGroupCounter",
            Self::UnknownTypeId => "UnknownTypeId",
            Self::UnknownCot => "UnknownCot",
            Self::UnknownCommonAddress => "UnknownCommonAddress",
            Self::UnknownIoa => "UnknownIoa",
        }
    }
}

impl std::fmt::Display for Cot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_u8() {
            21..=36 => write!(f, "InterrogatedByGroup{}", self.as_u8() - 20),
            38..=41 => write!(f, "RequestedByGroup{}Counter", self.as_u8() - 37),
            _ => f.write_str(self.name()),
        }
    }
}
