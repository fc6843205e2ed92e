//! Binary time tags.
//!
//! - [`Cp56Time2a`] - seven octet time (date and time of day)
//! - [`Cp24Time2a`] - three octet time (minutes and milliseconds)
//! - [`Cp16Time2a`] - two octet elapsed time in milliseconds

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::error::{Iec60870Error, Result};

/// CP56Time2a timestamp (7 bytes).
///
/// Byte layout:
/// ```text
/// 0-1: milliseconds incl. seconds (0..=59999), little-endian
/// 2:   IV(7) SU(6) minutes(5:0)
/// 3:   SU(7) hours(4:0)
/// 4:   day_of_week(7:5) day(4:0)
/// 5:   month(3:0)
/// 6:   year(6:0), years since 2000
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp56Time2a {
    /// Milliseconds (0-59999)
    pub milliseconds: u16,
    /// Minutes (0-59)
    pub minutes: u8,
    /// Hours (0-23)
    pub hours: u8,
    /// Day of month (1-31)
    pub day: u8,
    /// Day of week (1-7, 1=Monday, 0=unused)
    pub day_of_week: u8,
    /// Month (1-12)
    pub month: u8,
    /// Year (0-99, years since 2000)
    pub year: u8,
    /// Invalid flag
    pub invalid: bool,
    /// Substituted flag
    pub substituted: bool,
    /// Summer time flag
    pub summer_time: bool,
}

impl Cp56Time2a {
    /// Encoded size in bytes.
    pub const SIZE: usize = 7;

    /// Parse from 7 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Iec60870Error::invalid_asdu("CP56Time2a too short"));
        }

        Ok(Self {
            milliseconds: u16::from_le_bytes([bytes[0], bytes[1]]),
            minutes: bytes[2] & 0x3F,
            invalid: (bytes[2] & 0x80) != 0,
            substituted: (bytes[2] & 0x40) != 0,
            hours: bytes[3] & 0x1F,
            summer_time: (bytes[3] & 0x80) != 0,
            day: bytes[4] & 0x1F,
            day_of_week: (bytes[4] >> 5) & 0x07,
            month: bytes[5] & 0x0F,
            year: bytes[6] & 0x7F,
        })
    }

    /// Encode to 7 bytes.
    pub fn to_bytes(&self) -> [u8; 7] {
        let [ms_lo, ms_hi] = self.milliseconds.to_le_bytes();
        [
            ms_lo,
            ms_hi,
            (self.minutes & 0x3F)
                | if self.invalid { 0x80 } else { 0 }
                | if self.substituted { 0x40 } else { 0 },
            (self.hours & 0x1F) | if self.summer_time { 0x80 } else { 0 },
            (self.day & 0x1F) | ((self.day_of_week & 0x07) << 5),
            self.month & 0x0F,
            self.year & 0x7F,
        ]
    }

    /// Build from a UTC calendar time. Years outside 2000..=2099 wrap.
    pub fn from_datetime(time: &DateTime<Utc>) -> Self {
        Self {
            milliseconds: (time.second() * 1000 + time.timestamp_subsec_millis().min(999)) as u16,
            minutes: time.minute() as u8,
            hours: time.hour() as u8,
            day: time.day() as u8,
            day_of_week: time.weekday().number_from_monday() as u8,
            month: time.month() as u8,
            year: time.year().rem_euclid(100) as u8,
            invalid: false,
            substituted: false,
            summer_time: false,
        }
    }

    /// Convert to a UTC calendar time, interpreting the year as 2000 + year.
    ///
    /// Returns `None` when the fields do not form a valid date.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::from_ymd_opt(
            2000 + self.year as i32,
            self.month as u32,
            self.day as u32,
        )?;
        let naive = date.and_hms_milli_opt(
            self.hours as u32,
            self.minutes as u32,
            (self.milliseconds / 1000) as u32,
            (self.milliseconds % 1000) as u32,
        )?;
        Some(naive.and_utc())
    }

    /// Build from milliseconds since the Unix epoch.
    pub fn from_unix_ms(ms: u64) -> Self {
        match i64::try_from(ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
        {
            Some(time) => Self::from_datetime(&time),
            None => Self {
                invalid: true,
                ..Self::default()
            },
        }
    }

    /// Milliseconds since the Unix epoch, or `None` for an invalid date.
    pub fn to_unix_ms(&self) -> Option<u64> {
        let ms = self.to_datetime()?.timestamp_millis();
        u64::try_from(ms).ok()
    }

    /// Current system time.
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    /// Seconds part of the milliseconds field.
    #[inline]
    pub const fn seconds(&self) -> u8 {
        (self.milliseconds / 1000) as u8
    }
}

impl std::fmt::Display for Cp56Time2a {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            self.year,
            self.month,
            self.day,
            self.hours,
            self.minutes,
            self.milliseconds / 1000,
            self.milliseconds % 1000
        )?;
        if self.invalid {
            f.write_str(" IV")?;
        }
        Ok(())
    }
}

/// CP24Time2a timestamp (3 bytes): milliseconds and minutes of the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp24Time2a {
    /// Milliseconds (0-59999)
    pub milliseconds: u16,
    /// Minutes (0-59)
    pub minutes: u8,
    /// Invalid flag
    pub invalid: bool,
    /// Substituted flag
    pub substituted: bool,
}

impl Cp24Time2a {
    /// Encoded size in bytes.
    pub const SIZE: usize = 3;

    /// Parse from 3 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Iec60870Error::invalid_asdu("CP24Time2a too short"));
        }
        Ok(Self {
            milliseconds: u16::from_le_bytes([bytes[0], bytes[1]]),
            minutes: bytes[2] & 0x3F,
            invalid: (bytes[2] & 0x80) != 0,
            substituted: (bytes[2] & 0x40) != 0,
        })
    }

    /// Encode to 3 bytes.
    pub fn to_bytes(&self) -> [u8; 3] {
        let [ms_lo, ms_hi] = self.milliseconds.to_le_bytes();
        [
            ms_lo,
            ms_hi,
            (self.minutes & 0x3F)
                | if self.invalid { 0x80 } else { 0 }
                | if self.substituted { 0x40 } else { 0 },
        ]
    }

    /// Widen to a CP56Time2a with all date and hour fields zero.
    pub const fn to_cp56(&self) -> Cp56Time2a {
        Cp56Time2a {
            milliseconds: self.milliseconds,
            minutes: self.minutes,
            hours: 0,
            day: 0,
            day_of_week: 0,
            month: 0,
            year: 0,
            invalid: self.invalid,
            substituted: self.substituted,
            summer_time: false,
        }
    }
}

impl From<Cp56Time2a> for Cp24Time2a {
    fn from(time: Cp56Time2a) -> Self {
        Self {
            milliseconds: time.milliseconds,
            minutes: time.minutes,
            invalid: time.invalid,
            substituted: time.substituted,
        }
    }
}

/// CP16Time2a elapsed time in milliseconds (0..=59999).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp16Time2a(pub u16);

impl Cp16Time2a {
    /// Encoded size in bytes.
    pub const SIZE: usize = 2;

    /// Parse from 2 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Iec60870Error::invalid_asdu("CP16Time2a too short"));
        }
        Ok(Self(u16::from_le_bytes([bytes[0], bytes[1]])))
    }

    /// Encode to 2 bytes.
    #[inline]
    pub const fn to_bytes(&self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    /// Elapsed milliseconds.
    #[inline]
    pub const fn as_millis(&self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Cp56Time2a {
        Cp56Time2a {
            milliseconds: 30500,
            minutes: 45,
            hours: 13,
            day: 15,
            day_of_week: 6,
            month: 6,
            year: 24,
            invalid: false,
            substituted: false,
            summer_time: false,
        }
    }

    #[test]
    fn test_cp56_bytes() {
        let time = sample();
        let bytes = time.to_bytes();
        assert_eq!(bytes, [0x24, 0x77, 45, 13, 0xCF, 6, 24]);
        assert_eq!(Cp56Time2a::from_bytes(&bytes).unwrap(), time);
    }

    #[test]
    fn test_cp56_flags() {
        let time = Cp56Time2a {
            invalid: true,
            substituted: true,
            summer_time: true,
            ..sample()
        };
        let bytes = time.to_bytes();
        assert_eq!(bytes[2], 0x80 | 0x40 | 45);
        assert_eq!(bytes[3], 0x80 | 13);

        let parsed = Cp56Time2a::from_bytes(&bytes).unwrap();
        assert!(parsed.invalid);
        assert!(parsed.substituted);
        assert!(parsed.summer_time);
        assert_eq!(parsed.minutes, 45);
        assert_eq!(parsed.hours, 13);
    }

    #[test]
    fn test_cp56_too_short() {
        assert!(Cp56Time2a::from_bytes(&[0; 6]).is_err());
    }

    #[test]
    fn test_cp56_datetime() {
        let dt = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 30).unwrap()
            + chrono::Duration::milliseconds(500);
        let time = Cp56Time2a::from_datetime(&dt);
        assert_eq!(time, sample());
        assert_eq!(time.seconds(), 30);
        assert_eq!(time.to_datetime(), Some(dt));
    }

    #[test]
    fn test_cp56_unix_ms() {
        // 2024-01-01T00:00:00.250Z
        let ms = 1_704_067_200_250;
        let time = Cp56Time2a::from_unix_ms(ms);
        assert_eq!(time.year, 24);
        assert_eq!(time.month, 1);
        assert_eq!(time.day, 1);
        assert_eq!(time.day_of_week, 1);
        assert_eq!(time.milliseconds, 250);
        assert_eq!(time.to_unix_ms(), Some(ms));
    }

    #[test]
    fn test_cp56_invalid_date() {
        let time = Cp56Time2a {
            month: 13,
            ..sample()
        };
        assert_eq!(time.to_datetime(), None);
        assert_eq!(time.to_unix_ms(), None);
    }

    #[test]
    fn test_cp56_display() {
        assert_eq!(sample().to_string(), "2024-06-15 13:45:30.500");
    }

    #[test]
    fn test_cp24() {
        let time = Cp24Time2a {
            milliseconds: 1234,
            minutes: 7,
            invalid: true,
            substituted: false,
        };
        let bytes = time.to_bytes();
        assert_eq!(bytes, [0xD2, 0x04, 0x87]);
        assert_eq!(Cp24Time2a::from_bytes(&bytes).unwrap(), time);

        let wide = time.to_cp56();
        assert_eq!(wide.milliseconds, 1234);
        assert_eq!(wide.minutes, 7);
        assert_eq!(wide.year, 0);
        assert!(wide.invalid);
        assert_eq!(Cp24Time2a::from(wide), time);
    }

    #[test]
    fn test_cp16() {
        let time = Cp16Time2a::from_bytes(&[0x10, 0x27]).unwrap();
        assert_eq!(time.as_millis(), 10000);
        assert_eq!(time.to_bytes(), [0x10, 0x27]);
        assert!(Cp16Time2a::from_bytes(&[1]).is_err());
    }
}
