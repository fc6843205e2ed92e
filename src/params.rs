//! Protocol parameters.
//!
//! - [`AppLayerParameters`] - field sizes of the ASDU header and IOA
//! - [`ApciParameters`] - CS104 window sizes and timeouts
//! - [`LinkLayerParameters`] - CS101 (FT1.2) link layer settings

use std::time::Duration;

use crate::error::{Iec60870Error, Result};

/// Default K parameter (max unconfirmed I-frames).
pub const DEFAULT_K: u16 = 12;

/// Default W parameter (max unconfirmed receives before sending S-frame).
pub const DEFAULT_W: u16 = 8;

/// Default T0 timeout (connection establishment) in seconds.
pub const DEFAULT_T0_TIMEOUT: u64 = 10;

/// Default T1 timeout (send confirmation) in seconds.
pub const DEFAULT_T1_TIMEOUT: u64 = 15;

/// Default T2 timeout (no data acknowledgment) in seconds.
pub const DEFAULT_T2_TIMEOUT: u64 = 10;

/// Default T3 timeout (test frame) in seconds.
pub const DEFAULT_T3_TIMEOUT: u64 = 20;

/// Application layer parameters.
///
/// These define the sizes of the variable-length ASDU fields. Both stations
/// must use the same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppLayerParameters {
    /// Size of the cause of transmission field (1 or 2). With 2 bytes the
    /// second byte carries the originator address.
    pub size_of_cot: u8,
    /// Originator address written into outgoing ASDUs
    pub originator_address: u8,
    /// Size of the common address (1 or 2)
    pub size_of_ca: u8,
    /// Size of the information object address (1, 2 or 3)
    pub size_of_ioa: u8,
    /// Maximum size of an encoded ASDU
    pub max_asdu_size: usize,
}

impl AppLayerParameters {
    /// Parameters used by IEC 60870-5-104.
    pub const fn cs104() -> Self {
        Self {
            size_of_cot: 2,
            originator_address: 0,
            size_of_ca: 2,
            size_of_ioa: 3,
            max_asdu_size: 249,
        }
    }

    /// Default parameters for IEC 60870-5-101.
    pub const fn cs101() -> Self {
        Self::cs104()
    }

    /// Set the originator address.
    pub fn originator_address(mut self, oa: u8) -> Self {
        self.originator_address = oa;
        self
    }

    /// Size of the data unit identifier (type id, VSQ, COT, CA).
    #[inline]
    pub const fn header_size(&self) -> usize {
        2 + self.size_of_cot as usize + self.size_of_ca as usize
    }

    /// Largest IOA representable with the configured size.
    #[inline]
    pub const fn max_ioa(&self) -> u32 {
        match self.size_of_ioa {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0x00FF_FFFF,
        }
    }

    /// Largest common address representable with the configured size.
    #[inline]
    pub const fn max_common_address(&self) -> u16 {
        if self.size_of_ca == 1 {
            0xFF
        } else {
            0xFFFF
        }
    }

    /// Check that all field sizes are legal.
    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.size_of_cot) {
            return Err(Iec60870Error::config("size_of_cot must be 1 or 2"));
        }
        if !(1..=2).contains(&self.size_of_ca) {
            return Err(Iec60870Error::config("size_of_ca must be 1 or 2"));
        }
        if !(1..=3).contains(&self.size_of_ioa) {
            return Err(Iec60870Error::config("size_of_ioa must be 1, 2 or 3"));
        }
        if self.max_asdu_size <= self.header_size() || self.max_asdu_size > 255 {
            return Err(Iec60870Error::config(format!(
                "max_asdu_size {} out of range",
                self.max_asdu_size
            )));
        }
        Ok(())
    }
}

impl Default for AppLayerParameters {
    fn default() -> Self {
        Self::cs104()
    }
}

/// CS104 APCI parameters (window sizes and timeouts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApciParameters {
    /// Max unconfirmed sent I-frames
    pub k: u16,
    /// Max received I-frames before an acknowledgment is sent
    pub w: u16,
    /// T0: connection establishment timeout
    pub t0: Duration,
    /// T1: time to wait for an acknowledgment of a sent frame
    pub t1: Duration,
    /// T2: time before an acknowledgment is sent when no data is transmitted
    pub t2: Duration,
    /// T3: idle time before a test frame is sent
    pub t3: Duration,
}

impl ApciParameters {
    /// Set K.
    pub fn k(mut self, k: u16) -> Self {
        self.k = k;
        self
    }

    /// Set W.
    pub fn w(mut self, w: u16) -> Self {
        self.w = w;
        self
    }

    /// Set T0 timeout.
    pub fn t0(mut self, timeout: Duration) -> Self {
        self.t0 = timeout;
        self
    }

    /// Set T1 timeout.
    pub fn t1(mut self, timeout: Duration) -> Self {
        self.t1 = timeout;
        self
    }

    /// Set T2 timeout.
    pub fn t2(mut self, timeout: Duration) -> Self {
        self.t2 = timeout;
        self
    }

    /// Set T3 timeout.
    pub fn t3(mut self, timeout: Duration) -> Self {
        self.t3 = timeout;
        self
    }

    /// Check that the parameters are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > 32767 {
            return Err(Iec60870Error::config("k must be in 1..=32767"));
        }
        if self.w == 0 || self.w > self.k {
            return Err(Iec60870Error::config("w must be in 1..=k"));
        }
        if self.t0.is_zero() || self.t1.is_zero() || self.t2.is_zero() || self.t3.is_zero() {
            return Err(Iec60870Error::config("timeouts must be non-zero"));
        }
        if self.t2 >= self.t1 {
            return Err(Iec60870Error::config("t2 must be less than t1"));
        }
        Ok(())
    }
}

impl Default for ApciParameters {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            w: DEFAULT_W,
            t0: Duration::from_secs(DEFAULT_T0_TIMEOUT),
            t1: Duration::from_secs(DEFAULT_T1_TIMEOUT),
            t2: Duration::from_secs(DEFAULT_T2_TIMEOUT),
            t3: Duration::from_secs(DEFAULT_T3_TIMEOUT),
        }
    }
}

/// CS101 link layer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLayerParameters {
    /// Length of the link address field in bytes (0, 1 or 2)
    pub address_length: u8,
    /// Time to wait for a response from the secondary station
    pub timeout_for_ack: Duration,
    /// Time after which a repeatedly unanswered request puts the link in error
    pub timeout_repeat: Duration,
    /// Answer with the single character 0xE5 instead of a fixed ACK frame
    pub use_single_char_ack: bool,
}

impl LinkLayerParameters {
    /// Set address length.
    pub fn address_length(mut self, length: u8) -> Self {
        self.address_length = length;
        self
    }

    /// Set the response timeout.
    pub fn timeout_for_ack(mut self, timeout: Duration) -> Self {
        self.timeout_for_ack = timeout;
        self
    }

    /// Set the repeat timeout.
    pub fn timeout_repeat(mut self, timeout: Duration) -> Self {
        self.timeout_repeat = timeout;
        self
    }

    /// Enable or disable single character acknowledgments.
    pub fn use_single_char_ack(mut self, enabled: bool) -> Self {
        self.use_single_char_ack = enabled;
        self
    }

    /// Broadcast address for the configured address length.
    #[inline]
    pub const fn broadcast_address(&self) -> u16 {
        match self.address_length {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0,
        }
    }

    /// Check that the parameters are legal.
    pub fn validate(&self) -> Result<()> {
        if self.address_length > 2 {
            return Err(Iec60870Error::config("address_length must be 0, 1 or 2"));
        }
        if self.timeout_for_ack.is_zero() {
            return Err(Iec60870Error::config("timeout_for_ack must be non-zero"));
        }
        if self.timeout_repeat < self.timeout_for_ack {
            return Err(Iec60870Error::config(
                "timeout_repeat must not be shorter than timeout_for_ack",
            ));
        }
        Ok(())
    }
}

impl Default for LinkLayerParameters {
    fn default() -> Self {
        Self {
            address_length: 1,
            timeout_for_ack: Duration::from_millis(200),
            timeout_repeat: Duration::from_millis(1000),
            use_single_char_ack: true,
        }
    }
}
