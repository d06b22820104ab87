//! Protocol timestamps
//!
//! Block timestamps are milliseconds relative to a fixed protocol epoch so
//! they fit comfortably in the 64-bit header field.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol epoch in Unix milliseconds (2022-01-21T23:00:00Z)
pub const EPOCH_UNIX_MS: u64 = 1_642_806_000_000;

/// Milliseconds since the protocol epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(EPOCH_UNIX_MS);
        Timestamp::from_unix_millis(unix_ms)
    }

    #[inline]
    pub fn from_unix_millis(unix_ms: u64) -> Self {
        Timestamp(unix_ms.saturating_sub(EPOCH_UNIX_MS))
    }

    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_secs(self) -> u32 {
        (self.0 / 1000).min(u32::MAX as u64) as u32
    }

    #[inline]
    pub fn to_unix_millis(self) -> u64 {
        self.0 + EPOCH_UNIX_MS
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Timestamp(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T+{}ms", self.0)
    }
}
