use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;

/// Wrapper for the `Date` type: days since the unix epoch.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug, Default)]
pub struct Date(pub u16);

impl Date {
    pub fn to_naive(self) -> NaiveDate {
        NaiveDate::from_yo_opt(1970, 1).unwrap() + chrono::Duration::days(self.0 as i64)
    }
}

impl From<NaiveDate> for Date {
    fn from(other: NaiveDate) -> Self {
        let epoch = NaiveDate::from_yo_opt(1970, 1).unwrap();
        Self(other.signed_duration_since(epoch).num_days() as u16)
    }
}

/// Wrapper for the `DateTime` type: unix seconds. The column timezone lives
/// in [`crate::Type::DateTime`], not in the value.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug, Default)]
pub struct DateTime(pub u32);

impl DateTime {
    pub fn to_chrono(self, tz: Tz) -> chrono::DateTime<Tz> {
        tz.timestamp_opt(self.0 as i64, 0).unwrap()
    }
}

impl From<chrono::DateTime<Tz>> for DateTime {
    fn from(other: chrono::DateTime<Tz>) -> Self {
        Self(other.timestamp() as u32)
    }
}

/// Wrapper for the `DateTime64` type: unix ticks scaled by the column
/// precision (10^p ticks per second).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug, Default)]
pub struct DateTime64(pub i64);

impl DateTime64 {
    /// Builds a scaled tick count from unix seconds plus sub-second ticks.
    pub fn from_parts(seconds: i64, subticks: u32, precision: usize) -> Self {
        Self(seconds * 10i64.pow(precision as u32) + subticks as i64)
    }

    pub fn seconds(self, precision: usize) -> i64 {
        self.0.div_euclid(10i64.pow(precision as u32))
    }

    pub fn to_chrono(self, precision: usize, tz: Tz) -> chrono::DateTime<Tz> {
        let scale = 10i64.pow(precision as u32);
        let nanos = self.0.rem_euclid(scale) as u32 * 10u32.pow(9 - precision as u32);
        tz.timestamp_opt(self.0.div_euclid(scale), nanos).unwrap()
    }
}

/// Raw 256-bit signed integer, stored as little-endian bytes as on the wire.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug, Default)]
#[allow(non_camel_case_types)]
pub struct i256(pub [u8; 32]);

impl i256 {
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl From<i128> for i256 {
    fn from(other: i128) -> Self {
        let mut buf = if other < 0 { [0xFFu8; 32] } else { [0u8; 32] };
        buf[..16].copy_from_slice(&other.to_le_bytes()[..]);
        i256(buf)
    }
}

/// Raw 256-bit unsigned integer, stored as little-endian bytes as on the wire.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug, Default)]
#[allow(non_camel_case_types)]
pub struct u256(pub [u8; 32]);

impl u256 {
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl From<u128> for u256 {
    fn from(other: u128) -> Self {
        let mut buf = [0u8; 32];
        buf[..16].copy_from_slice(&other.to_le_bytes()[..]);
        u256(buf)
    }
}

impl From<i256> for u256 {
    fn from(other: i256) -> Self {
        u256(other.0)
    }
}
