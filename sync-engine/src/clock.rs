//! Wall-clock timestamps used to order mutations.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Milliseconds since the Unix epoch.
///
/// Encoded as a JSON number. Decoding also accepts RFC 3339 strings, which is
/// how older clients stamped `lastUpdated` and `deletedAt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub fn parse_rfc3339(s: &str) -> Option<Self> {
        let parsed = DateTime::parse_from_rfc3339(s).ok()?;
        u64::try_from(parsed.timestamp_millis()).ok().map(Timestamp)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Timestamp(millis)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl<'de> Visitor<'de> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("epoch milliseconds or an RFC 3339 timestamp")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
        Ok(Timestamp(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
        u64::try_from(v)
            .map(Timestamp)
            .map_err(|_| E::custom(format!("negative timestamp {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
        if v.is_finite() && v >= 0.0 && v <= u64::MAX as f64 {
            Ok(Timestamp(v as u64))
        } else {
            Err(E::custom(format!("invalid timestamp {v}")))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
        if let Ok(millis) = v.trim().parse::<u64>() {
            return Ok(Timestamp(millis));
        }
        Timestamp::parse_rfc3339(v).ok_or_else(|| E::custom(format!("invalid timestamp {v:?}")))
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System wall clock that never hands out a value smaller than one it already
/// returned, so a step backwards of the OS clock cannot reorder local writes.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = now_millis();
        let prev = self.last.fetch_max(wall, Ordering::SeqCst);
        Timestamp(prev.max(wall))
    }
}

/// Clock driven by hand. Used by tests and the simulation binary.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self { millis: AtomicU64::new(start) }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) -> Timestamp {
        Timestamp(self.millis.fetch_add(millis, Ordering::SeqCst) + millis)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_numbers_and_iso_strings() {
        let n: Timestamp = serde_json::from_str("1700000000000").unwrap();
        assert_eq!(n.as_millis(), 1_700_000_000_000);

        let f: Timestamp = serde_json::from_str("1700000000000.0").unwrap();
        assert_eq!(f, n);

        let iso: Timestamp = serde_json::from_str("\"2023-11-14T22:13:20.000Z\"").unwrap();
        assert_eq!(iso, n);

        let digits: Timestamp = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(digits.as_millis(), 42);
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(serde_json::from_str::<Timestamp>("-5").is_err());
        assert!(serde_json::from_str::<Timestamp>("\"yesterday\"").is_err());
        assert!(serde_json::from_str::<Timestamp>("true").is_err());
    }

    #[test]
    fn encodes_as_number() {
        let json = serde_json::to_string(&Timestamp::from_millis(200)).unwrap();
        assert_eq!(json, "200");
    }

    #[test]
    fn system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        clock.last.store(u64::MAX - 1, Ordering::SeqCst);
        assert_eq!(clock.now().as_millis(), u64::MAX - 1);
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now().as_millis(), 100);
        assert_eq!(clock.advance(50).as_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now().as_millis(), 10);
    }
}
