//! Unix-time helpers shared by the marshaller, watcher and HTTP layer.
//!
//! On disk every timestamp is the low 32 bits of unix seconds as 4 bytes
//! big-endian, so keys carrying a time sort chronologically.

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::AppError;

pub const TIMESTAMP_BYTE_LENGTH: usize = 4;

/// Current wall clock as unix seconds.
pub fn now_secs() -> u64 {
    Utc::now().timestamp() as u64
}

/// Marshal unix seconds to the fixed 4-byte big-endian wire form.
pub fn marshal_time(secs: u64) -> [u8; TIMESTAMP_BYTE_LENGTH] {
    let mut buf = [0u8; TIMESTAMP_BYTE_LENGTH];
    BigEndian::write_u32(&mut buf, (secs & 0xFFFF_FFFF) as u32);
    buf
}

/// Inverse of [`marshal_time`].
pub fn unmarshal_time(bytes: &[u8]) -> u64 {
    BigEndian::read_u32(&bytes[..TIMESTAMP_BYTE_LENGTH]) as u64
}

/// Parse a query-string time: unix seconds, ISO 8601 with offset, or ISO
/// 8601 without a zone (interpreted as UTC).
pub fn parse_time_str(s: &str) -> Result<u64, AppError> {
    if let Ok(unix) = s.parse::<i64>() {
        if unix < 0 {
            return Err(AppError::InvalidInput(format!("negative time {s}")));
        }
        return Ok(unix as u64);
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Ok(dt.timestamp() as u64);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc().timestamp() as u64);
    }
    Err(AppError::InvalidInput(format!("malformed time {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_round_trip() {
        let t = 1546848896u64;
        assert_eq!(unmarshal_time(&marshal_time(t)), t);
    }

    #[test]
    fn time_truncates_to_low_32_bits() {
        let t = (1u64 << 32) + 42;
        assert_eq!(unmarshal_time(&marshal_time(t)), 42);
    }

    #[test]
    fn marshaled_times_sort_chronologically() {
        let a = marshal_time(100);
        let b = marshal_time(1546848896);
        assert!(a < b);
    }

    #[test]
    fn parse_unix_string() {
        assert_eq!(parse_time_str("1546848896").unwrap(), 1546848896);
    }

    #[test]
    fn parse_iso8601_with_offset() {
        let t = parse_time_str("2019-01-07T08:14:56+0000").unwrap();
        assert_eq!(t, 1546848896);
    }

    #[test]
    fn parse_iso8601_without_zone() {
        let t = parse_time_str("2019-01-07T08:14:56").unwrap();
        assert_eq!(t, 1546848896);
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_time_str("yesterday").is_err());
    }
}
