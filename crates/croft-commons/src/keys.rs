//! Key codec for the per-group stores.
//!
//! Three key classes live side by side in one ordered keyspace:
//!
//! - time-series index keys: `0x00` followed by the decimal timestamp; the
//!   value is the decimal entity id they point at
//! - entity keys: the decimal entity id; the value is the entity payload
//! - the `applied_index` sentinel tracking the last applied raft index
//!
//! Because `0x00` sorts before every ASCII digit and `'a'` sorts after them,
//! a forward scan sees all index keys first, then all entities, then the
//! sentinel. Scans over the index stop at the first key whose leading byte
//! is not `0x00`.

use crate::error::{Error, Result};

/// Reserved key tracking the raft log index of the last applied batch.
pub const APPLIED_INDEX_KEY: &[u8] = b"applied_index";

/// Leading byte of time-series index keys.
pub const TIME_SERIES_PREFIX: u8 = 0x00;

/// Encodes an entity id as its decimal ASCII form.
pub fn encode_id(id: u64) -> Vec<u8> {
    id.to_string().into_bytes()
}

/// Encodes a timestamp as a time-series index key.
pub fn encode_timestamp(ts: u64) -> Vec<u8> {
    let digits = ts.to_string();
    let mut key = Vec::with_capacity(1 + digits.len());
    key.push(TIME_SERIES_PREFIX);
    key.extend_from_slice(digits.as_bytes());
    key
}

/// A stored key decoded into its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedKey {
    /// The `applied_index` sentinel.
    AppliedIndex,
    /// A time-series index key carrying this timestamp.
    Timestamp(u64),
    /// An entity key carrying this id.
    EntityId(u64),
}

/// Decodes a stored key into its class.
pub fn parse_key(key: &[u8]) -> Result<ParsedKey> {
    if key == APPLIED_INDEX_KEY {
        return Ok(ParsedKey::AppliedIndex);
    }
    match key.split_first() {
        Some((&TIME_SERIES_PREFIX, digits)) => Ok(ParsedKey::Timestamp(parse_decimal(digits)?)),
        Some(_) => Ok(ParsedKey::EntityId(parse_decimal(key)?)),
        None => Err(Error::InvalidKeyPrefix(0)),
    }
}

/// True when the key belongs to the time-series index.
pub fn is_index_key(key: &[u8]) -> bool {
    key.first() == Some(&TIME_SERIES_PREFIX)
}

/// Decodes a time-series index entry into `(timestamp, entity_id)`.
pub fn parse_index_entry(key: &[u8], value: &[u8]) -> Result<(u64, u64)> {
    match parse_key(key)? {
        ParsedKey::Timestamp(ts) => Ok((ts, parse_decimal(value)?)),
        _ => Err(Error::InvalidKeyPrefix(key.first().copied().unwrap_or(0))),
    }
}

fn parse_decimal(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() {
        return Err(Error::InvalidKeyPrefix(0));
    }
    let mut value: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return Err(Error::InvalidKeyPrefix(b));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(Error::InvalidKeyPrefix(b))?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_keys_round_trip() {
        assert_eq!(encode_id(0), b"0");
        assert_eq!(encode_id(12345), b"12345");
        assert_eq!(parse_key(b"12345").unwrap(), ParsedKey::EntityId(12345));
        assert_eq!(parse_key(&encode_id(u64::MAX)).unwrap(), ParsedKey::EntityId(u64::MAX));
    }

    #[test]
    fn timestamp_keys_round_trip() {
        let key = encode_timestamp(1700000000000000);
        assert!(is_index_key(&key));
        assert_eq!(parse_key(&key).unwrap(), ParsedKey::Timestamp(1700000000000000));
    }

    #[test]
    fn sentinel_is_recognized() {
        assert_eq!(parse_key(APPLIED_INDEX_KEY).unwrap(), ParsedKey::AppliedIndex);
        assert!(!is_index_key(APPLIED_INDEX_KEY));
    }

    #[test]
    fn keyspace_ordering_puts_index_first_and_sentinel_last() {
        let index_key = encode_timestamp(u64::MAX);
        let entity_key = encode_id(0);
        assert!(index_key.as_slice() < entity_key.as_slice());
        assert!(entity_key.as_slice() < APPLIED_INDEX_KEY);
    }

    #[test]
    fn index_entry_decodes_both_sides() {
        let key = encode_timestamp(99);
        let value = encode_id(7);
        assert_eq!(parse_index_entry(&key, &value).unwrap(), (99, 7));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(parse_key(b"12x5"), Err(Error::InvalidKeyPrefix(b'x'))));
        assert!(matches!(parse_key(b""), Err(Error::InvalidKeyPrefix(0))));
        assert!(matches!(parse_key(&[TIME_SERIES_PREFIX]), Err(Error::InvalidKeyPrefix(0))));
        // One digit past u64::MAX overflows.
        let mut big = u64::MAX.to_string().into_bytes();
        big.push(b'9');
        assert!(parse_key(&big).is_err());
    }
}
