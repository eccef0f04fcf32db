//! Composite index keys.
//!
//! A key begins with the predicate so that lexicographic byte order groups
//! every entry of a predicate contiguously, which is what lets the map phase
//! sort raw encoded entries and what keeps each predicate inside a single
//! output stream. Layout:
//!
//! ```text
//! data key:  pred bytes ‖ 0x00 ‖ 0x01 ‖ subject uid (8B big-endian)
//! count key: pred bytes ‖ 0x00 ‖ 0x02 ‖ group size  (4B big-endian)
//! split key: data key ‖ fragment start uid (8B big-endian)
//! ```
//!
//! Predicates must not contain NUL; the separator makes the predicate
//! component prefix-free. Within a predicate, data keys sort before count
//! keys, subject uids sort numerically, a base key sorts before its split
//! fragments, and fragments sort by ascending start uid.

use crate::error::{BulkError, Result};

pub const KIND_DATA: u8 = 0x01;
pub const KIND_COUNT: u8 = 0x02;

const SEP: u8 = 0x00;
const UID_LEN: usize = 8;
const COUNT_LEN: usize = 4;

/// Key for the posting list of (predicate, subject).
pub fn data_key(predicate: &str, uid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(predicate.len() + 2 + UID_LEN);
    key.extend_from_slice(predicate.as_bytes());
    key.push(SEP);
    key.push(KIND_DATA);
    key.extend_from_slice(&uid.to_be_bytes());
    key
}

/// Key for the count-index entry of (predicate, group size).
pub fn count_key(predicate: &str, count: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(predicate.len() + 2 + COUNT_LEN);
    key.extend_from_slice(predicate.as_bytes());
    key.push(SEP);
    key.push(KIND_COUNT);
    key.extend_from_slice(&count.to_be_bytes());
    key
}

/// Extend a data key with the start uid of a split-list fragment.
pub fn split_key(data_key: &[u8], start_uid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(data_key.len() + UID_LEN);
    key.extend_from_slice(data_key);
    key.extend_from_slice(&start_uid.to_be_bytes());
    key
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub predicate: String,
    pub kind: u8,
    /// Subject uid for data keys, zero for count keys.
    pub uid: u64,
    /// Group size for count keys, zero for data keys.
    pub count: u32,
    /// Present only on split-list continuation keys.
    pub start_uid: Option<u64>,
}

impl ParsedKey {
    #[inline]
    pub fn is_data(&self) -> bool {
        self.kind == KIND_DATA
    }

    #[inline]
    pub fn has_start_uid(&self) -> bool {
        self.start_uid.is_some()
    }
}

/// Decode a composite key. Malformed keys are an encoding fault, never a
/// recoverable condition.
pub fn parse_key(key: &[u8]) -> Result<ParsedKey> {
    let corrupt = |what: &str| BulkError::Corrupt(format!("key: {what}"));

    let sep = key
        .iter()
        .position(|&b| b == SEP)
        .ok_or_else(|| corrupt("missing predicate separator"))?;
    if sep == 0 {
        return Err(corrupt("empty predicate"));
    }
    let predicate = std::str::from_utf8(&key[..sep])
        .map_err(|_| corrupt("predicate is not UTF-8"))?
        .to_string();

    let rest = &key[sep + 1..];
    let (&kind, payload) = rest.split_first().ok_or_else(|| corrupt("missing kind"))?;
    match kind {
        KIND_DATA => match payload.len() {
            UID_LEN => Ok(ParsedKey {
                predicate,
                kind,
                uid: u64::from_be_bytes(payload.try_into().unwrap()),
                count: 0,
                start_uid: None,
            }),
            l if l == 2 * UID_LEN => Ok(ParsedKey {
                predicate,
                kind,
                uid: u64::from_be_bytes(payload[..UID_LEN].try_into().unwrap()),
                count: 0,
                start_uid: Some(u64::from_be_bytes(payload[UID_LEN..].try_into().unwrap())),
            }),
            l => Err(corrupt(&format!("data key payload of {l} bytes"))),
        },
        KIND_COUNT => {
            if payload.len() != COUNT_LEN {
                return Err(corrupt(&format!(
                    "count key payload of {} bytes",
                    payload.len()
                )));
            }
            Ok(ParsedKey {
                predicate,
                kind,
                uid: 0,
                count: u32::from_be_bytes(payload.try_into().unwrap()),
                start_uid: None,
            })
        }
        other => Err(corrupt(&format!("unknown kind {other:#04x}"))),
    }
}
