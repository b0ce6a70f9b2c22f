//! Kind-scoped cache key system for the per-tenant LMDB environment.
//!
//! Every record lives under `(kind, id)`, so two kinds can share an id
//! without ever colliding in the cache.

use keeper_core::{RecordId, RecordKind};

/// Separator byte between the kind tag and the id.
const SEPARATOR: u8 = 0xFF;

/// Id tag for integer identifiers.
const INT_TAG: u8 = 0x01;

/// Id tag for string keys.
const KEY_TAG: u8 = 0x02;

/// Longest string id that fits LMDB's 511-byte key limit once tagged.
pub const MAX_KEY_LEN: usize = 511 - 3;

/// A cache key scoped to one record kind.
///
/// # Binary Format
///
/// - Byte 0: kind tag ([`RecordKind::tag`])
/// - Byte 1: separator (0xFF)
/// - Byte 2: id tag (0x01 integer, 0x02 string)
/// - Bytes 3..: 8-byte big-endian integer with the sign bit flipped, or the
///   UTF-8 key
///
/// Integer ids therefore sort numerically within their kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    kind: RecordKind,
    id: RecordId,
}

impl RecordKey {
    pub fn new(kind: RecordKind, id: RecordId) -> Self {
        Self { kind, id }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(11);
        bytes.push(self.kind.tag());
        bytes.push(SEPARATOR);
        match &self.id {
            RecordId::Int(id) => {
                bytes.push(INT_TAG);
                bytes.extend_from_slice(&((*id as u64) ^ (1 << 63)).to_be_bytes());
            }
            RecordId::Key(key) => {
                bytes.push(KEY_TAG);
                bytes.extend_from_slice(key.as_bytes());
            }
        }
        bytes
    }

    /// Decode a key from bytes, or `None` if it is malformed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 || bytes[1] != SEPARATOR {
            return None;
        }
        let kind = RecordKind::from_tag(bytes[0])?;
        let id = match bytes[2] {
            INT_TAG => {
                let raw: [u8; 8] = bytes[3..].try_into().ok()?;
                RecordId::Int((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
            }
            KEY_TAG => RecordId::Key(std::str::from_utf8(&bytes[3..]).ok()?.to_string()),
            _ => return None,
        };
        Some(Self { kind, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_int() {
        let key = RecordKey::new(RecordKind::Job, RecordId::Int(42));
        let encoded = key.encode();
        assert_eq!(encoded.len(), 11);
        assert_eq!(RecordKey::decode(&encoded), Some(key));
    }

    #[test]
    fn test_encode_decode_string_key() {
        let key = RecordKey::new(RecordKind::MatchResult, RecordId::from("job-1:profile-2"));
        let decoded = RecordKey::decode(&key.encode()).expect("decode should succeed");
        assert_eq!(decoded.kind(), RecordKind::MatchResult);
        assert_eq!(decoded.id().as_key(), Some("job-1:profile-2"));
    }

    #[test]
    fn test_same_id_different_kinds_different_keys() {
        let job = RecordKey::new(RecordKind::Job, RecordId::Int(1));
        let company = RecordKey::new(RecordKind::Company, RecordId::Int(1));
        assert_ne!(job.encode(), company.encode());
    }

    #[test]
    fn test_int_keys_sort_numerically() {
        let small = RecordKey::new(RecordKind::Profile, RecordId::Int(2)).encode();
        let large = RecordKey::new(RecordKind::Profile, RecordId::Int(300)).encode();
        assert!(small < large);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(RecordKey::decode(&[]).is_none());
        assert!(RecordKey::decode(&[3, 0x00, INT_TAG]).is_none());
        assert!(RecordKey::decode(&[9, SEPARATOR, INT_TAG, 0, 0, 0, 0, 0, 0, 0, 1]).is_none());
        assert!(RecordKey::decode(&[3, SEPARATOR, INT_TAG, 0, 1]).is_none());
        assert!(RecordKey::decode(&[3, SEPARATOR, 0x07]).is_none());
    }

    #[test]
    fn test_longest_key_fits_lmdb_limit() {
        let key = RecordKey::new(RecordKind::MatchResult, RecordId::from("k".repeat(MAX_KEY_LEN)));
        assert_eq!(key.encode().len(), 511);
    }
}
