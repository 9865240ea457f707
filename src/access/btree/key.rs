use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Total order over encoded index keys.
pub trait KeyComparator: Send + Sync + fmt::Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Plain lexicographic byte order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Signed integer order for keys written by [`KeyManager::encode_i64`].
#[derive(Debug, Default, Clone, Copy)]
pub struct I64Comparator;

impl KeyComparator for I64Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        LittleEndian::read_i64(a).cmp(&LittleEndian::read_i64(b))
    }
}

/// Fixed key width plus the comparator an index is ordered by.
///
/// Every key stored in a tree has exactly `key_size` bytes; the manager is
/// handed to each node operation that needs to order keys.
#[derive(Clone)]
pub struct KeyManager {
    key_size: usize,
    comparator: Arc<dyn KeyComparator>,
}

impl KeyManager {
    pub fn new(key_size: usize, comparator: Arc<dyn KeyComparator>) -> Self {
        Self {
            key_size,
            comparator,
        }
    }

    pub fn bytewise(key_size: usize) -> Self {
        Self::new(key_size, Arc::new(BytewiseComparator))
    }

    /// 8-byte signed integer keys.
    pub fn i64() -> Self {
        Self::new(8, Arc::new(I64Comparator))
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            bail!(
                "Key length {} doesn't match index key size {}",
                key.len(),
                self.key_size
            );
        }
        Ok(())
    }

    pub fn encode_i64(value: i64) -> Vec<u8> {
        let mut key = vec![0u8; 8];
        LittleEndian::write_i64(&mut key, value);
        key
    }

    pub fn decode_i64(key: &[u8]) -> i64 {
        LittleEndian::read_i64(key)
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("key_size", &self.key_size)
            .field("comparator", &self.comparator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_ordering() {
        let km = KeyManager::i64();

        let key1 = KeyManager::encode_i64(1);
        let key256 = KeyManager::encode_i64(256);
        let key_neg = KeyManager::encode_i64(-100);

        // Little-endian bytes would misorder these bytewise
        assert_eq!(km.compare(&key1, &key256), Ordering::Less);
        assert_eq!(km.compare(&key_neg, &key1), Ordering::Less);
        assert_eq!(km.compare(&key256, &key256), Ordering::Equal);
        assert_eq!(KeyManager::decode_i64(&key_neg), -100);
    }

    #[test]
    fn test_bytewise_ordering() {
        let km = KeyManager::bytewise(4);
        assert_eq!(km.compare(b"abcd", b"abce"), Ordering::Less);
        assert_eq!(km.compare(b"b\0\0\0", b"abcd"), Ordering::Greater);
    }

    #[test]
    fn test_check_key() {
        let km = KeyManager::bytewise(4);
        assert!(km.check_key(b"abcd").is_ok());
        assert!(km.check_key(b"abc").is_err());
        assert!(KeyManager::i64().check_key(&KeyManager::encode_i64(3)).is_ok());
    }
}
