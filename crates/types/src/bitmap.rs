//! Fixed-length bit vector used for confirmed-rows read sets.

use crate::codec::{decode, encode, CodecError};
use sbor::prelude::*;

/// Fixed-length bitmap. Bit `i` corresponds to input key `i` of the batch
/// that produced it; the length never changes after construction.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RowBitmap {
    len: u32,
    words: Vec<u64>,
}

impl RowBitmap {
    /// Create an all-zero bitmap of `len` bits.
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; Self::word_count(len)],
        }
    }

    fn word_count(len: u32) -> usize {
        (len as usize).div_ceil(64)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    ///
    /// Panics if `index >= len`.
    pub fn set(&mut self, index: u32) {
        self.check(index);
        self.words[(index / 64) as usize] |= 1u64 << (index % 64);
    }

    /// # Panics
    ///
    /// Panics if `index >= len`.
    pub fn reset(&mut self, index: u32) {
        self.check(index);
        self.words[(index / 64) as usize] &= !(1u64 << (index % 64));
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words
            .get((index / 64) as usize)
            .is_some_and(|word| word & (1u64 << (index % 64)) != 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |i| self.get(*i))
    }

    fn check(&self, index: u32) {
        assert!(
            index < self.len,
            "bit index {index} out of range for bitmap of length {}",
            self.len
        );
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Check that the word vector matches the declared length. Bitmaps
    /// decoded from a peer must pass this before any bit is read.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.words.len() != Self::word_count(self.len) {
            return Err(CodecError::Invalid(format!(
                "bitmap of {} bits carries {} words",
                self.len,
                self.words.len()
            )));
        }
        Ok(())
    }

    /// Decode and [`validate`](Self::validate).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let bitmap: Self = decode(bytes)?;
        bitmap.validate()?;
        Ok(bitmap)
    }
}

impl FromIterator<bool> for RowBitmap {
    fn from_iter<T: IntoIterator<Item = bool>>(iter: T) -> Self {
        let bits: Vec<bool> = iter.into_iter().collect();
        let mut bitmap = RowBitmap::new(bits.len() as u32);
        for (i, bit) in bits.into_iter().enumerate() {
            if bit {
                bitmap.set(i as u32);
            }
        }
        bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reset_get() {
        let mut bitmap = RowBitmap::new(70);
        bitmap.set(0);
        bitmap.set(65);
        bitmap.set(3);
        bitmap.reset(3);

        assert!(bitmap.get(0));
        assert!(!bitmap.get(3));
        assert!(bitmap.get(65));
        assert!(!bitmap.get(69));
        assert!(!bitmap.get(500));
        assert_eq!(bitmap.count_ones(), 2);
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![0, 65]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_out_of_range_panics() {
        let mut bitmap = RowBitmap::new(3);
        bitmap.set(3);
    }

    #[test]
    fn test_bytes_preserve_length() {
        let bitmap: RowBitmap = [true, false, true].into_iter().collect();
        let decoded = RowBitmap::from_bytes(&bitmap.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.get(0) && !decoded.get(1) && decoded.get(2));
    }

    #[test]
    fn test_empty_bitmap() {
        let bitmap = RowBitmap::new(0);
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.count_ones(), 0);
        let decoded = RowBitmap::from_bytes(&bitmap.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, bitmap);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(RowBitmap::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_word_count_mismatch_is_rejected() {
        let short = RowBitmap {
            len: 3,
            words: vec![],
        };
        assert!(matches!(short.validate(), Err(CodecError::Invalid(_))));
        assert!(!short.get(0));
        let bytes = short.to_bytes().unwrap();
        assert!(matches!(
            RowBitmap::from_bytes(&bytes),
            Err(CodecError::Invalid(_))
        ));
    }
}
