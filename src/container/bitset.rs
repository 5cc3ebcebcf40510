use std::io::{self, Write};
use std::iter::Iterator;
use std::mem;
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::AllocError;
use crate::memory::{Memory, MemVec};
use crate::container::*;

/// The size of the bitset in 64bit words
pub const BITSET_SIZE_IN_WORDS: usize = 1024;

/// Alignment of the bitset storage in bytes
pub(crate) const BITSET_ALIGNMENT: usize = 32;

/// A bitset container used in a roaring bitmap.
///
/// # Structure
/// Contents are aligned to the 32byte boundary and stored as 64bit words
#[derive(Debug)]
pub struct BitsetContainer {
    bitset: MemVec<u64>,
    cardinality: usize
}

impl BitsetContainer {
    /// Create a new empty bitset
    pub fn new_in(memory: Memory) -> Result<Self, AllocError> {
        Ok(Self {
            bitset: MemVec::zeroed_aligned_in(BITSET_SIZE_IN_WORDS, BITSET_ALIGNMENT, memory)?,
            cardinality: 0
        })
    }

    /// Create a bitset holding every value of `array`
    pub fn from_array_in(array: &ArrayContainer, memory: Memory) -> Result<Self, AllocError> {
        let mut bitset = Self::new_in(memory)?;
        for value in array.iter() {
            bitset.add(*value);
        }

        Ok(bitset)
    }

    /// The memory the words are allocated from
    #[inline]
    pub fn memory(&self) -> &Memory {
        self.bitset.memory()
    }

    /// Set the bit for `value`
    ///
    /// # Returns
    /// `true` if the value was not present before
    pub fn add(&mut self, value: u16) -> bool {
        let word_index = (value >> 6) as usize;
        let mask = 1u64 << (value & 0x3F);
        let word = self.bitset[word_index];

        self.bitset[word_index] = word | mask;

        let added = word & mask == 0;
        if added {
            self.cardinality += 1;
        }

        added
    }

    /// Set all the bits within the range denoted by [min-max)
    pub fn set_range(&mut self, range: Range<u32>) {
        debug_assert!(range.end <= 1 << 16);

        if range.is_empty() {
            return;
        }

        let first = (range.start >> 6) as usize;
        let last = ((range.end - 1) >> 6) as usize;

        for word_index in first..=last {
            let lo = if word_index == first { range.start & 0x3F } else { 0 };
            let hi = if word_index == last { ((range.end - 1) & 0x3F) + 1 } else { 64 };

            let mask = if hi - lo == 64 { !0u64 } else { ((1u64 << (hi - lo)) - 1) << lo };
            let word = self.bitset[word_index];

            self.cardinality += (mask & !word).count_ones() as usize;
            self.bitset[word_index] = word | mask;
        }
    }

    /// Check if the bitset contains a specified value
    #[inline]
    pub fn contains(&self, value: u16) -> bool {
        let word = self.bitset[(value >> 6) as usize];

        word & (1 << (value & 0x3F)) != 0
    }

    /// Check if every value of the chunk is set
    #[inline]
    pub fn is_full(&self) -> bool {
        self.cardinality == BITSET_SIZE_IN_WORDS * 64
    }

    /// The cardinality of the bitset
    #[inline]
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Get the minimum value in the bitset
    pub fn min(&self) -> Option<u16> {
        self.bitset.iter()
            .enumerate()
            .find(|(_i, word)| **word != 0)
            .map(|(i, word)| (i * 64 + word.trailing_zeros() as usize) as u16)
    }

    /// Get the maximum value in the bitset
    pub fn max(&self) -> Option<u16> {
        self.bitset.iter()
            .enumerate()
            .rev()
            .find(|(_i, word)| **word != 0)
            .map(|(i, word)| (i * 64 + 63 - word.leading_zeros() as usize) as u16)
    }

    /// Get the words of the bitset
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.bitset
    }

    /// Get an iterator over the values of the bitset
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(&self.bitset)
    }

    /// Copy the bitset into storage from `memory`
    pub fn try_clone_in(&self, memory: Memory) -> Result<Self, AllocError> {
        Ok(Self {
            bitset: self.bitset.try_clone_in(memory)?,
            cardinality: self.cardinality
        })
    }

    /// Number of bytes allocated for the words
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.bitset.capacity() * mem::size_of::<u64>()
    }
}

impl BitsetContainer {
    /// Get the size in bytes of a bitset container
    #[inline]
    pub fn serialized_size() -> usize {
        BITSET_SIZE_IN_WORDS * mem::size_of::<u64>()
    }

    /// Write the words as little endian 64 bit integers
    pub fn serialize<W: Write>(&self, buf: &mut W) -> io::Result<usize> {
        for word in self.bitset.iter() {
            buf.write_u64::<LittleEndian>(*word)?;
        }

        Ok(Self::serialized_size())
    }

    /// Read a full bitset from `bytes`
    pub(crate) fn deserialize_in(bytes: &[u8], memory: Memory) -> Result<Self, ContainerError> {
        let len = Self::serialized_size();
        if bytes.len() < len {
            return Err(ContainerError::Invalid("bitset payload is truncated"));
        }

        let mut bitset = MemVec::<u64>::zeroed_aligned_in(BITSET_SIZE_IN_WORDS, BITSET_ALIGNMENT, memory)?;
        LittleEndian::read_u64_into(&bytes[..len], &mut bitset);

        let cardinality = bitset.iter()
            .map(|word| word.count_ones() as usize)
            .sum();

        Ok(Self {
            bitset,
            cardinality
        })
    }
}

/// An iterator over the values of a bitset
pub struct Iter<'a> {
    /// The list of words in the bitset
    words: &'a [u64],

    /// The current word index in the bitset
    word_index: usize,

    /// The remaining bits of the current word
    word: u64
}

impl<'a> Iter<'a> {
    fn new(words: &'a [u64]) -> Self {
        Self {
            words,
            word_index: 0,
            word: words.first().copied().unwrap_or(0)
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = u16;

    fn next(&mut self) -> Option<Self::Item> {
        while self.word == 0 {
            self.word_index += 1;

            if self.word_index >= self.words.len() {
                return None;
            }

            self.word = self.words[self.word_index];
        }

        let bit = self.word.trailing_zeros() as usize;

        // Clear the lowest set bit
        self.word &= self.word - 1;

        // Guaranteed to not truncate due to how containers work
        Some((self.word_index * 64 + bit) as u16)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_and_contains() {
        let mut bitset = BitsetContainer::new_in(Memory::system()).unwrap();

        assert!(bitset.add(0));
        assert!(bitset.add(64));
        assert!(bitset.add(65535));
        assert!(!bitset.add(64));

        assert_eq!(bitset.cardinality(), 3);
        assert!(bitset.contains(65535));
        assert!(!bitset.contains(63));
        assert_eq!(bitset.iter().collect::<Vec<_>>(), vec![0, 64, 65535]);
        assert_eq!(bitset.min(), Some(0));
        assert_eq!(bitset.max(), Some(65535));
    }

    #[test]
    fn set_range_counts_new_bits() {
        let mut bitset = BitsetContainer::new_in(Memory::system()).unwrap();
        bitset.add(10);
        bitset.set_range(5..200);

        assert_eq!(bitset.cardinality(), 195);
        assert_eq!(bitset.iter().collect::<Vec<_>>(), (5..200).collect::<Vec<u16>>());

        bitset.set_range(0..1 << 16);
        assert!(bitset.is_full());
    }

    #[test]
    fn storage_is_aligned() {
        let bitset = BitsetContainer::new_in(Memory::system()).unwrap();

        assert_eq!(bitset.words().as_ptr() as usize % BITSET_ALIGNMENT, 0);
        assert_eq!(bitset.size_in_bytes(), BitsetContainer::serialized_size());
    }

    #[test]
    fn serialize_round_trip() {
        let mut bitset = BitsetContainer::new_in(Memory::system()).unwrap();
        bitset.set_range(1000..9000);

        let mut bytes = Vec::new();
        assert_eq!(bitset.serialize(&mut bytes).unwrap(), 8192);

        let decoded = BitsetContainer::deserialize_in(&bytes, Memory::system()).unwrap();
        assert_eq!(decoded.cardinality(), 8000);
        assert_eq!(decoded.words(), bitset.words());
    }
}
