use std::io::{self, Write};
use std::mem;
use std::ops::Deref;
use std::slice;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::AllocError;
use crate::memory::{Memory, MemVec};
use crate::container::*;

/// An array container. Elements are sorted numerically and represented as individual values in the array
#[derive(Debug)]
pub struct ArrayContainer {
    array: MemVec<u16>
}

impl ArrayContainer {
    /// Create a new array container. Does not allocate
    pub fn new_in(memory: Memory) -> Self {
        Self {
            array: MemVec::new_in(memory)
        }
    }

    /// Create a new array container with a specified capacity
    pub fn with_capacity_in(capacity: usize, memory: Memory) -> Result<Self, AllocError> {
        Ok(Self {
            array: MemVec::with_capacity_in(capacity, memory)?
        })
    }

    /// Create an array container holding `values`
    ///
    /// # Remarks
    /// Values must be sorted, unique and no more than `DEFAULT_MAX_SIZE` of them
    pub fn from_sorted_in(values: &[u16], memory: Memory) -> Result<Self, AllocError> {
        debug_assert!(values.len() <= DEFAULT_MAX_SIZE);
        debug_assert!(values.windows(2).all(|w| w[0] < w[1]));

        let mut container = Self::with_capacity_in(values.len(), memory)?;
        container.array.extend_from_slice(values)?;

        Ok(container)
    }

    /// The memory the values are allocated from
    #[inline]
    pub fn memory(&self) -> &Memory {
        self.array.memory()
    }

    /// The cardinality of the array container
    #[inline]
    pub fn cardinality(&self) -> usize {
        // Len is the same as the cardinality for raw sets of integers
        self.array.len()
    }

    /// The capacity of the array container
    #[inline]
    pub fn capacity(&self) -> usize {
        self.array.capacity()
    }

    /// Check if the array has reached `DEFAULT_MAX_SIZE` and can't take any more values
    #[inline]
    pub fn is_full(&self) -> bool {
        self.array.len() >= DEFAULT_MAX_SIZE
    }

    /// Add a value to the array
    ///
    /// # Returns
    /// `true` if the array holds the value afterwards, which includes a value that was
    /// already present. `false` only if the value is absent and the array is full
    pub fn add(&mut self, value: u16) -> Result<bool, AllocError> {
        // Appending in order is the common case
        let can_append = match self.max() {
            Some(max) => max < value,
            None => true
        };

        if can_append && !self.is_full() {
            self.array.push(value)?;
            return Ok(true);
        }

        match self.array.binary_search(&value) {
            Ok(_present) => Ok(true),
            Err(index) => {
                if self.is_full() {
                    return Ok(false);
                }

                self.array.insert(index, value)?;

                Ok(true)
            }
        }
    }

    /// Check if the array contains a specified value
    #[inline]
    pub fn contains(&self, value: u16) -> bool {
        self.array.binary_search(&value).is_ok()
    }

    /// Get the minimum value in the array
    #[inline]
    pub fn min(&self) -> Option<u16> {
        self.array.first().copied()
    }

    /// Get the maximum value in the array
    #[inline]
    pub fn max(&self) -> Option<u16> {
        self.array.last().copied()
    }

    /// Get an iterator over the elements of the array
    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, u16> {
        self.array.iter()
    }

    /// Copy the array into storage from `memory`
    pub fn try_clone_in(&self, memory: Memory) -> Result<Self, AllocError> {
        Ok(Self {
            array: self.array.try_clone_in(memory)?
        })
    }

    /// Number of bytes allocated for the values
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.array.capacity() * mem::size_of::<u16>()
    }
}

impl ArrayContainer {
    /// Get the size in bytes of a container with `cardinality`
    #[inline]
    pub fn serialized_size(cardinality: usize) -> usize {
        cardinality * mem::size_of::<u16>()
    }

    /// Write the values as little endian 16 bit integers
    pub fn serialize<W: Write>(&self, buf: &mut W) -> io::Result<usize> {
        write_values(self.iter().copied(), buf)
    }

    /// Read `cardinality` values from `bytes`
    pub(crate) fn deserialize_in(bytes: &[u8], cardinality: usize, memory: Memory) -> Result<Self, ContainerError> {
        let len = Self::serialized_size(cardinality);
        if bytes.len() < len {
            return Err(ContainerError::Invalid("array payload is truncated"));
        }

        let mut array = MemVec::<u16>::zeroed_in(cardinality, memory)?;
        LittleEndian::read_u16_into(&bytes[..len], &mut array);

        if array.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ContainerError::Invalid("array values are not strictly increasing"));
        }

        Ok(Self {
            array
        })
    }
}

/// Write a sequence of values in the array payload format
pub(crate) fn write_values<I, W>(values: I, buf: &mut W) -> io::Result<usize>
    where I: Iterator<Item=u16>,
          W: Write
{
    let mut bytes_written = 0;
    for value in values {
        buf.write_u16::<LittleEndian>(value)?;
        bytes_written += mem::size_of::<u16>();
    }

    Ok(bytes_written)
}

impl Deref for ArrayContainer {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        &self.array
    }
}
