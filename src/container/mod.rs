//! The container variants stored by the directory.
//!
//! The directory only needs a handful of capabilities from a container: its cardinality,
//! a deep copy, its values and its serialized form. Set algebra between containers lives
//! elsewhere.

mod array;
mod bitset;
mod run;

use std::io::{self, Write};
use std::mem;
use std::ops::{Deref, Range};
use std::slice;
use std::sync::Arc;

use crate::error::AllocError;
use crate::memory::Memory;

pub use self::array::ArrayContainer;
pub use self::bitset::{BitsetContainer, BITSET_SIZE_IN_WORDS};
pub(crate) use self::bitset::BITSET_ALIGNMENT;
pub use self::run::{Rle16, RunContainer};

/// Default maximum size of an array container before it is converted to another type
pub const DEFAULT_MAX_SIZE: usize = 4096;

/// Tag identifying the variant held by a directory slot, and whether it is shared
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Typecode {
    Bitset = 1,
    Array = 2,
    Run = 3,
    Shared = 4
}

/// Failure while decoding a single container payload
#[derive(Debug)]
pub(crate) enum ContainerError {
    Alloc(AllocError),
    Invalid(&'static str)
}

impl From<AllocError> for ContainerError {
    fn from(error: AllocError) -> Self {
        ContainerError::Alloc(error)
    }
}

/// Enum representing a container of any type
#[derive(Debug)]
pub enum Container {
    /// Array container
    Array(ArrayContainer),

    /// Bitset container
    Bitset(BitsetContainer),

    /// Run container
    Run(RunContainer)
}

impl Container {
    /// Create an empty array container. Does not allocate
    pub fn empty_in(memory: Memory) -> Self {
        Container::Array(ArrayContainer::new_in(memory))
    }

    /// Create a container holding `values`, which must be sorted and unique.
    /// Small sets become arrays, larger ones bitsets.
    pub fn from_values_in(values: &[u16], memory: Memory) -> Result<Self, AllocError> {
        debug_assert!(values.windows(2).all(|w| w[0] < w[1]));

        if values.len() <= DEFAULT_MAX_SIZE {
            let array = ArrayContainer::from_sorted_in(values, memory)?;

            Ok(Container::Array(array))
        }
        else {
            let mut bitset = BitsetContainer::new_in(memory)?;
            for value in values {
                bitset.add(*value);
            }

            Ok(Container::Bitset(bitset))
        }
    }

    /// Create a run container with all values in the specified range
    pub fn from_range_in(range: Range<u32>, memory: Memory) -> Result<Self, AllocError> {
        Ok(Container::Run(RunContainer::from_range_in(range, memory)?))
    }

    /// The tag of the variant
    #[inline]
    pub fn typecode(&self) -> Typecode {
        match self {
            Container::Array(_) => Typecode::Array,
            Container::Bitset(_) => Typecode::Bitset,
            Container::Run(_) => Typecode::Run
        }
    }

    /// The memory the payload is allocated from
    pub fn memory(&self) -> &Memory {
        match self {
            Container::Array(c) => c.memory(),
            Container::Bitset(c) => c.memory(),
            Container::Run(c) => c.memory()
        }
    }

    /// Get the cardinality of the container
    pub fn cardinality(&self) -> usize {
        match self {
            Container::Array(c) => c.cardinality(),
            Container::Bitset(c) => c.cardinality(),
            Container::Run(c) => c.cardinality()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cardinality() == 0
    }

    #[inline]
    pub fn is_run(&self) -> bool {
        matches!(self, Container::Run(_))
    }

    /// Check if the container holds `value`
    pub fn contains(&self, value: u16) -> bool {
        match self {
            Container::Array(c) => c.contains(value),
            Container::Bitset(c) => c.contains(value),
            Container::Run(c) => c.contains(value)
        }
    }

    /// Add a value to the underlying container, turning a full array into a bitset
    ///
    /// # Returns
    /// `true` if the value was not present before
    pub fn add(&mut self, value: u16) -> Result<bool, AllocError> {
        match self {
            Container::Array(c) => {
                if c.contains(value) {
                    return Ok(false);
                }

                if c.add(value)? {
                    return Ok(true);
                }

                let mut bitset = BitsetContainer::from_array_in(c, c.memory().clone())?;
                bitset.add(value);

                *self = Container::Bitset(bitset);

                Ok(true)
            },
            Container::Bitset(c) => Ok(c.add(value)),
            Container::Run(c) => c.add(value)
        }
    }

    /// Get the minimum value in the container
    pub fn min(&self) -> Option<u16> {
        match self {
            Container::Array(c) => c.min(),
            Container::Bitset(c) => c.min(),
            Container::Run(c) => c.min()
        }
    }

    /// Get the maximum value in the container
    pub fn max(&self) -> Option<u16> {
        match self {
            Container::Array(c) => c.max(),
            Container::Bitset(c) => c.max(),
            Container::Run(c) => c.max()
        }
    }

    /// Get an iterator over the low 16 bits of every value, in increasing order
    pub fn iter(&self) -> Iter<'_> {
        match self {
            Container::Array(c) => Iter::Array(c.iter()),
            Container::Bitset(c) => Iter::Bitset(c.iter()),
            Container::Run(c) => Iter::Run(c.iter())
        }
    }

    /// Copy the container into storage from `memory`
    pub fn try_clone_in(&self, memory: Memory) -> Result<Self, AllocError> {
        Ok(match self {
            Container::Array(c) => Container::Array(c.try_clone_in(memory)?),
            Container::Bitset(c) => Container::Bitset(c.try_clone_in(memory)?),
            Container::Run(c) => Container::Run(c.try_clone_in(memory)?)
        })
    }

    /// Number of bytes allocated for the payload
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Container::Array(c) => c.size_in_bytes(),
            Container::Bitset(c) => c.size_in_bytes(),
            Container::Run(c) => c.size_in_bytes()
        }
    }
}

// Serialization

impl Container {
    /// Size of the payload in the portable format.
    ///
    /// Readers infer array vs. bitset from the cardinality, so a bitset holding at most
    /// `DEFAULT_MAX_SIZE` values is written in array form.
    pub fn portable_size(&self) -> usize {
        match self {
            Container::Array(c) => ArrayContainer::serialized_size(c.cardinality()),
            Container::Bitset(c) if c.cardinality() <= DEFAULT_MAX_SIZE => {
                ArrayContainer::serialized_size(c.cardinality())
            },
            Container::Bitset(_) => BitsetContainer::serialized_size(),
            Container::Run(c) => RunContainer::serialized_size(c.num_runs())
        }
    }

    /// Write the payload in the portable format
    ///
    /// # Returns
    /// The number of bytes written, always `portable_size()`
    pub fn portable_serialize<W: Write>(&self, buf: &mut W) -> io::Result<usize> {
        match self {
            Container::Array(c) => c.serialize(buf),
            Container::Bitset(c) if c.cardinality() <= DEFAULT_MAX_SIZE => {
                array::write_values(c.iter(), buf)
            },
            Container::Bitset(c) => c.serialize(buf),
            Container::Run(c) => c.serialize(buf)
        }
    }
}

/// An iterator over the values of a container
pub enum Iter<'a> {
    Array(slice::Iter<'a, u16>),
    Bitset(bitset::Iter<'a>),
    Run(run::Iter<'a>)
}

impl<'a> Iterator for Iter<'a> {
    type Item = u16;

    #[inline]
    fn next(&mut self) -> Option<u16> {
        match self {
            Iter::Array(iter) => iter.next().copied(),
            Iter::Bitset(iter) => iter.next(),
            Iter::Run(iter) => iter.next()
        }
    }
}

/// A directory slot's handle on its container.
///
/// An `Owned` container belongs to exactly one directory. A `Shared` container may be
/// referenced by several directories and must not be mutated until it is promoted back to
/// `Owned` with [`ContainerRef::make_exclusive`].
#[derive(Debug)]
pub enum ContainerRef {
    Owned(Container),
    Shared(Arc<Container>)
}

impl ContainerRef {
    /// The slot's typecode. Shared containers report `Typecode::Shared`
    #[inline]
    pub fn typecode(&self) -> Typecode {
        match self {
            ContainerRef::Owned(c) => c.typecode(),
            ContainerRef::Shared(_) => Typecode::Shared
        }
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self, ContainerRef::Shared(_))
    }

    /// Mark this handle as shared and return a second handle to the same container
    pub fn share(&mut self) -> ContainerRef {
        if let ContainerRef::Owned(container) = self {
            let memory = container.memory().clone();
            let owned = mem::replace(container, Container::empty_in(memory));

            *self = ContainerRef::Shared(Arc::new(owned));
        }

        match self {
            ContainerRef::Shared(shared) => ContainerRef::Shared(Arc::clone(shared)),
            ContainerRef::Owned(_) => unreachable!("container was just shared")
        }
    }

    /// Produce an exclusive deep copy allocated from `memory`
    pub fn try_clone_in(&self, memory: Memory) -> Result<ContainerRef, AllocError> {
        Ok(ContainerRef::Owned(self.deref().try_clone_in(memory)?))
    }

    /// Promote a shared handle to an exclusive one, copying the container into `memory` if
    /// any other handle still refers to it. On failure the handle is left shared.
    pub fn make_exclusive(&mut self, memory: &Memory) -> Result<&mut Container, AllocError> {
        if self.is_shared() {
            let placeholder = ContainerRef::Owned(Container::empty_in(memory.clone()));

            if let ContainerRef::Shared(shared) = mem::replace(self, placeholder) {
                let owned = match Arc::try_unwrap(shared) {
                    Ok(container) => container,
                    Err(shared) => match shared.try_clone_in(memory.clone()) {
                        Ok(container) => container,
                        Err(error) => {
                            *self = ContainerRef::Shared(shared);
                            return Err(error);
                        }
                    }
                };

                *self = ContainerRef::Owned(owned);
            }
        }

        match self {
            ContainerRef::Owned(container) => Ok(container),
            ContainerRef::Shared(_) => unreachable!("shared container was just promoted")
        }
    }
}

impl Deref for ContainerRef {
    type Target = Container;

    #[inline]
    fn deref(&self) -> &Container {
        match self {
            ContainerRef::Owned(c) => c,
            ContainerRef::Shared(c) => c
        }
    }
}

impl From<Container> for ContainerRef {
    #[inline]
    fn from(container: Container) -> Self {
        ContainerRef::Owned(container)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn array_grows_into_bitset() {
        let mut container = Container::empty_in(Memory::system());
        for value in 0..=DEFAULT_MAX_SIZE as u16 {
            assert!(container.add(value * 3).unwrap());
        }

        assert_eq!(container.typecode(), Typecode::Bitset);
        assert_eq!(container.cardinality(), DEFAULT_MAX_SIZE + 1);
        assert!(!container.add(0).unwrap());
        assert!(container.iter().eq((0..=DEFAULT_MAX_SIZE as u16).map(|v| v * 3)));
    }

    #[test]
    fn from_values_picks_variant() {
        let small: Vec<u16> = (0..10).collect();
        let large: Vec<u16> = (0..5000).collect();

        let small = Container::from_values_in(&small, Memory::system()).unwrap();
        let large = Container::from_values_in(&large, Memory::system()).unwrap();

        assert_eq!(small.typecode(), Typecode::Array);
        assert_eq!(large.typecode(), Typecode::Bitset);
        assert_eq!(large.cardinality(), 5000);
    }

    #[test]
    fn sparse_bitset_serializes_as_array() {
        let mut bitset = BitsetContainer::new_in(Memory::system()).unwrap();
        bitset.set_range(5..21);
        let container = Container::Bitset(bitset);

        let mut bytes = Vec::new();
        let written = container.portable_serialize(&mut bytes).unwrap();

        assert_eq!(written, container.portable_size());
        assert_eq!(written, 32);
        assert_eq!(&bytes[..4], &[5, 0, 6, 0]);
    }

    #[test]
    fn share_and_promote() {
        let values = [1u16, 2, 3];
        let mut a = ContainerRef::from(Container::from_values_in(&values, Memory::system()).unwrap());
        let mut b = a.share();

        assert_eq!(a.typecode(), Typecode::Shared);
        assert_eq!(b.typecode(), Typecode::Shared);

        b.make_exclusive(&Memory::system()).unwrap().add(4).unwrap();

        assert_eq!(b.typecode(), Typecode::Array);
        assert_eq!(b.cardinality(), 4);
        assert_eq!(a.cardinality(), 3);

        // The last remaining handle takes the container back
        a.make_exclusive(&Memory::system()).unwrap();

        assert!(!a.is_shared());
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
