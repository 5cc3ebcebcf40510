//! The container directory at the core of a roaring bitmap.
//!
//! A [`RoaringArray`] maps the high 16 bits of every value (the key) to the container
//! holding the low 16 bits. Keys are kept strictly increasing, and every lookup relies on it.
//!
//! Containers can be shared between directories. A copy made with `copy_on_write` marks the
//! slot as shared in both directories and defers the physical copy until one of them asks
//! for mutable access through [`RoaringArray::unshare_container_at_index`].

mod serialize;
mod statistics;

use std::mem;

use tracing::{debug, trace};

use crate::container::{Container, ContainerRef, Typecode};
use crate::error::Error;
use crate::memory::{Memory, MemVec};

pub use self::serialize::{NO_OFFSET_THRESHOLD, SERIAL_COOKIE, SERIAL_COOKIE_NO_RUNCONTAINER};
pub use self::statistics::RoaringStatistics;

/// The number of distinct keys, and so the most containers a directory can hold
pub const MAX_CONTAINERS: usize = 1 << 16;

/// Directories below this many containers double their capacity when they grow.
/// Larger ones grow by a quarter.
pub const GROWTH_THRESHOLD: usize = 1024;

/// A sorted directory of 16 bit keys and the containers they own or share
#[derive(Debug)]
pub struct RoaringArray {
    /// Strictly increasing keys
    keys: MemVec<u16>,

    /// Containers, index for index with `keys`
    containers: MemVec<ContainerRef>,

    /// Where new containers and the directory arrays are allocated
    memory: Memory
}

impl RoaringArray {
    /// Create an empty directory using the global memory hook. Does not allocate
    pub fn new() -> Self {
        Self::new_in(Memory::global())
    }

    /// Create an empty directory allocating from `memory`. Does not allocate
    pub fn new_in(memory: Memory) -> Self {
        Self {
            keys: MemVec::new_in(memory.clone()),
            containers: MemVec::new_in(memory.clone()),
            memory
        }
    }

    /// Create an empty directory with room for `capacity` containers
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        Self::with_capacity_in(capacity, Memory::global())
    }

    /// Create an empty directory with room for `capacity` containers, allocating from `memory`
    pub fn with_capacity_in(capacity: usize, memory: Memory) -> Result<Self, Error> {
        if capacity > MAX_CONTAINERS {
            return Err(Error::TooManyContainers { requested: capacity });
        }

        let mut array = Self::new_in(memory);
        array.keys.reserve_exact(capacity)?;
        array.containers.reserve_exact(capacity)?;

        Ok(array)
    }

    /// Copy `source` into a new directory using the same memory.
    ///
    /// With `copy_on_write` the containers are shared instead of copied, and the slots of
    /// both directories are marked shared. Otherwise each container is deep copied.
    pub fn copy(source: &mut Self, copy_on_write: bool) -> Result<Self, Error> {
        let len = source.len();

        let mut dest = Self::with_capacity_in(len, source.memory.clone())?;
        dest.append_copy_range(source, 0, len, copy_on_write)?;

        Ok(dest)
    }

    /// Replace the contents of `self` with a copy of `source`.
    /// `self` keeps its previous contents if the copy fails.
    pub fn overwrite(&mut self, source: &mut Self, copy_on_write: bool) -> Result<(), Error> {
        let len = source.len();

        let mut copy = Self::with_capacity_in(len, self.memory.clone())?;
        copy.append_copy_range(source, 0, len, copy_on_write)?;

        *self = copy;

        Ok(())
    }

    /// Deep copy the directory. Shared containers are copied too
    pub fn try_clone(&self) -> Result<Self, Error> {
        let mut copy = Self::with_capacity_in(self.len(), self.memory.clone())?;
        for (key, container) in self.keys.iter().zip(self.containers.iter()) {
            copy.keys.push(*key)?;
            copy.containers.push(container.try_clone_in(self.memory.clone())?)?;
        }

        Ok(copy)
    }

    /// The memory new containers are allocated from
    #[inline]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// The number of containers
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The number of containers that fit without growing
    #[inline]
    pub fn capacity(&self) -> usize {
        self.keys.capacity().min(self.containers.capacity())
    }

    /// The keys in increasing order
    #[inline]
    pub fn keys(&self) -> &[u16] {
        &self.keys
    }

    /// Total number of values across all containers
    pub fn cardinality(&self) -> usize {
        self.containers.iter()
            .map(|c| c.cardinality())
            .sum()
    }

    /// Get an iterator over `(key, container)` pairs in key order
    pub fn iter(&self) -> impl Iterator<Item=(u16, &Container)> + '_ {
        self.keys.iter()
            .copied()
            .zip(self.containers.iter().map(|c| &**c))
    }

    /// Drop every container and release the directory storage
    pub fn clear(&mut self) {
        self.keys = MemVec::new_in(self.memory.clone());
        self.containers = MemVec::new_in(self.memory.clone());
    }

    /// Drop every container, keeping the capacity
    pub fn clear_containers(&mut self) {
        self.keys.clear();
        self.containers.clear();
    }

    /// Empty the directory and hand its containers to the caller instead of dropping them
    pub fn clear_without_containers(&mut self) -> Vec<(u16, ContainerRef)> {
        let keys = mem::replace(&mut self.keys, MemVec::new_in(self.memory.clone()));
        let mut containers = mem::replace(&mut self.containers, MemVec::new_in(self.memory.clone()));

        let mut entries = Vec::with_capacity(keys.len());
        while let Some(container) = containers.pop() {
            entries.push((keys[containers.len()], container));
        }

        entries.reverse();
        entries
    }

    /// Reduce the capacity to the number of containers
    ///
    /// # Returns
    /// The number of bytes released
    pub fn shrink_to_fit(&mut self) -> Result<usize, Error> {
        let before = self.allocated_bytes();

        self.keys.shrink_to_fit()?;
        self.containers.shrink_to_fit()?;

        Ok(before - self.allocated_bytes())
    }

    fn allocated_bytes(&self) -> usize {
        self.keys.capacity() * mem::size_of::<u16>()
            + self.containers.capacity() * mem::size_of::<ContainerRef>()
    }
}

// Lookup

impl RoaringArray {
    /// Find the index for a given key
    ///
    /// # Returns
    /// `Ok(index)` if the key is present, otherwise `Err(index)` where the key would be inserted
    #[inline]
    pub fn get_index(&self, key: u16) -> Result<usize, usize> {
        // Bitmaps are mostly built in increasing order, check the last key first
        match self.keys.last() {
            None => Err(0),
            Some(last) if *last == key => Ok(self.keys.len() - 1),
            Some(last) if *last < key => Err(self.keys.len()),
            Some(_) => self.keys.binary_search(&key)
        }
    }

    /// Find the first index at or after `from` whose key is at least `key`, galloping
    /// forward before a binary search.
    ///
    /// # Returns
    /// The index found, or `len()` if every remaining key is smaller
    pub fn advance_until(&self, key: u16, from: usize) -> usize {
        let keys = &self.keys[..];
        let len = keys.len();

        if from >= len || keys[from] >= key {
            return from.min(len);
        }

        let mut span = 1;
        while from + span < len && keys[from + span] < key {
            span *= 2;
        }

        let upper = (from + span).min(len - 1);
        if keys[upper] < key {
            return len;
        }

        let lower = from + span / 2;

        lower + keys[lower..upper].partition_point(|k| *k < key)
    }

    /// Like `advance_until`, but drops the containers in `[from, found)` and removes
    /// their slots.
    ///
    /// # Returns
    /// `from`, which now holds the first remaining key at least `key`
    pub fn advance_until_freeing(&mut self, key: u16, from: usize) -> usize {
        let found = self.advance_until(key, from);
        if found > from {
            self.keys.remove_range(from, found);
            self.containers.remove_range(from, found);
        }

        from.min(self.len())
    }

    /// Get the key at `index`
    ///
    /// # Panics
    /// If `index` is out of bounds
    #[inline]
    pub fn key_at_index(&self, index: usize) -> u16 {
        self.keys[index]
    }

    /// Get the container at `index` for reading. Shared containers are not promoted
    ///
    /// # Panics
    /// If `index` is out of bounds
    #[inline]
    pub fn container_at_index(&self, index: usize) -> &Container {
        &self.containers[index]
    }

    /// Get the container at `index` for writing, promoting it first if it is shared
    ///
    /// # Panics
    /// If `index` is out of bounds
    #[inline]
    pub fn container_at_index_mut(&mut self, index: usize) -> Result<&mut Container, Error> {
        self.unshare_container_at_index(index)
    }

    /// Get the typecode of the slot at `index`
    ///
    /// # Panics
    /// If `index` is out of bounds
    #[inline]
    pub fn typecode_at_index(&self, index: usize) -> Typecode {
        self.containers[index].typecode()
    }
}

// Mutation

impl RoaringArray {
    /// Grow the capacity so at least `additional` more containers fit
    pub fn extend_array(&mut self, additional: usize) -> Result<(), Error> {
        let desired = self.len().saturating_add(additional);
        if desired > MAX_CONTAINERS {
            return Err(Error::TooManyContainers { requested: desired });
        }

        if desired <= self.capacity() {
            return Ok(());
        }

        let capacity = if self.len() < GROWTH_THRESHOLD {
            desired * 2
        }
        else {
            desired * 5 / 4
        };
        let capacity = capacity.min(MAX_CONTAINERS);

        trace!(from = self.capacity(), to = capacity, "growing directory");

        self.keys.reserve_exact(capacity - self.keys.len())?;
        self.containers.reserve_exact(capacity - self.containers.len())?;

        Ok(())
    }

    /// Insert a new slot at `index`, shifting the following slots right
    ///
    /// # Remarks
    /// `key` must sort between the neighbouring keys
    pub fn insert_new_key_value_at<C>(&mut self, index: usize, key: u16, container: C) -> Result<(), Error>
        where C: Into<ContainerRef>
    {
        debug_assert!(index == 0 || self.keys[index - 1] < key);
        debug_assert!(index == self.len() || key < self.keys[index]);

        self.extend_array(1)?;

        self.keys.insert(index, key)?;
        self.containers.insert(index, container.into())?;

        Ok(())
    }

    /// Append a new slot
    ///
    /// # Remarks
    /// `key` must be greater than every key in the directory
    pub fn append<C>(&mut self, key: u16, container: C) -> Result<(), Error>
        where C: Into<ContainerRef>
    {
        debug_assert!(self.keys.last().map_or(true, |last| *last < key));

        self.extend_array(1)?;

        self.keys.push(key)?;
        self.containers.push(container.into())?;

        Ok(())
    }

    /// Append a copy of `source`'s slot at `index`
    pub fn append_copy(&mut self, source: &mut Self, index: usize, copy_on_write: bool) -> Result<(), Error> {
        self.extend_array(1)?;
        self.push_copy(source, index, copy_on_write)
    }

    /// Append copies of `source`'s slots in `[start, end)`.
    /// If a deep copy fails, the slots appended so far are dropped again
    pub fn append_copy_range(&mut self, source: &mut Self, start: usize, end: usize, copy_on_write: bool) -> Result<(), Error> {
        assert!(start <= end && end <= source.len(), "range {}..{} out of bounds for length {}", start, end, source.len());

        self.extend_array(end - start)?;

        let len = self.len();
        for index in start..end {
            if let Err(error) = self.push_copy(source, index, copy_on_write) {
                self.downsize(len);
                return Err(error);
            }
        }

        Ok(())
    }

    /// Append copies of every slot of `source` whose key is less than `stopping_key`
    pub fn append_copies_until(&mut self, source: &mut Self, stopping_key: u16, copy_on_write: bool) -> Result<(), Error> {
        let end = source.keys.partition_point(|key| *key < stopping_key);

        self.append_copy_range(source, 0, end, copy_on_write)
    }

    /// Append copies of every slot of `source` whose key is greater than `before_start`
    pub fn append_copies_after(&mut self, source: &mut Self, before_start: u16, copy_on_write: bool) -> Result<(), Error> {
        let start = match source.get_index(before_start) {
            Ok(index) => index + 1,
            Err(index) => index
        };
        let end = source.len();

        self.append_copy_range(source, start, end, copy_on_write)
    }

    fn push_copy(&mut self, source: &mut Self, index: usize, copy_on_write: bool) -> Result<(), Error> {
        debug_assert!(self.keys.last().map_or(true, |last| *last < source.keys[index]));

        let container = if copy_on_write {
            source.containers[index].share()
        }
        else {
            source.containers[index].try_clone_in(self.memory.clone())?
        };

        self.keys.push(source.keys[index])?;
        self.containers.push(container)?;

        Ok(())
    }

    /// Move the slots `[start, end)` of `source` onto the end of `self` without copying
    /// their containers. The slots are removed from `source`.
    pub fn append_move_range(&mut self, source: &mut Self, start: usize, end: usize) -> Result<(), Error> {
        assert!(start <= end && end <= source.len(), "range {}..{} out of bounds for length {}", start, end, source.len());
        debug_assert!(start == end || self.keys.last().map_or(true, |last| *last < source.keys[start]));

        // Both arrays have room afterwards, so the moves below cannot fail half way
        self.extend_array(end - start)?;

        source.keys.move_range_to(start, end, &mut self.keys)?;
        source.containers.move_range_to(start, end, &mut self.containers)?;

        Ok(())
    }

    /// Replace the container at `index`
    ///
    /// # Returns
    /// The displaced container
    pub fn set_container_at_index<C>(&mut self, index: usize, container: C) -> ContainerRef
        where C: Into<ContainerRef>
    {
        mem::replace(&mut self.containers[index], container.into())
    }

    /// Replace both the key and the container at `index`
    ///
    /// # Returns
    /// The displaced container
    pub fn replace_key_and_container_at_index<C>(&mut self, index: usize, key: u16, container: C) -> ContainerRef
        where C: Into<ContainerRef>
    {
        debug_assert!(index == 0 || self.keys[index - 1] < key);
        debug_assert!(index + 1 >= self.len() || key < self.keys[index + 1]);

        self.keys[index] = key;

        mem::replace(&mut self.containers[index], container.into())
    }

    /// Remove the slot at `index`, shifting the following slots left
    ///
    /// # Returns
    /// The removed container
    pub fn remove_at_index(&mut self, index: usize) -> ContainerRef {
        self.keys.remove(index);
        self.containers.remove(index)
    }

    /// Remove the slot at `index` and drop its container
    pub fn remove_at_index_and_free(&mut self, index: usize) {
        drop(self.remove_at_index(index));
    }

    /// Move the slots `[begin, end)` so they start at `new_begin`.
    ///
    /// The containers previously held by the overwritten slots are not dropped. They end up
    /// in the slots vacated by the move, so compacting with a `new_begin` before `begin`
    /// followed by [`downsize`](Self::downsize) releases them.
    ///
    /// # Panics
    /// If either range is out of bounds
    pub fn copy_range(&mut self, begin: usize, end: usize, new_begin: usize) {
        assert!(begin <= end && end <= self.len(), "range {}..{} out of bounds for length {}", begin, end, self.len());

        let count = end - begin;
        assert!(new_begin + count <= self.len(), "destination {} out of bounds for length {}", new_begin, self.len());

        self.keys.copy_within(begin..end, new_begin);

        if new_begin < begin {
            self.containers[new_begin..end].rotate_left(begin - new_begin);
        }
        else if new_begin > begin {
            self.containers[begin..new_begin + count].rotate_right(new_begin - begin);
        }
    }

    /// Shrink the directory to `new_len` slots, dropping the containers past it
    ///
    /// # Panics
    /// If `new_len` is greater than the length
    pub fn downsize(&mut self, new_len: usize) {
        assert!(new_len <= self.len(), "cannot downsize from {} to {}", self.len(), new_len);

        self.keys.truncate(new_len);
        self.containers.truncate(new_len);
    }

    /// Make the container at `index` exclusive to this directory, copying it if another
    /// directory still shares it. Must precede any in place mutation of the container.
    ///
    /// # Panics
    /// If `index` is out of bounds
    pub fn unshare_container_at_index(&mut self, index: usize) -> Result<&mut Container, Error> {
        let slot = &mut self.containers[index];
        if slot.is_shared() {
            debug!(key = self.keys[index], "promoting shared container");
        }

        Ok(slot.make_exclusive(&self.memory)?)
    }
}

// Conversion

impl RoaringArray {
    /// Write every value, `key << 16 | low`, in increasing order
    ///
    /// # Returns
    /// The number of values written, the cardinality
    ///
    /// # Panics
    /// If `out` is shorter than the cardinality
    pub fn to_uint32_array(&self, out: &mut [u32]) -> usize {
        let cardinality = self.cardinality();
        assert!(out.len() >= cardinality, "output holds {} values, need {}", out.len(), cardinality);

        let mut index = 0;
        for (key, container) in self.iter() {
            let high = u32::from(key) << 16;
            for low in container.iter() {
                out[index] = high | u32::from(low);
                index += 1;
            }
        }

        index
    }

    /// Collect every value in increasing order
    pub fn to_vec(&self) -> Vec<u32> {
        let mut values = vec![0; self.cardinality()];
        self.to_uint32_array(&mut values);

        values
    }
}

impl Default for RoaringArray {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::{Arena, MAX_ALIGN};
    use crate::test::*;

    #[test]
    fn get_index_fast_paths() {
        let mut ra = RoaringArray::new_in(Memory::system());
        assert_eq!(ra.get_index(7), Err(0));

        for key in [2u16, 4, 8] {
            ra.append(key, array_of(&[1])).unwrap();
        }

        assert_eq!(ra.get_index(8), Ok(2));
        assert_eq!(ra.get_index(9), Err(3));
        assert_eq!(ra.get_index(4), Ok(1));
        assert_eq!(ra.get_index(3), Err(1));
        assert_eq!(ra.get_index(0), Err(0));
    }

    #[test]
    fn insert_keeps_order() {
        let mut ra = RoaringArray::new_in(Memory::system());
        for key in [50u16, 10, 30, 20, 40, 0, 65535] {
            let index = ra.get_index(key).unwrap_err();
            ra.insert_new_key_value_at(index, key, array_of(&[key])).unwrap();
        }

        assert_eq!(ra.keys(), &[0, 10, 20, 30, 40, 50, 65535]);
        for (key, container) in ra.iter() {
            assert!(container.contains(key));
        }
    }

    #[test]
    fn advance_until() {
        let ra = directory_with_keys(&[1, 3, 5, 7, 9, 11, 13, 15, 17]);

        assert_eq!(ra.advance_until(0, 0), 0);
        assert_eq!(ra.advance_until(6, 0), 3);
        assert_eq!(ra.advance_until(7, 0), 3);
        assert_eq!(ra.advance_until(7, 5), 5);
        assert_eq!(ra.advance_until(16, 2), 8);
        assert_eq!(ra.advance_until(17, 8), 8);
        assert_eq!(ra.advance_until(18, 0), 9);
        assert_eq!(ra.advance_until(2, 20), 9);

        for key in 0..20u16 {
            let expected = ra.keys().partition_point(|k| *k < key);
            assert_eq!(ra.advance_until(key, 0), expected, "key {}", key);
        }
    }

    #[test]
    fn advance_until_freeing() {
        let mut ra = directory_with_keys(&[1, 3, 5, 7, 9]);

        assert_eq!(ra.advance_until_freeing(6, 1), 1);
        assert_eq!(ra.keys(), &[1, 7, 9]);

        assert_eq!(ra.advance_until_freeing(100, 0), 0);
        assert!(ra.is_empty());
    }

    #[test]
    fn growth_policy() {
        let mut ra = RoaringArray::new_in(Memory::system());

        ra.extend_array(1).unwrap();
        assert_eq!(ra.capacity(), 2);

        ra.extend_array(10).unwrap();
        assert_eq!(ra.capacity(), 20);

        let mut ra = directory_with_keys(&(0..GROWTH_THRESHOLD as u16).collect::<Vec<_>>());
        ra.shrink_to_fit().unwrap();
        ra.extend_array(4).unwrap();
        assert_eq!(ra.capacity(), (GROWTH_THRESHOLD + 4) * 5 / 4);

        assert_eq!(
            ra.extend_array(MAX_CONTAINERS),
            Err(Error::TooManyContainers { requested: MAX_CONTAINERS + GROWTH_THRESHOLD })
        );
        assert!(RoaringArray::with_capacity_in(MAX_CONTAINERS + 1, Memory::system()).is_err());
    }

    #[test]
    fn copy_deep_and_shared() {
        let mut a = directory_with_keys(&[1, 2, 3]);

        let deep = RoaringArray::copy(&mut a, false).unwrap();
        assert!((0..3).all(|i| a.typecode_at_index(i) == Typecode::Array));
        assert!((0..3).all(|i| deep.typecode_at_index(i) == Typecode::Array));

        let mut shared = RoaringArray::copy(&mut a, true).unwrap();
        assert!((0..3).all(|i| a.typecode_at_index(i) == Typecode::Shared));
        assert!((0..3).all(|i| shared.typecode_at_index(i) == Typecode::Shared));

        shared.unshare_container_at_index(1).unwrap().add(1000).unwrap();

        assert_eq!(shared.typecode_at_index(1), Typecode::Array);
        assert_eq!(shared.container_at_index(1).cardinality(), 2);
        assert_eq!(a.container_at_index(1).cardinality(), 1);
        assert_eq!(deep.container_at_index(1).cardinality(), 1);
    }

    #[test]
    fn overwrite_replaces_contents() {
        let mut source = directory_with_keys(&[4, 5]);
        let mut dest = directory_with_keys(&[1, 2, 3]);

        dest.overwrite(&mut source, false).unwrap();

        assert_eq!(dest.keys(), &[4, 5]);
        assert_eq!(dest.to_vec(), source.to_vec());
    }

    #[test]
    fn append_copies_by_key() {
        let mut source = directory_with_keys(&[1, 3, 5, 7, 9]);

        let mut ra = RoaringArray::new_in(Memory::system());
        ra.append_copies_until(&mut source, 5, false).unwrap();
        assert_eq!(ra.keys(), &[1, 3]);

        ra.append_copies_after(&mut source, 5, true).unwrap();
        assert_eq!(ra.keys(), &[1, 3, 7, 9]);
        assert_eq!(ra.typecode_at_index(2), Typecode::Shared);
        assert_eq!(source.typecode_at_index(3), Typecode::Shared);
        assert_eq!(source.typecode_at_index(2), Typecode::Array);

        let mut ra = RoaringArray::new_in(Memory::system());
        ra.append_copies_after(&mut source, 4, false).unwrap();
        assert_eq!(ra.keys(), &[5, 7, 9]);
    }

    #[test]
    fn append_move_range() {
        let mut source = directory_with_keys(&[1, 2, 3, 4, 5]);
        let mut dest = directory_with_keys(&[0]);

        dest.append_move_range(&mut source, 1, 4).unwrap();

        assert_eq!(dest.keys(), &[0, 2, 3, 4]);
        assert_eq!(source.keys(), &[1, 5]);
        assert_eq!(dest.to_vec(), vec![0, 2 << 16 | 2, 3 << 16 | 3, 4 << 16 | 4]);
    }

    #[test]
    fn set_and_replace_return_displaced() {
        let mut ra = directory_with_keys(&[1, 2, 3]);

        let old = ra.set_container_at_index(1, array_of(&[7, 8]));
        assert_eq!(old.cardinality(), 1);
        assert_eq!(ra.container_at_index(1).cardinality(), 2);

        let old = ra.replace_key_and_container_at_index(2, 10, array_of(&[9]));
        assert!(old.contains(3));
        assert_eq!(ra.keys(), &[1, 2, 10]);
    }

    /// A directory with room for two slots, over an arena with no space to spare
    fn cramped_directory() -> RoaringArray {
        let capacity = Arena::footprint(2 * mem::size_of::<u16>(), MAX_ALIGN)
            + Arena::footprint(2 * mem::size_of::<ContainerRef>(), MAX_ALIGN);
        let memory = Arena::new(capacity).unwrap().into_memory();

        RoaringArray::with_capacity_in(2, memory).unwrap()
    }

    #[test]
    fn failed_growth_keeps_directory() {
        let mut ra = cramped_directory();
        ra.append(2, array_of(&[1])).unwrap();
        ra.append(4, array_of(&[1])).unwrap();

        assert!(matches!(ra.append(6, array_of(&[1])), Err(Error::Alloc(_))));
        assert!(matches!(ra.insert_new_key_value_at(0, 0, array_of(&[1])), Err(Error::Alloc(_))));

        assert_eq!(ra.len(), 2);
        assert_eq!(ra.keys(), &[2, 4]);
        assert!(ra.iter().all(|(_, container)| container.contains(1)));
    }

    #[test]
    fn failed_deep_copy_keeps_directory() {
        let values: Vec<u16> = (0..100).collect();
        let mut source = RoaringArray::new_in(Memory::system());
        source.append(1, array_of(&[1])).unwrap();
        source.append(2, array_of(&values)).unwrap();

        let mut ra = cramped_directory();
        let result = ra.append_copy_range(&mut source, 0, 2, false);

        assert!(matches!(result, Err(Error::Alloc(_))));
        assert!(ra.is_empty());
        assert_eq!(source.keys(), &[1, 2]);
        assert_eq!(source.typecode_at_index(1), Typecode::Array);
    }

    #[test]
    fn failed_unshare_stays_shared() {
        let values: Vec<u16> = (0..100).collect();
        let mut source = RoaringArray::new_in(Memory::system());
        source.append(1, array_of(&values)).unwrap();

        let mut ra = cramped_directory();
        ra.append_copy(&mut source, 0, true).unwrap();

        assert!(matches!(ra.unshare_container_at_index(0), Err(Error::Alloc(_))));
        assert_eq!(ra.typecode_at_index(0), Typecode::Shared);
        assert_eq!(ra.container_at_index(0).cardinality(), 100);
        assert_eq!(source.typecode_at_index(0), Typecode::Shared);
    }

    #[test]
    fn remove_and_compact() {
        let keys: Vec<u16> = (0..20).map(|k| k * 3).collect();
        let mut ra = directory_with_keys(&keys);
        let shared = RoaringArray::copy(&mut ra, true).unwrap();

        ra.remove_at_index_and_free(0);

        // Close the gap over slots 4..8
        let len = ra.len();
        ra.copy_range(8, len, 4);
        ra.downsize(len - 4);

        let kept: Vec<usize> = (1..5).chain(9..20).collect();
        let expected: Vec<u16> = kept.iter().map(|i| keys[*i]).collect();
        assert_eq!(ra.keys(), &expected[..]);
        assert!(ra.iter().all(|(key, container)| container.contains(key)));

        // Removed and compacted-away containers are only reachable from `shared`
        for (index, slot) in shared.containers.iter().enumerate() {
            let ContainerRef::Shared(arc) = slot else {
                panic!("container should still be shared");
            };

            let owners = if kept.contains(&index) { 2 } else { 1 };
            assert_eq!(std::sync::Arc::strong_count(arc), owners, "slot {}", index);
        }
    }

    #[test]
    fn copy_range_then_downsize() {
        let mut ra = directory_with_keys(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let shared = RoaringArray::copy(&mut ra, true).unwrap();

        ra.copy_range(6, 10, 2);
        ra.downsize(6);

        assert_eq!(ra.keys(), &[0, 1, 6, 7, 8, 9]);
        assert!(ra.iter().all(|(key, container)| container.contains(key)));

        // The displaced containers were dropped by the downsize, leaving `shared` the only owner
        assert_eq!(shared.len(), 10);
        let ContainerRef::Shared(arc) = &shared.containers[3] else {
            panic!("container should still be shared");
        };
        assert_eq!(std::sync::Arc::strong_count(arc), 1);
    }

    #[test]
    fn clear_variants() {
        let mut ra = directory_with_keys(&[1, 2, 3]);
        let capacity = ra.capacity();

        ra.clear_containers();
        assert!(ra.is_empty());
        assert_eq!(ra.capacity(), capacity);

        let mut ra = directory_with_keys(&[1, 2, 3]);
        let entries = ra.clear_without_containers();
        assert!(ra.is_empty());
        assert_eq!(ra.capacity(), 0);
        assert_eq!(entries.iter().map(|(key, _)| *key).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(entries.iter().all(|(key, container)| container.contains(*key)));

        let mut ra = directory_with_keys(&[1, 2, 3]);
        ra.clear();
        assert_eq!(ra.capacity(), 0);
    }

    #[test]
    fn to_uint32_array() {
        let mut ra = RoaringArray::new_in(Memory::system());
        ra.append(0, array_of(&[1, 5])).unwrap();
        ra.append(1, Container::from_range_in(0..3, Memory::system()).unwrap()).unwrap();

        let mut out = [0u32; 8];
        assert_eq!(ra.to_uint32_array(&mut out), 5);
        assert_eq!(&out[..5], &[1, 5, 65536, 65537, 65538]);
    }

    #[test]
    fn try_clone_unshares() {
        let mut a = directory_with_keys(&[1, 2]);
        let _b = RoaringArray::copy(&mut a, true).unwrap();

        let c = a.try_clone().unwrap();
        assert_eq!(c.typecode_at_index(0), Typecode::Array);
        assert_eq!(c.to_vec(), a.to_vec());
    }
}
