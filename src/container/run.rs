use std::io::{self, Write};
use std::mem;
use std::ops::Range;
use std::slice;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytemuck::Zeroable;

use crate::error::AllocError;
use crate::memory::{Memory, MemVec};
use crate::container::*;

/// A run of consecutive values `[value, value + length]`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rle16 {
    pub value: u16,
    pub length: u16
}

unsafe impl Zeroable for Rle16 {}

impl Rle16 {
    pub fn new(value: u16, length: u16) -> Self {
        Self {
            value,
            length
        }
    }

    /// The last value covered by the run
    #[inline]
    pub fn end(&self) -> u32 {
        self.value as u32 + self.length as u32
    }
}

/// A run container. Values are stored as a sorted list of non-overlapping runs
#[derive(Debug)]
pub struct RunContainer {
    runs: MemVec<Rle16>
}

impl RunContainer {
    /// Create a new run container. Does not allocate
    pub fn new_in(memory: Memory) -> Self {
        Self {
            runs: MemVec::new_in(memory)
        }
    }

    /// Create a run container holding every value in `range`
    pub fn from_range_in(range: Range<u32>, memory: Memory) -> Result<Self, AllocError> {
        debug_assert!(range.end <= 1 << 16);

        let mut container = Self::new_in(memory);
        if !range.is_empty() {
            let run = Rle16::new(range.start as u16, (range.end - range.start - 1) as u16);
            container.runs.push(run)?;
        }

        Ok(container)
    }

    /// The memory the runs are allocated from
    #[inline]
    pub fn memory(&self) -> &Memory {
        self.runs.memory()
    }

    /// Add a value, extending or fusing neighbouring runs where possible
    ///
    /// # Returns
    /// `true` if the value was not present before
    pub fn add(&mut self, value: u16) -> Result<bool, AllocError> {
        let v = value as u32;

        // Index of the first run starting after the value
        let index = self.runs.partition_point(|run| run.value as u32 <= v);

        if index > 0 {
            let prev = self.runs[index - 1];
            if v <= prev.end() {
                return Ok(false);
            }

            if v == prev.end() + 1 {
                self.runs[index - 1].length += 1;

                // Fuse with the next run if the gap is now closed
                if index < self.runs.len() && self.runs[index].value as u32 == v + 1 {
                    let next = self.runs.remove(index);
                    self.runs[index - 1].length += next.length + 1;
                }

                return Ok(true);
            }
        }

        if index < self.runs.len() && self.runs[index].value as u32 == v + 1 {
            let run = &mut self.runs[index];
            run.value -= 1;
            run.length += 1;

            return Ok(true);
        }

        self.runs.insert(index, Rle16::new(value, 0))?;

        Ok(true)
    }

    /// Check if the container contains a specified value
    pub fn contains(&self, value: u16) -> bool {
        let index = self.runs.partition_point(|run| run.value <= value);

        index > 0 && value as u32 <= self.runs[index - 1].end()
    }

    pub fn cardinality(&self) -> usize {
        self.runs.iter()
            .map(|run| run.length as usize + 1)
            .sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    #[inline]
    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    #[inline]
    pub fn runs(&self) -> &[Rle16] {
        &self.runs
    }

    pub fn min(&self) -> Option<u16> {
        self.runs.first()
            .map(|run| run.value)
    }

    pub fn max(&self) -> Option<u16> {
        self.runs.last()
            .map(|run| run.end() as u16)
    }

    /// Get an iterator over the values of the container
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            runs: self.runs.iter(),
            current: None
        }
    }

    /// Copy the runs into storage from `memory`
    pub fn try_clone_in(&self, memory: Memory) -> Result<Self, AllocError> {
        Ok(Self {
            runs: self.runs.try_clone_in(memory)?
        })
    }

    /// Number of bytes allocated for the runs
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.runs.capacity() * mem::size_of::<Rle16>()
    }
}

impl RunContainer {
    /// Get the size in bytes of a run container with `num_runs` runs
    #[inline]
    pub fn serialized_size(num_runs: usize) -> usize {
        mem::size_of::<u16>() + num_runs * 2 * mem::size_of::<u16>()
    }

    /// Write the run count followed by each `(value, length)` pair
    pub fn serialize<W: Write>(&self, buf: &mut W) -> io::Result<usize> {
        buf.write_u16::<LittleEndian>(self.runs.len() as u16)?;

        for run in self.runs.iter() {
            buf.write_u16::<LittleEndian>(run.value)?;
            buf.write_u16::<LittleEndian>(run.length)?;
        }

        Ok(Self::serialized_size(self.runs.len()))
    }

    /// Read the number of runs announced at the start of a payload
    pub(crate) fn peek_num_runs(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < mem::size_of::<u16>() {
            return None;
        }

        Some(LittleEndian::read_u16(bytes) as usize)
    }

    /// Read a run payload from `bytes`
    pub(crate) fn deserialize_in(bytes: &[u8], memory: Memory) -> Result<Self, ContainerError> {
        let num_runs = Self::peek_num_runs(bytes)
            .ok_or(ContainerError::Invalid("run payload is truncated"))?;

        if num_runs == 0 {
            return Err(ContainerError::Invalid("run container has no runs"));
        }

        if bytes.len() < Self::serialized_size(num_runs) {
            return Err(ContainerError::Invalid("run payload is truncated"));
        }

        let mut runs = MemVec::<Rle16>::zeroed_in(num_runs, memory)?;
        let mut previous_end: Option<u32> = None;

        for (i, chunk) in bytes[2..Self::serialized_size(num_runs)].chunks_exact(4).enumerate() {
            let run = Rle16::new(LittleEndian::read_u16(chunk), LittleEndian::read_u16(&chunk[2..]));

            if run.end() > u16::MAX as u32 {
                return Err(ContainerError::Invalid("run extends past the end of the chunk"));
            }

            if let Some(end) = previous_end {
                if run.value as u32 <= end {
                    return Err(ContainerError::Invalid("runs overlap or are out of order"));
                }
            }

            previous_end = Some(run.end());
            runs[i] = run;
        }

        Ok(Self {
            runs
        })
    }
}

/// An iterator over the values of a run container
pub struct Iter<'a> {
    runs: slice::Iter<'a, Rle16>,

    /// The next value to yield and the last value of the current run
    current: Option<(u32, u32)>
}

impl<'a> Iterator for Iter<'a> {
    type Item = u16;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((next, last)) = self.current {
                if next <= last {
                    self.current = Some((next + 1, last));
                    return Some(next as u16);
                }
            }

            let run = self.runs.next()?;
            self.current = Some((run.value as u32, run.end()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make(values: &[u16]) -> RunContainer {
        let mut run = RunContainer::new_in(Memory::system());
        for value in values {
            run.add(*value).unwrap();
        }

        run
    }

    #[test]
    fn add_extends_and_fuses() {
        let run = make(&[5, 6, 7, 10, 9, 8, 20, 0]);

        assert_eq!(run.runs(), &[Rle16::new(0, 0), Rle16::new(5, 5), Rle16::new(20, 0)]);
        assert_eq!(run.cardinality(), 8);
    }

    #[test]
    fn add_reports_duplicates() {
        let mut run = make(&[100, 101, 102]);

        assert!(!run.add(101).unwrap());
        assert!(run.add(99).unwrap());
        assert_eq!(run.runs(), &[Rle16::new(99, 3)]);
    }

    #[test]
    fn contains_and_iter() {
        let run = RunContainer::from_range_in(100..151, Memory::system()).unwrap();

        assert!(run.contains(100));
        assert!(run.contains(150));
        assert!(!run.contains(151));
        assert!(!run.contains(99));
        assert_eq!(run.iter().collect::<Vec<_>>(), (100..=150).collect::<Vec<u16>>());
        assert_eq!(run.min(), Some(100));
        assert_eq!(run.max(), Some(150));
    }

    #[test]
    fn full_chunk() {
        let run = RunContainer::from_range_in(0..1 << 16, Memory::system()).unwrap();

        assert_eq!(run.cardinality(), 1 << 16);
        assert_eq!(run.iter().count(), 1 << 16);
        assert!(run.contains(65535));
    }

    #[test]
    fn serialize_round_trip() {
        let run = make(&[1, 2, 3, 40, 41, 65535]);

        let mut bytes = Vec::new();
        assert_eq!(run.serialize(&mut bytes).unwrap(), RunContainer::serialized_size(3));
        assert_eq!(RunContainer::peek_num_runs(&bytes), Some(3));

        let decoded = RunContainer::deserialize_in(&bytes, Memory::system()).unwrap();
        assert_eq!(decoded.runs(), run.runs());
    }

    #[test]
    fn deserialize_rejects_bad_runs() {
        // Run reaching past 65535
        let bytes = [1, 0, 0xFF, 0xFF, 1, 0];
        assert!(RunContainer::deserialize_in(&bytes, Memory::system()).is_err());

        // Overlapping runs
        let bytes = [2, 0, 10, 0, 5, 0, 12, 0, 0, 0];
        assert!(RunContainer::deserialize_in(&bytes, Memory::system()).is_err());

        // No runs
        assert!(RunContainer::deserialize_in(&[0, 0], Memory::system()).is_err());
    }
}
