//! The portable serialization format, shared with the other roaring implementations.
//! See https://github.com/RoaringBitmap/RoaringFormatSpec for details

use std::io::{self, Write};
use std::mem;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use tracing::debug;

use crate::container::{
    ArrayContainer,
    BitsetContainer,
    Container,
    ContainerError,
    ContainerRef,
    RunContainer,
    BITSET_ALIGNMENT,
    DEFAULT_MAX_SIZE
};
use crate::error::DeserializeError;
use crate::memory::{Arena, Memory, MAX_ALIGN};
use super::{RoaringArray, MAX_CONTAINERS};

/// Cookie of a directory without run containers, followed by a 32 bit container count
pub const SERIAL_COOKIE_NO_RUNCONTAINER: u32 = 12346;

/// Cookie of a directory with run containers. The high 16 bits hold the container count minus one
pub const SERIAL_COOKIE: u32 = 12347;

/// Directories with run containers and fewer containers than this omit the offset table
pub const NO_OFFSET_THRESHOLD: usize = 4;

impl RoaringArray {
    /// Check if any container is a run container
    pub fn has_run_container(&self) -> bool {
        self.containers.iter()
            .any(|c| c.is_run())
    }

    /// Size in bytes of the cookie, run flags, key/cardinality pairs and offset table
    pub fn portable_header_size(&self) -> usize {
        let len = self.len();

        if self.has_run_container() {
            let flags = (len + 7) / 8;

            if len < NO_OFFSET_THRESHOLD {
                4 + flags + 4 * len
            }
            else {
                4 + flags + 8 * len
            }
        }
        else {
            4 + 4 + 8 * len
        }
    }

    /// Get the exact number of bytes `portable_serialize` writes
    pub fn portable_size_in_bytes(&self) -> usize {
        let mut count = self.portable_header_size();

        for c in self.containers.iter() {
            count += c.portable_size();
        }

        count
    }

    /// Serialize the directory to a stream in the portable format
    ///
    /// # Returns
    /// The number of bytes written to the buffer
    ///
    /// # Errors
    /// Fails with `InvalidInput` if a container is empty, which the format cannot express
    pub fn portable_serialize<W: Write>(&self, buf: &mut W) -> io::Result<usize> {
        if self.containers.iter().any(|c| c.is_empty()) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot serialize an empty container"));
        }

        let len = self.len();
        let has_run = self.has_run_container();
        let mut bytes_written = 0;

        // Write the header
        if has_run {
            let cookie = SERIAL_COOKIE | (((len - 1) as u32) << 16);
            buf.write_u32::<LittleEndian>(cookie)?;

            let mut flags = vec![0u8; (len + 7) / 8];
            for (i, c) in self.containers.iter().enumerate() {
                if c.is_run() {
                    flags[i / 8] |= 1 << (i % 8);
                }
            }

            buf.write_all(&flags)?;
            bytes_written += mem::size_of::<u32>() + flags.len();
        }
        else {
            buf.write_u32::<LittleEndian>(SERIAL_COOKIE_NO_RUNCONTAINER)?;
            buf.write_u32::<LittleEndian>(len as u32)?;
            bytes_written += 2 * mem::size_of::<u32>();
        }

        // Write the keys and cardinalities
        for (key, c) in self.keys.iter().zip(self.containers.iter()) {
            buf.write_u16::<LittleEndian>(*key)?;
            buf.write_u16::<LittleEndian>((c.cardinality() - 1) as u16)?;
            bytes_written += 2 * mem::size_of::<u16>();
        }

        // Write the container offsets unless there are run containers and few containers
        if !has_run || len >= NO_OFFSET_THRESHOLD {
            let mut offset = self.portable_header_size();

            for c in self.containers.iter() {
                buf.write_u32::<LittleEndian>(offset as u32)?;
                offset += c.portable_size();
            }

            bytes_written += len * mem::size_of::<u32>();
        }

        for c in self.containers.iter() {
            bytes_written += c.portable_serialize(buf)?;
        }

        Ok(bytes_written)
    }

    /// Validate a serialized directory without decoding its containers
    ///
    /// # Returns
    /// The number of bytes the serialized directory occupies at the start of `buf`
    pub fn portable_deserialize_size(buf: &[u8]) -> Result<usize, DeserializeError> {
        Layout::parse(buf).map(|layout| layout.size)
    }

    /// Deserialize a directory from the start of `buf`, allocating from the global memory hook
    pub fn portable_deserialize(buf: &[u8]) -> Result<Self, DeserializeError> {
        Self::portable_deserialize_in(buf, Memory::global())
    }

    /// Deserialize a directory from the start of `buf`, allocating from `memory`
    pub fn portable_deserialize_in(buf: &[u8], memory: Memory) -> Result<Self, DeserializeError> {
        let layout = Layout::parse(buf)
            .map_err(log_rejection)?;

        layout.decode(buf, memory)
            .map_err(log_rejection)
    }

    /// Deserialize a directory from the start of `buf`, placing the directory and all of its
    /// containers in a single [`Arena`] sized from the header.
    ///
    /// The arena is released once the directory and every container taken from it are dropped.
    pub fn portable_deserialize_arena(buf: &[u8]) -> Result<Self, DeserializeError> {
        let layout = Layout::parse(buf)
            .map_err(log_rejection)?;

        let arena = Arena::new(layout.arena_capacity())?;

        layout.decode(buf, arena.into_memory())
            .map_err(log_rejection)
    }

    /// Replace the contents of `self` with the directory serialized at the start of `buf`,
    /// allocating from this directory's memory. `self` is untouched on failure.
    pub fn portable_deserialize_into(&mut self, buf: &[u8]) -> Result<(), DeserializeError> {
        *self = Self::portable_deserialize_in(buf, self.memory.clone())?;

        Ok(())
    }
}

fn log_rejection(error: DeserializeError) -> DeserializeError {
    debug!(%error, "rejected serialized directory");

    error
}

/// How a container payload is encoded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Payload {
    Array,
    Bitset,
    Run
}

/// A header entry resolved to the position of its payload
#[derive(Debug)]
struct Entry {
    key: u16,
    cardinality: usize,
    payload: Payload,
    offset: usize,
    len: usize
}

/// The validated structure of a serialized directory
#[derive(Debug)]
struct Layout {
    entries: Vec<Entry>,

    /// Total number of bytes, header included
    size: usize
}

impl Layout {
    fn parse(buf: &[u8]) -> Result<Self, DeserializeError> {
        let mut reader = Reader { buf, pos: 0 };

        // Read out the cookie and number of containers
        let cookie = LittleEndian::read_u32(reader.take(4)?);

        let has_run = cookie & 0xFFFF == SERIAL_COOKIE;
        let count = if has_run {
            (cookie >> 16) as usize + 1
        }
        else if cookie == SERIAL_COOKIE_NO_RUNCONTAINER {
            let count = LittleEndian::read_u32(reader.take(4)?);
            if count as usize > MAX_CONTAINERS {
                return Err(DeserializeError::InvalidContainerCount(count));
            }

            count as usize
        }
        else {
            return Err(DeserializeError::InvalidCookie(cookie));
        };

        let run_flags: &[u8] = if has_run {
            reader.take((count + 7) / 8)?
        }
        else {
            &[]
        };

        // Read out the keys and cardinalities
        let pairs = reader.take(4 * count)?;
        let mut entries: Vec<Entry> = Vec::with_capacity(count);

        for (i, pair) in pairs.chunks_exact(4).enumerate() {
            let key = LittleEndian::read_u16(pair);
            let cardinality = LittleEndian::read_u16(&pair[2..]) as usize + 1;

            if entries.last().map_or(false, |prev| prev.key >= key) {
                return Err(DeserializeError::UnsortedKeys { index: i });
            }

            let payload = if has_run && run_flags[i / 8] & (1 << (i % 8)) != 0 {
                Payload::Run
            }
            else if cardinality > DEFAULT_MAX_SIZE {
                Payload::Bitset
            }
            else {
                Payload::Array
            };

            entries.push(Entry {
                key,
                cardinality,
                payload,
                offset: 0,
                len: 0
            });
        }

        // The offsets are implied by the payload sizes, so the table is skipped
        if !has_run || count >= NO_OFFSET_THRESHOLD {
            reader.take(4 * count)?;
        }

        // Locate every payload
        for entry in entries.iter_mut() {
            entry.offset = reader.pos;
            entry.len = match entry.payload {
                Payload::Array => ArrayContainer::serialized_size(entry.cardinality),
                Payload::Bitset => BitsetContainer::serialized_size(),
                Payload::Run => {
                    let num_runs = RunContainer::peek_num_runs(reader.remaining())
                        .ok_or_else(|| reader.truncated(2))?;

                    RunContainer::serialized_size(num_runs)
                }
            };

            reader.take(entry.len)?;
        }

        Ok(Self {
            entries,
            size: reader.pos
        })
    }

    /// Arena bytes needed to decode every container plus the directory arrays
    fn arena_capacity(&self) -> usize {
        let count = self.entries.len();

        let mut capacity = Arena::footprint(count * mem::size_of::<u16>(), MAX_ALIGN)
            + Arena::footprint(count * mem::size_of::<ContainerRef>(), MAX_ALIGN);

        for entry in self.entries.iter() {
            capacity += match entry.payload {
                Payload::Array => Arena::footprint(entry.len, MAX_ALIGN),
                Payload::Bitset => Arena::footprint(entry.len, BITSET_ALIGNMENT),

                // The run count is not stored in memory
                Payload::Run => Arena::footprint(entry.len - 2, MAX_ALIGN)
            };
        }

        capacity
    }

    /// Decode every container into a new directory
    fn decode(&self, buf: &[u8], memory: Memory) -> Result<RoaringArray, DeserializeError> {
        let mut result = RoaringArray::with_capacity_in(self.entries.len(), memory.clone())?;

        for entry in self.entries.iter() {
            let container = entry.decode(buf, memory.clone())?;
            result.append(entry.key, container)?;
        }

        debug!(containers = result.len(), bytes = self.size, "deserialized directory");

        Ok(result)
    }
}

impl Entry {
    fn decode(&self, buf: &[u8], memory: Memory) -> Result<Container, DeserializeError> {
        let bytes = &buf[self.offset..self.offset + self.len];

        let container = match self.payload {
            Payload::Array => ArrayContainer::deserialize_in(bytes, self.cardinality, memory)
                .map(Container::Array),
            Payload::Bitset => BitsetContainer::deserialize_in(bytes, memory)
                .map(Container::Bitset),
            Payload::Run => RunContainer::deserialize_in(bytes, memory)
                .map(Container::Run)
        };

        let container = container.map_err(|error| match error {
            ContainerError::Alloc(error) => DeserializeError::Alloc(error),
            ContainerError::Invalid(reason) => DeserializeError::InvalidContainer { key: self.key, reason }
        })?;

        if container.cardinality() != self.cardinality {
            return Err(DeserializeError::InvalidContainer {
                key: self.key,
                reason: "cardinality does not match the header"
            });
        }

        Ok(container)
    }
}

/// A cursor over the input that reports truncation instead of reading past the end
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DeserializeError> {
        let end = self.pos.checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.truncated(len))?;

        let bytes = &self.buf[self.pos..end];
        self.pos = end;

        Ok(bytes)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn truncated(&self, len: usize) -> DeserializeError {
        DeserializeError::Truncated {
            needed: self.pos.saturating_add(len),
            available: self.buf.len()
        }
    }
}
