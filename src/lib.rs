#![deny(bare_trait_objects)]

//! Rusting Roaring Array is the container directory of a roaring bitmap, loosely following CRoaring
//!
//! - A sorted map from 16 bit keys to array, bitset and run containers
//! - Copy-on-Write sharing of containers between directories
//! - The portable serialization format shared with other roaring implementations
//! - Custom allocator support through memory hooks, including a bump arena

pub mod container;
pub mod error;
pub mod memory;
pub mod roaring_array;

#[cfg(test)]
mod test;

pub use container::{Container, ContainerRef, Typecode};
pub use error::{AllocError, DeserializeError, Error};
pub use memory::{Arena, Memory, MemoryHook, System};
pub use roaring_array::{RoaringArray, RoaringStatistics, MAX_CONTAINERS};
