#![cfg(test)]

use std::ops::Range;

use rand::prelude::*;
use rand::rngs::SmallRng;

use crate::container::Container;
use crate::memory::Memory;
use crate::roaring_array::RoaringArray;

const SEED: u64 = 0x3416_3860_9547_6812;

/// Generates `count` random values in the range [min-max).
/// Values are then deduplicated and sorted
pub(crate) fn generate_data(range: Range<u32>, count: usize) -> Vec<u32> {
    let mut rng = SmallRng::seed_from_u64(SEED);

    let mut result = Vec::with_capacity(count);
    while result.len() < count {
        result.push(rng.gen_range(range.clone()));
    }

    result.sort_unstable();
    result.dedup();

    result
}

/// Create a container holding `values` from the system allocator
pub(crate) fn array_of(values: &[u16]) -> Container {
    Container::from_values_in(values, Memory::system())
        .unwrap()
}

/// Create a directory where each key's container holds just the key
pub(crate) fn directory_with_keys(keys: &[u16]) -> RoaringArray {
    let mut ra = RoaringArray::new_in(Memory::system());
    for key in keys {
        ra.append(*key, array_of(&[*key])).unwrap();
    }

    ra
}

/// Build a directory from sorted values, splitting them into one container per key.
/// Every third container is converted to runs
pub(crate) fn directory_from_values(values: &[u32], memory: Memory) -> RoaringArray {
    let mut ra = RoaringArray::new_in(memory.clone());

    let mut start = 0;
    while start < values.len() {
        let key = (values[start] >> 16) as u16;
        let end = start + values[start..].partition_point(|v| (v >> 16) as u16 == key);

        let lows: Vec<u16> = values[start..end].iter()
            .map(|v| *v as u16)
            .collect();

        let container = if ra.len() % 3 == 2 {
            let mut run = Container::from_range_in(0..0, memory.clone()).unwrap();
            for low in lows.iter() {
                run.add(*low).unwrap();
            }

            run
        }
        else {
            Container::from_values_in(&lows, memory.clone()).unwrap()
        };

        ra.append(key, container).unwrap();
        start = end;
    }

    ra
}

#[test]
fn generated_data_is_sorted_and_bounded() {
    let data = generate_data(100..5000, 1000);

    assert!(data.windows(2).all(|w| w[0] < w[1]));
    assert!(data.iter().all(|v| (100..5000).contains(v)));
    assert_eq!(data, generate_data(100..5000, 1000));
}

#[test]
fn directory_from_values_round_trips() {
    let data = generate_data(0..10_000_000, 200_000);
    let ra = directory_from_values(&data, Memory::system());

    assert!(ra.keys().windows(2).all(|w| w[0] < w[1]));
    assert!(ra.has_run_container());
    assert_eq!(ra.to_vec(), data);
}
