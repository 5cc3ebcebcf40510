use crate::container::Container;
use super::RoaringArray;

/// RoaringStatistics can be used to collect detailed statistics about the composition of a directory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoaringStatistics {
    /// Number of containers
    pub containers: u32,

    /// Number of array containers
    pub array_containers: u32,

    ///  Number of run containers
    pub run_containers: u32,

    /// Number of bitmap containers
    pub bitset_containers: u32,

    /// Number of containers shared with another directory
    pub shared_containers: u32,

    /// Number of values in array containers
    pub values_array_containers: u64,

    /// Number of values in run containers
    pub values_run_containers: u64,

    /// Number of values in bitmap containers
    pub values_bitset_containers: u64,

    /// Number of allocated bytes in array containers
    pub bytes_array_containers: u64,

    /// Number of allocated bytes in run containers
    pub bytes_run_containers: u64,

    /// Number of allocated bytes in bitmap containers
    pub bytes_bitset_containers: u64,

    /// Maximal value. Zero if the cardinality is zero
    pub max_value: u32,

    /// Minimal value. Zero if the cardinality is zero
    pub min_value: u32,

    /// The sum of all values (could be used to compute average)
    pub sum_value: u64,

    /// Total number of values in the directory
    pub cardinality: u64
}

impl RoaringStatistics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoaringArray {
    /// Collect per container type counts for the directory
    pub fn statistics(&self) -> RoaringStatistics {
        let mut stats = RoaringStatistics::new();
        let mut min = None;

        for (index, (key, container)) in self.iter().enumerate() {
            let cardinality = container.cardinality() as u64;
            let bytes = container.size_in_bytes() as u64;

            stats.containers += 1;
            if self.containers[index].is_shared() {
                stats.shared_containers += 1;
            }

            match container {
                Container::Array(_) => {
                    stats.array_containers += 1;
                    stats.values_array_containers += cardinality;
                    stats.bytes_array_containers += bytes;
                },
                Container::Bitset(_) => {
                    stats.bitset_containers += 1;
                    stats.values_bitset_containers += cardinality;
                    stats.bytes_bitset_containers += bytes;
                },
                Container::Run(_) => {
                    stats.run_containers += 1;
                    stats.values_run_containers += cardinality;
                    stats.bytes_run_containers += bytes;
                }
            }

            let high = u32::from(key) << 16;
            if min.is_none() {
                min = container.min().map(|low| high | u32::from(low));
            }

            if let Some(low) = container.max() {
                stats.max_value = high | u32::from(low);
            }

            stats.sum_value += value_sum(high, container);
            stats.cardinality += cardinality;
        }

        stats.min_value = min.unwrap_or(0);
        stats
    }
}

/// Sum of the values in `container` once `high` is or'ed in
fn value_sum(high: u32, container: &Container) -> u64 {
    match container {
        Container::Run(c) => c.runs()
            .iter()
            .map(|run| {
                let count = u64::from(run.length) + 1;
                let first = u64::from(high | u32::from(run.value));

                count * first + count * (count - 1) / 2
            })
            .sum(),
        _ => container.iter()
            .map(|low| u64::from(high | u32::from(low)))
            .sum()
    }
}
