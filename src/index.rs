//! Index & lookup: per-major-block timestamp/duration/id_zero, binary
//! search, and timestamp-to-offset resolution.
//!
//! The current major block is never a valid read target (it is either being
//! filled or being written); every lookup here excludes it.

use crate::disk::IndexEntry;
use crate::error::{Error, Result};

/// Number of oldest-but-valid blocks hidden from readers, a heuristic
/// against a long-running reader being overtaken by the writer. Not proven
/// safe for all `major_block_count`; treat as tunable.
pub const INDEX_SKIP: u32 = 2;

/// Gap declared when consecutive blocks' start timestamps differ by more
/// than this many microseconds.
pub const MAX_DELTA_T: i64 = 1000;

#[derive(Clone, Debug)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new(major_block_count: u32) -> Self {
        Index {
            entries: vec![IndexEntry::default(); major_block_count as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, i: u32) -> IndexEntry {
        self.entries[i as usize]
    }

    pub fn set(&mut self, i: u32, entry: IndexEntry) {
        self.entries[i as usize] = entry;
    }

    /// Returns the index of the latest valid block with a starting
    /// timestamp no later than `timestamp`, excluding `current` and the
    /// `index_skip` blocks immediately following it.
    ///
    /// `index_skip` is normally [`INDEX_SKIP`]; tests exercising the bare
    /// algorithm against a tiny archive (fewer blocks than the skip window)
    /// pass 0 to isolate the search itself from the heuristic.
    pub fn binary_search(&self, current: u32, timestamp: u64, index_skip: u32) -> u32 {
        let n = self.len();
        let mut low = (current + 1 + index_skip) % n;
        let mut high = current;

        while (low + 1) % n != high {
            let mid = if low < high {
                (low + high) / 2
            } else {
                (((low as u64) + (high as u64) + (n as u64)) / 2 % n as u64) as u32
            };
            if timestamp < self.entries[mid as usize].timestamp {
                high = mid;
            } else {
                low = mid;
            }
        }

        if self.entries[low as usize].duration == 0 {
            high
        } else {
            low
        }
    }

    pub fn earliest_timestamp(&self, current: u32) -> u64 {
        self.entries[self.binary_search(current, 1, INDEX_SKIP) as usize].timestamp
    }

    /// Resolves `timestamp` to a `(block, offset_within_block)` pair.
    pub fn timestamp_to_block(
        &self,
        current: u32,
        timestamp: u64,
        skip_gap: bool,
        major_sample_count: u32,
        index_skip: u32,
    ) -> (u32, u32) {
        let mut block = self.binary_search(current, timestamp, index_skip);
        let entry = self.entries[block as usize];

        let offset = if timestamp < entry.timestamp {
            0
        } else if timestamp - entry.timestamp < u64::from(entry.duration) {
            ((timestamp - entry.timestamp) * u64::from(major_sample_count) / u64::from(entry.duration))
                as u32
        } else if skip_gap {
            block = (block + 1) % self.len();
            0
        } else {
            major_sample_count - 1
        };

        (block, offset)
    }

    fn compute_samples(&self, current: u32, block: u32, offset: u32, major_sample_count: u32) -> u64 {
        let n = self.len();
        let block_count = if current >= block {
            current - block
        } else {
            n - block + current
        };
        u64::from(block_count) * u64::from(major_sample_count) - u64::from(offset)
    }

    /// Resolves a start timestamp, failing if it lands on the current block
    /// (too recent) or, unless `all_data`, inside a data gap.
    pub fn timestamp_to_start(
        &self,
        current: u32,
        timestamp: u64,
        all_data: bool,
        major_sample_count: u32,
        index_skip: u32,
    ) -> Result<(u32, u32, u64)> {
        let (block, offset) = self.timestamp_to_block(current, timestamp, true, major_sample_count, index_skip);
        if block == current {
            return Err(Error::TimestampLate {
                reason: "Start time too late",
            });
        }
        if !all_data && self.entries[block as usize].timestamp > timestamp {
            return Err(Error::TimestampInGap);
        }
        let samples_available = self.compute_samples(current, block, offset, major_sample_count);
        Ok((block, offset, samples_available))
    }

    /// Resolves an end timestamp, failing unless `all_data` and the
    /// resolved block's end is at or after `timestamp`.
    pub fn timestamp_to_end(
        &self,
        current: u32,
        timestamp: u64,
        all_data: bool,
        major_sample_count: u32,
        index_skip: u32,
    ) -> Result<(u32, u32)> {
        let (block, offset) = self.timestamp_to_block(current, timestamp, false, major_sample_count, index_skip);
        let entry = self.entries[block as usize];
        let end_timestamp = entry.timestamp + u64::from(entry.duration);
        if !all_data && timestamp > end_timestamp {
            return Err(Error::TimestampLate {
                reason: "End timestamp too late",
            });
        }
        Ok((block, offset))
    }

    /// Walks forward from `start` declaring a gap where inter-block
    /// `|delta_t|` exceeds [`MAX_DELTA_T`], or (if `check_id0`) where the
    /// `id_zero` witness is discontinuous.
    pub fn find_gap(&self, check_id0: bool, start: &mut u32, blocks: &mut u32, major_sample_count: u32) -> bool {
        let n = self.len();
        let mut entry = self.entries[*start as usize];
        let mut timestamp = entry.timestamp + u64::from(entry.duration);
        let mut id_zero = entry.id_zero.wrapping_add(major_sample_count as i32);

        while *blocks > 1 {
            *blocks -= 1;
            *start += 1;
            if *start == n {
                *start = 0;
            }

            entry = self.entries[*start as usize];
            let delta_t = entry.timestamp as i64 - timestamp as i64;
            if (check_id0 && entry.id_zero != id_zero) || delta_t < -MAX_DELTA_T || delta_t > MAX_DELTA_T {
                return true;
            }

            timestamp = entry.timestamp + u64::from(entry.duration);
            id_zero = entry.id_zero.wrapping_add(major_sample_count as i32);
        }
        false
    }
}

/// Fits a straight line through `timestamps` (relative to `first_timestamp`)
/// and returns the block's `(timestamp, duration)` pair.
pub fn fit_timestamp(timestamps: &[i32], first_timestamp: u64) -> (u64, u32) {
    let t_count = timestamps.len() as i64;
    let mut sum_x: i64 = 0;
    let mut sum_xt: i64 = 0;
    for (i, &x) in timestamps.iter().enumerate() {
        let t = 2 * i as i64 - t_count + 1;
        sum_xt += i64::from(x) * t;
        sum_x += i64::from(x);
    }
    let sum_t2 = (t_count * t_count - 1) * t_count / 3;

    let duration = (2 * t_count * sum_xt / sum_t2) as u32;
    let timestamp =
        (first_timestamp as i64 + sum_x / t_count - (t_count + 1) * sum_xt / sum_t2) as u64;
    (timestamp, duration)
}

/// Single-pole IIR smoothing of the rolling `last_duration` estimate.
pub fn iir_duration(duration: u32, last_duration: u32) -> u32 {
    const ALPHA: f64 = 0.1;
    (f64::from(duration) * ALPHA + f64::from(last_duration) * (1.0 - ALPHA)).round() as u32
}
