//! Transform engine: turns raw sniffer frames into transposed, decimated
//! on-disk major blocks, and maintains the block index.
//!
//! `TransformEngine` keeps one in-flight minor/major block pair at a time,
//! double-buffered via a two-element array and a `current` index so a block
//! being written never aliases the one being filled.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use log::info;

use crate::aligned::AlignedBlock;
use crate::decimate::{DecimatedSample, DecimationAccumulator, Sample};
use crate::disk::writer::WriteRequest;
use crate::disk::{Geometry, Index, SharedHeader};
use crate::index::{self, INDEX_SKIP};

/// Decimated data for every archived device across the whole archive,
/// row-major by device (`Geometry::dd_table_offset`).
pub type SharedDdArea = Arc<Mutex<Vec<DecimatedSample>>>;
pub type SharedIndex = Arc<Mutex<Index>>;

/// One minor block: `input_frame_count` frames of raw samples from the
/// sniffer, row-major over `(row, device id)` with `n_devices` samples per
/// row, or `None` to mark a gap.
pub type InputBlock = Vec<Sample>;

pub struct TransformEngine {
    geometry: Geometry,
    archived_ids: Vec<u32>,

    buffers: [AlignedBlock; 2],
    current_buffer: usize,
    fa_offset: u32,
    d_offset: u32,

    /// Per-device level-1 window accumulator, finalized into the major
    /// block's D1 column every `2^first_decimation_log2` raw samples.
    level1_accumulators: Vec<DecimationAccumulator>,
    raw_in_level1: u32,

    dd_offset: u32,
    double_accumulators: Vec<DecimationAccumulator>,
    dd_area: SharedDdArea,

    timestamp_count: u32,
    timestamp_array: Vec<i32>,
    timestamp_index: u32,
    first_timestamp: u64,

    header: SharedHeader,
    index: SharedIndex,
    write_tx: Sender<WriteRequest>,
    ring_depth: u32,
}

impl TransformEngine {
    /// `geometry.input_frame_count` is the number of raw samples advanced
    /// per `process_block` call (the minor block size).
    pub fn new(
        geometry: Geometry,
        header: SharedHeader,
        index: SharedIndex,
        dd_area: SharedDdArea,
        write_tx: Sender<WriteRequest>,
    ) -> Self {
        let archived_ids: Vec<u32> = geometry.archive_mask.ids().collect();
        let k = archived_ids.len();
        let major_block_size = geometry.major_block_size() as usize;
        let timestamp_count = geometry.major_sample_count / geometry.input_frame_count;
        let current_major_block = header.lock().unwrap().current_major_block;

        let mut engine = TransformEngine {
            geometry,
            archived_ids,
            buffers: [AlignedBlock::new(major_block_size), AlignedBlock::new(major_block_size)],
            current_buffer: 0,
            fa_offset: 0,
            d_offset: 0,
            level1_accumulators: vec![DecimationAccumulator::new(); k],
            raw_in_level1: 0,
            dd_offset: 0,
            double_accumulators: vec![DecimationAccumulator::new(); k],
            dd_area,
            timestamp_count,
            timestamp_array: vec![0i32; timestamp_count as usize],
            timestamp_index: 0,
            first_timestamp: 0,
            header,
            index,
            write_tx,
            ring_depth: 0,
        };
        engine.reset_double_decimation(current_major_block);
        engine
    }

    fn decimation_log2(&self) -> u32 {
        self.geometry.decimation_log2()
    }

    /// Records the ring buffer depth observed for the most recently consumed
    /// frame, forwarded to the writer alongside the next completed block.
    pub fn report_backlog(&mut self, depth: u32) {
        self.ring_depth = depth;
    }

    /// Processes one minor block of raw frames, or `None` to report a gap.
    pub fn process_block(&mut self, block: Option<(&InputBlock, u64)>) {
        match block {
            Some((frame, timestamp)) => self.process_frame(frame, timestamp),
            None => self.process_gap(),
        }
    }

    fn process_frame(&mut self, frame: &InputBlock, timestamp: u64) {
        self.index_minor_block(frame, timestamp);
        self.transpose_block(frame);
        self.decimate_block(frame);

        let must_write = self.advance_minor_block();

        let decimation = 1u32 << self.decimation_log2();
        if self.fa_offset % decimation == 0 {
            self.double_decimate_block();
        }

        if must_write {
            self.write_major_block();
            self.advance_index();
        }
    }

    fn process_gap(&mut self) {
        self.reset_minor_block();
        self.reset_index();
        let current_major_block = self.header.lock().unwrap().current_major_block;
        self.reset_double_decimation(current_major_block);
        let _ = self.write_tx.try_send(WriteRequest::Gap);
    }

    /// Writes each archived device's column of `input_frame_count` raw
    /// samples for this minor block into the buffer at its
    /// `fa_data_offset`. `frame` is row-major over `(row, device id)` with
    /// `input_frame_count` rows.
    fn transpose_block(&mut self, frame: &InputBlock) {
        let fa_offset = self.fa_offset;
        let n = self.geometry.n_devices;
        let input_frame_count = self.geometry.input_frame_count;
        let buf = &mut self.buffers[self.current_buffer];
        for (col, &id) in self.archived_ids.iter().enumerate() {
            for r in 0..input_frame_count {
                let sample = frame[(r * n + id) as usize];
                let at = self.geometry.fa_data_offset(col as u32, fa_offset + r);
                write_sample(buf, at, sample);
            }
        }
    }

    /// Folds each of this minor block's `input_frame_count` rows into the
    /// level-1 and level-2 accumulators, finalizing and writing a D1 column
    /// entry (and advancing `d_offset`) every time a
    /// `2^first_decimation_log2` window of raw samples completes. Windows
    /// may span several `process_block` calls when `input_frame_count <
    /// 2^first_decimation_log2`, so completion is tracked per row rather
    /// than once per call.
    fn decimate_block(&mut self, frame: &InputBlock) {
        let n = self.geometry.n_devices;
        let input_frame_count = self.geometry.input_frame_count;
        let d1_window = 1u32 << self.geometry.first_decimation_log2;

        for r in 0..input_frame_count {
            for (col, &id) in self.archived_ids.iter().enumerate() {
                let sample = frame[(r * n + id) as usize];
                self.level1_accumulators[col].accum(sample);
                self.double_accumulators[col].accum(sample);
            }
            self.raw_in_level1 += 1;

            if self.raw_in_level1 == d1_window {
                let d_offset = self.d_offset;
                for col in 0..self.archived_ids.len() {
                    let mut out = DecimatedSample::default();
                    self.level1_accumulators[col]
                        .finalize(self.geometry.first_decimation_log2, &mut out);
                    let at = self.geometry.d_data_offset(col as u32, d_offset);
                    write_decimated(&mut self.buffers[self.current_buffer], at, out);
                    self.level1_accumulators[col] = DecimationAccumulator::new();
                }
                self.raw_in_level1 = 0;
                self.d_offset += 1;
            }
        }
    }

    /// Advances `fa_offset` by one minor block (`input_frame_count`
    /// samples), returning true iff the major block buffer is now full.
    /// `d_offset` is advanced incrementally in [`Self::decimate_block`] as
    /// D1 windows complete.
    fn advance_minor_block(&mut self) -> bool {
        self.fa_offset += self.geometry.input_frame_count;
        self.fa_offset >= self.geometry.major_sample_count
    }

    fn reset_minor_block(&mut self) {
        self.fa_offset = 0;
        self.d_offset = 0;
        self.raw_in_level1 = 0;
        for acc in &mut self.level1_accumulators {
            *acc = DecimationAccumulator::new();
        }
        for byte in self.buffers[self.current_buffer].iter_mut() {
            *byte = 0;
        }
    }

    fn write_major_block(&mut self) {
        let bytes = self.buffers[self.current_buffer].clone_contents();
        let _ = self.write_tx.try_send(WriteRequest::Block {
            data: bytes,
            backlog: self.ring_depth,
        });

        self.current_buffer = 1 - self.current_buffer;
        self.reset_minor_block();
    }

    fn double_decimate_block(&mut self) {
        let decimation_log2 = self.decimation_log2();
        let dd_total = self.geometry.dd_total_count();
        let mut area = self.dd_area.lock().unwrap();
        for (row, acc) in self.double_accumulators.iter_mut().enumerate() {
            let mut out = DecimatedSample::default();
            acc.finalize(decimation_log2, &mut out);
            let index = row as u64 * dd_total + u64::from(self.dd_offset);
            area[index as usize] = out;
            *acc = DecimationAccumulator::new();
        }
        self.dd_offset = (self.dd_offset + 1) % self.geometry.dd_total_count() as u32;
    }

    fn reset_double_decimation(&mut self, current_major_block: u32) {
        self.dd_offset = current_major_block * self.geometry.dd_sample_count();
        for acc in &mut self.double_accumulators {
            *acc = DecimationAccumulator::new();
        }
    }

    fn index_minor_block(&mut self, frame: &InputBlock, timestamp: u64) {
        if self.timestamp_index == 0 {
            self.first_timestamp = timestamp;
            let current_major_block = self.header.lock().unwrap().current_major_block;
            let mut ix = self.index.lock().unwrap();
            let mut entry = ix.get(current_major_block);
            entry.id_zero = frame.first().map(|s| s.x).unwrap_or(0);
            ix.set(current_major_block, entry);
        }
        self.timestamp_array[self.timestamp_index as usize] =
            (timestamp - self.first_timestamp) as i32;
        self.timestamp_index += 1;
    }

    fn reset_index(&mut self) {
        self.timestamp_index = 0;
    }

    /// Completes the current major block's index entry with a linear fit
    /// through the collected minor-block timestamps, then advances
    /// `current_major_block`.
    fn advance_index(&mut self) {
        let (timestamp, duration) = index::fit_timestamp(&self.timestamp_array, self.first_timestamp);

        let mut header = self.header.lock().unwrap();
        let current = header.current_major_block;
        let mut ix = self.index.lock().unwrap();
        let mut entry = ix.get(current);
        entry.timestamp = timestamp;
        entry.duration = duration;
        ix.set(current, entry);
        drop(ix);

        header.last_duration = index::iir_duration(duration, header.last_duration);
        header.current_major_block = (current + 1) % self.geometry.major_block_count;
        info!(
            "major block {} complete: timestamp={} duration={}",
            current, timestamp, duration
        );
        self.timestamp_index = 0;
    }
}

fn write_sample(buf: &mut [u8], at: usize, sample: Sample) {
    buf[at..at + 4].copy_from_slice(&sample.x.to_le_bytes());
    buf[at + 4..at + 8].copy_from_slice(&sample.y.to_le_bytes());
}

fn write_decimated(buf: &mut [u8], at: usize, sample: DecimatedSample) {
    let mut offset = at;
    for s in &[sample.min, sample.max, sample.mean, sample.std] {
        write_sample(buf, offset, *s);
        offset += 8;
    }
}

/// Resolves a start timestamp to `(block, offset, samples_available)`,
/// guarded by the shared index/header lock.
pub fn timestamp_to_start(
    header: &SharedHeader,
    index: &SharedIndex,
    geometry: &Geometry,
    timestamp: u64,
    all_data: bool,
) -> crate::error::Result<(u32, u32, u64)> {
    let current = header.lock().unwrap().current_major_block;
    index.lock().unwrap().timestamp_to_start(
        current,
        timestamp,
        all_data,
        geometry.major_sample_count,
        INDEX_SKIP,
    )
}

pub fn timestamp_to_end(
    header: &SharedHeader,
    index: &SharedIndex,
    geometry: &Geometry,
    timestamp: u64,
    all_data: bool,
) -> crate::error::Result<(u32, u32)> {
    let current = header.lock().unwrap().current_major_block;
    index.lock().unwrap().timestamp_to_end(
        current,
        timestamp,
        all_data,
        geometry.major_sample_count,
        INDEX_SKIP,
    )
}

pub fn earliest_timestamp(header: &SharedHeader, index: &SharedIndex) -> u64 {
    let current = header.lock().unwrap().current_major_block;
    index.lock().unwrap().earliest_timestamp(current)
}
