//! Disk layout & header: fixed on-disk header, major-block geometry, and the
//! circular data region's gap log.
//!
//! Geometry fields are immutable once the archive is created; the mutable fields
//! (`disk_status`, `write_buffer`, `write_backlog`, `last_duration`,
//! `current_major_block`, the gap-record stack) are written by the writer
//! and transform threads and mirrored to the mmap'd file under the header
//! byte-range lock (see `writer`).

pub mod writer;

use std::convert::TryInto;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::mask::FilterMask;

/// Bytes occupied by one raw [`Sample`] column entry.
pub const SAMPLE_SIZE: u64 = 8;
/// Bytes occupied by one [`DecimatedSample`] (min/max/mean/std, 4 `Sample`s).
pub const DECIMATED_SAMPLE_SIZE: u64 = 32;

/// Upper bound on the number of gap-bounded block records the header keeps:
/// a fixed-length stack, sized generously for any realistic gap rate.
pub const MAX_HEADER_BLOCKS: usize = 16;

pub const MAGIC: u32 = 0x4641_4301; // "FAC" + version byte
const HEADER_FORMAT_VERSION: u32 = 1;

/// Archive geometry, chosen once at archive-creation time and never changed
/// in place; changing it requires recreating the archive from scratch.
#[derive(Clone, Debug)]
pub struct Geometry {
    pub n_devices: u32,
    pub archive_mask: FilterMask,
    pub input_frame_count: u32,
    pub major_sample_count: u32,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub major_block_count: u32,
}

impl Geometry {
    pub fn k(&self) -> u32 {
        self.archive_mask.popcount()
    }

    pub fn decimation_log2(&self) -> u32 {
        self.first_decimation_log2 + self.second_decimation_log2
    }

    /// `major_block_size = k * (major_sample_count * 8 + (major_sample_count >> D1) * 32)`.
    pub fn major_block_size(&self) -> u64 {
        let raw_column = u64::from(self.major_sample_count) * SAMPLE_SIZE;
        let d1_column =
            u64::from(self.major_sample_count >> self.first_decimation_log2) * DECIMATED_SAMPLE_SIZE;
        u64::from(self.k()) * (raw_column + d1_column)
    }

    pub fn dd_sample_count(&self) -> u32 {
        self.major_sample_count >> self.decimation_log2()
    }

    pub fn dd_total_count(&self) -> u64 {
        u64::from(self.major_block_count) * u64::from(self.dd_sample_count())
    }

    fn per_device_block_size(&self) -> u64 {
        u64::from(self.major_sample_count) * SAMPLE_SIZE
            + u64::from(self.major_sample_count >> self.first_decimation_log2) * DECIMATED_SAMPLE_SIZE
    }

    /// Byte offset, within one archived device's column inside a major
    /// block buffer, of the raw sample at `fa_offset`.
    pub fn fa_data_offset(&self, device_w: u32, fa_offset: u32) -> usize {
        (u64::from(device_w) * self.per_device_block_size() + u64::from(fa_offset) * SAMPLE_SIZE)
            as usize
    }

    /// Byte offset of the level-1 decimated sample at `d_offset` for device
    /// `device_w`.
    pub fn d_data_offset(&self, device_w: u32, d_offset: u32) -> usize {
        (u64::from(device_w) * self.per_device_block_size()
            + u64::from(self.major_sample_count) * SAMPLE_SIZE
            + u64::from(d_offset) * DECIMATED_SAMPLE_SIZE) as usize
    }

    /// Byte offset into the global DD table (device, dd_offset) row-major.
    pub fn dd_table_offset(&self, device_w: u32, dd_offset: u32) -> usize {
        (u64::from(device_w) * self.dd_total_count() + u64::from(dd_offset)) as usize
    }
}

/// One gap-bounded interval of the archive, most recent at index 0.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockRecord {
    pub start_sec: u64,
    pub stop_sec: u64,
    pub start_offset: i64,
    pub stop_offset: i64,
}

/// Whether the writer thread currently has an open archive block. Spec.md's
/// `disk_status` field (`0` idle / `1` writing), given a name instead of a
/// raw byte so log lines read naturally.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum DiskStatus {
    Idle,
    Writing,
}

impl DiskStatus {
    fn as_u8(self) -> u8 {
        match self {
            DiskStatus::Idle => 0,
            DiskStatus::Writing => 1,
        }
    }

    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(DiskStatus::Idle),
            1 => Ok(DiskStatus::Writing),
            other => Err(Error::HeaderInvalid {
                reason: format!("unknown disk_status byte {}", other),
            }),
        }
    }
}

/// The full archive header: immutable geometry plus the mutable runtime
/// fields the writer thread owns.
#[derive(Clone, Debug)]
pub struct Header {
    pub geometry: Geometry,
    pub data_start: u64,
    pub data_size: u64,

    pub disk_status: DiskStatus,
    pub write_buffer: u32,
    pub write_backlog: u32,
    pub last_duration: u32,
    pub current_major_block: u32,
    pub block_count: u32,
    pub blocks: [BlockRecord; MAX_HEADER_BLOCKS],
}

impl Header {
    pub fn new(geometry: Geometry, data_start: u64) -> Self {
        let data_size = u64::from(geometry.major_block_count) * geometry.major_block_size();
        Header {
            geometry,
            data_start,
            data_size,
            disk_status: DiskStatus::Idle,
            write_buffer: 0,
            write_backlog: 0,
            last_duration: 0,
            current_major_block: 0,
            block_count: 0,
            blocks: [BlockRecord::default(); MAX_HEADER_BLOCKS],
        }
    }

    /// Checks geometry consistency against the derived sizes and, if given,
    /// the file's actual size.
    pub fn validate(&self, file_size: Option<u64>) -> Result<()> {
        let expected_size = u64::from(self.geometry.major_block_count) * self.geometry.major_block_size();
        if self.data_size != expected_size {
            return Err(Error::HeaderInvalid {
                reason: format!(
                    "data_size {} does not match geometry-derived size {}",
                    self.data_size, expected_size
                ),
            });
        }
        if let Some(size) = file_size {
            let required = self.data_start + self.data_size;
            if size < required {
                return Err(Error::HeaderInvalid {
                    reason: format!(
                        "archive file is {} bytes, needs at least {}",
                        size, required
                    ),
                });
            }
        }
        Ok(())
    }

    /// Byte length of [`Self::encode`]'s output for an `n_devices`-sized
    /// archive, without constructing a `Header`: the fixed fields plus the
    /// `ceil(n_devices/8)`-byte mask. Used by callers that need to read
    /// exactly the header region off disk before they can decode it.
    pub fn encoded_len(n_devices: u32) -> usize {
        const FIXED_FIELDS: usize = 4 + 4 + 4 // magic, version, n_devices
            + 4 + 4 + 1 + 1 + 4 + 8 + 8 + 8 + 8 // input_frame_count .. data_size
            + 1 + 4 + 4 + 4 + 4 + 4; // disk_status .. block_count
        const BLOCKS: usize = MAX_HEADER_BLOCKS * (8 + 8 + 8 + 8);
        let mask_len = ((n_devices + 7) / 8) as usize;
        FIXED_FIELDS + mask_len + BLOCKS
    }

    /// Encodes the fixed-size portion of the header (everything but the DD
    /// table and major-block region) as little-endian bytes, per
    /// SPEC_FULL.md's §4.6 field order: `archive_mask` directly follows
    /// `n_devices`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.geometry.n_devices));
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&HEADER_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.geometry.n_devices.to_le_bytes());
        buf.extend_from_slice(self.geometry.archive_mask.raw_bytes());
        buf.extend_from_slice(&self.geometry.input_frame_count.to_le_bytes());
        buf.extend_from_slice(&self.geometry.major_sample_count.to_le_bytes());
        buf.push(self.geometry.first_decimation_log2 as u8);
        buf.push(self.geometry.second_decimation_log2 as u8);
        buf.extend_from_slice(&self.geometry.major_block_count.to_le_bytes());
        buf.extend_from_slice(&self.geometry.major_block_size().to_le_bytes());
        buf.extend_from_slice(&self.geometry.dd_total_count().to_le_bytes());
        buf.extend_from_slice(&self.data_start.to_le_bytes());
        buf.extend_from_slice(&self.data_size.to_le_bytes());
        buf.push(self.disk_status.as_u8());
        buf.extend_from_slice(&self.write_buffer.to_le_bytes());
        buf.extend_from_slice(&self.write_backlog.to_le_bytes());
        buf.extend_from_slice(&self.last_duration.to_le_bytes());
        buf.extend_from_slice(&self.current_major_block.to_le_bytes());
        buf.extend_from_slice(&self.block_count.to_le_bytes());
        for block in &self.blocks {
            buf.extend_from_slice(&block.start_sec.to_le_bytes());
            buf.extend_from_slice(&block.stop_sec.to_le_bytes());
            buf.extend_from_slice(&block.start_offset.to_le_bytes());
            buf.extend_from_slice(&block.stop_offset.to_le_bytes());
        }
        buf
    }

    /// Decodes a header previously written by [`Self::encode`], the
    /// counterpart that lets `Archive::open` resume an existing archive
    /// (`current_major_block`, the gap-record stack, `write_backlog`, ...)
    /// instead of fabricating a blank one on every open, mirroring the
    /// original's `process_header()` reading the real on-disk header back
    /// with `memcpy`.
    pub fn decode(bytes: &[u8]) -> Result<Header> {
        let mut r = Reader::new(bytes);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(Error::HeaderInvalid {
                reason: format!("archive header magic 0x{:08x} does not match", magic),
            });
        }
        let version = r.u32()?;
        if version != HEADER_FORMAT_VERSION {
            return Err(Error::HeaderInvalid {
                reason: format!("unsupported archive header version {}", version),
            });
        }
        let n_devices = r.u32()?;
        let mask_len = ((n_devices + 7) / 8) as usize;
        let archive_mask = FilterMask::from_raw_bytes(n_devices, r.take(mask_len)?);
        let input_frame_count = r.u32()?;
        let major_sample_count = r.u32()?;
        let first_decimation_log2 = u32::from(r.u8()?);
        let second_decimation_log2 = u32::from(r.u8()?);
        let major_block_count = r.u32()?;
        let stored_major_block_size = r.u64()?;
        let stored_dd_total_count = r.u64()?;
        let data_start = r.u64()?;
        let data_size = r.u64()?;
        let disk_status = DiskStatus::from_u8(r.u8()?)?;
        let write_buffer = r.u32()?;
        let write_backlog = r.u32()?;
        let last_duration = r.u32()?;
        let current_major_block = r.u32()?;
        let block_count = r.u32()?;
        let mut blocks = [BlockRecord::default(); MAX_HEADER_BLOCKS];
        for block in &mut blocks {
            block.start_sec = r.u64()?;
            block.stop_sec = r.u64()?;
            block.start_offset = r.i64()?;
            block.stop_offset = r.i64()?;
        }

        let geometry = Geometry {
            n_devices,
            archive_mask,
            input_frame_count,
            major_sample_count,
            first_decimation_log2,
            second_decimation_log2,
            major_block_count,
        };
        if geometry.major_block_size() != stored_major_block_size {
            return Err(Error::HeaderInvalid {
                reason: format!(
                    "stored major_block_size {} does not match geometry-derived size {}",
                    stored_major_block_size,
                    geometry.major_block_size()
                ),
            });
        }
        if geometry.dd_total_count() != stored_dd_total_count {
            return Err(Error::HeaderInvalid {
                reason: format!(
                    "stored dd_total_count {} does not match geometry-derived count {}",
                    stored_dd_total_count,
                    geometry.dd_total_count()
                ),
            });
        }

        Ok(Header {
            geometry,
            data_start,
            data_size,
            disk_status,
            write_buffer,
            write_backlog,
            last_duration,
            current_major_block,
            block_count,
            blocks,
        })
    }
}

/// Bounds-checked little-endian cursor over an encoded header's bytes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Error::HeaderInvalid {
                reason: "archive header is truncated".into(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// The archive header as shared between the transform and disk-writer
/// threads, each of which mutates disjoint fields of it. A whole-struct
/// mutex is simpler than splitting it, at the cost of some contention
/// neither thread's access pattern is hot enough to notice.
pub type SharedHeader = Arc<Mutex<Header>>;

/// One entry per major block: `{ timestamp (us), duration (us), id_zero }`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexEntry {
    pub timestamp: u64,
    pub duration: u32,
    pub id_zero: i32,
}

pub use crate::index::Index;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_geometry() -> Geometry {
        let mut mask = FilterMask::new(12);
        mask.set(1);
        mask.set(4);
        mask.set(11);
        Geometry {
            n_devices: 12,
            archive_mask: mask,
            input_frame_count: 1,
            major_sample_count: 64,
            first_decimation_log2: 2,
            second_decimation_log2: 3,
            major_block_count: 4,
        }
    }

    #[test]
    fn encode_decode_round_trips_a_fresh_header() {
        let header = Header::new(sample_geometry(), 4096);
        let bytes = header.encode();
        assert_eq!(bytes.len(), Header::encoded_len(header.geometry.n_devices));

        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded.geometry.n_devices, header.geometry.n_devices);
        assert_eq!(decoded.geometry.archive_mask, header.geometry.archive_mask);
        assert_eq!(decoded.geometry.input_frame_count, header.geometry.input_frame_count);
        assert_eq!(decoded.geometry.major_sample_count, header.geometry.major_sample_count);
        assert_eq!(
            decoded.geometry.first_decimation_log2,
            header.geometry.first_decimation_log2
        );
        assert_eq!(
            decoded.geometry.second_decimation_log2,
            header.geometry.second_decimation_log2
        );
        assert_eq!(decoded.geometry.major_block_count, header.geometry.major_block_count);
        assert_eq!(decoded.data_start, header.data_start);
        assert_eq!(decoded.data_size, header.data_size);
        assert_eq!(decoded.disk_status, header.disk_status);
        assert_eq!(decoded.block_count, header.block_count);
    }

    #[test]
    fn encode_decode_round_trips_mutated_runtime_fields() {
        let mut header = Header::new(sample_geometry(), 4096);
        header.disk_status = DiskStatus::Writing;
        header.write_buffer = 7;
        header.write_backlog = 3;
        header.last_duration = 12_345;
        header.current_major_block = 2;
        header.block_count = 2;
        header.blocks[0] = BlockRecord {
            start_sec: 10,
            stop_sec: 20,
            start_offset: 4096,
            stop_offset: 8192,
        };
        header.blocks[1] = BlockRecord {
            start_sec: 1,
            stop_sec: 9,
            start_offset: 0,
            stop_offset: 4096,
        };

        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded.disk_status, DiskStatus::Writing);
        assert_eq!(decoded.write_buffer, 7);
        assert_eq!(decoded.write_backlog, 3);
        assert_eq!(decoded.last_duration, 12_345);
        assert_eq!(decoded.current_major_block, 2);
        assert_eq!(decoded.block_count, 2);
        assert_eq!(decoded.blocks[0], header.blocks[0]);
        assert_eq!(decoded.blocks[1], header.blocks[1]);
    }

    #[test]
    fn archive_mask_is_the_fourth_encoded_field() {
        // SPEC_FULL.md's layout puts archive_mask directly after n_devices:
        // magic(4) + version(4) + n_devices(4), then the mask bytes.
        let header = Header::new(sample_geometry(), 4096);
        let bytes = header.encode();
        let mask_len = ((header.geometry.n_devices + 7) / 8) as usize;
        assert_eq!(&bytes[12..12 + mask_len], header.geometry.archive_mask.raw_bytes());
    }

    #[test]
    fn decode_rejects_wrong_magic() {
        let header = Header::new(sample_geometry(), 4096);
        let mut bytes = header.encode();
        bytes[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert!(matches!(Header::decode(&bytes), Err(Error::HeaderInvalid { .. })));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let header = Header::new(sample_geometry(), 4096);
        let bytes = header.encode();
        assert!(matches!(
            Header::decode(&bytes[..bytes.len() - 1]),
            Err(Error::HeaderInvalid { .. })
        ));
    }
}
