//! Archive: owns the geometry, header, index, and double-decimated table,
//! and exposes the CLI surface a driving program uses to wire the sniffer
//! and disk writer together.
//!
//! The header, index, double-decimated table, buffer pair, and per-thread
//! handles all live as fields of one value, `Archive`, passed explicitly
//! instead of read through static storage. `initialise_disk_writer`,
//! `configure_sniffer`, `start_sniffer`, `terminate_sniffer`, and
//! `terminate_disk_writer` are inherent methods on that value.

use std::convert::TryInto;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::info;

use crate::decimate::DecimatedSample;
use crate::disk::writer::{DiskWriter, WriteRequest};
use crate::disk::{Geometry, Header, Index, SharedHeader};
use crate::error::{Error, Result};
use crate::esrf::Preprocessor;
use crate::mask::FilterMask;
use crate::ring_buffer::{Frame, RingBuffer};
use crate::sniffer::{SnifferAdapter, SnifferHandle};
use crate::transform::{SharedDdArea, SharedIndex, TransformEngine};

/// Archive geometry plus the runtime knobs the CLI surface exposes: construct
/// piecemeal via [`ConfigBuilder`], then validate and freeze into the value
/// the rest of the crate uses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub n_devices: u32,
    pub archive_mask: FilterMask,
    pub input_frame_count: u32,
    pub major_sample_count: u32,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub major_block_count: u32,
    pub write_buffer_depth: u32,
}

impl Config {
    pub fn builder(n_devices: u32) -> ConfigBuilder {
        ConfigBuilder {
            n_devices,
            archive_mask: None,
            input_frame_count: 1,
            major_sample_count: None,
            first_decimation_log2: 0,
            second_decimation_log2: 0,
            major_block_count: 1,
            write_buffer_depth: 64,
        }
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            n_devices: self.n_devices,
            archive_mask: self.archive_mask.clone(),
            input_frame_count: self.input_frame_count,
            major_sample_count: self.major_sample_count,
            first_decimation_log2: self.first_decimation_log2,
            second_decimation_log2: self.second_decimation_log2,
            major_block_count: self.major_block_count,
        }
    }
}

pub struct ConfigBuilder {
    n_devices: u32,
    archive_mask: Option<FilterMask>,
    input_frame_count: u32,
    major_sample_count: Option<u32>,
    first_decimation_log2: u32,
    second_decimation_log2: u32,
    major_block_count: u32,
    write_buffer_depth: u32,
}

impl ConfigBuilder {
    pub fn archive_mask(mut self, mask: FilterMask) -> Self {
        self.archive_mask = Some(mask);
        self
    }

    pub fn input_frame_count(mut self, count: u32) -> Self {
        self.input_frame_count = count;
        self
    }

    pub fn major_sample_count(mut self, count: u32) -> Self {
        self.major_sample_count = Some(count);
        self
    }

    pub fn decimation(mut self, first_log2: u32, second_log2: u32) -> Self {
        self.first_decimation_log2 = first_log2;
        self.second_decimation_log2 = second_log2;
        self
    }

    pub fn major_block_count(mut self, count: u32) -> Self {
        self.major_block_count = count;
        self
    }

    pub fn write_buffer_depth(mut self, depth: u32) -> Self {
        self.write_buffer_depth = depth;
        self
    }

    /// Validates the geometry (archive mask fits `n_devices`, major block
    /// evenly divided by the minor block / decimation window) and freezes
    /// it into a [`Config`]. Geometry never changes after this point, per
    /// the Data Model's "filter mask may only change across full archive
    /// recreation" invariant.
    pub fn build(self) -> Result<Config> {
        let archive_mask = self
            .archive_mask
            .unwrap_or_else(|| FilterMask::new(self.n_devices));
        let major_sample_count = self.major_sample_count.unwrap_or(self.input_frame_count);

        if archive_mask.n() != self.n_devices {
            return Err(Error::HeaderInvalid {
                reason: format!(
                    "archive mask is sized for {} devices, n_devices is {}",
                    archive_mask.n(),
                    self.n_devices
                ),
            });
        }
        let minor_window = self.input_frame_count << self.first_decimation_log2;
        if minor_window == 0 || major_sample_count % minor_window != 0 {
            return Err(Error::HeaderInvalid {
                reason: format!(
                    "major_sample_count {} is not a multiple of input_frame_count << D1 ({})",
                    major_sample_count, minor_window
                ),
            });
        }

        Ok(Config {
            n_devices: self.n_devices,
            archive_mask,
            input_frame_count: self.input_frame_count,
            major_sample_count,
            first_decimation_log2: self.first_decimation_log2,
            second_decimation_log2: self.second_decimation_log2,
            major_block_count: self.major_block_count,
            write_buffer_depth: self.write_buffer_depth,
        })
    }
}

/// Owns every piece of archive state formerly held in file-scope globals,
/// and the running sniffer/writer threads once started.
pub struct Archive {
    geometry: Geometry,
    header: SharedHeader,
    index: SharedIndex,
    dd_area: SharedDdArea,

    frame_tx: Option<Sender<Frame>>,
    frame_rx: Option<Receiver<Frame>>,
    write_tx: Option<Sender<WriteRequest>>,
    write_rx: Option<Receiver<WriteRequest>>,

    sniffer: Option<SnifferHandle>,
    writer_thread: Option<JoinHandle<()>>,
    transform_thread: Option<JoinHandle<()>>,
}

impl Archive {
    /// Opens `path`, validates its header against `config`'s geometry, and
    /// builds the in-memory index and DD table the archive needs before any
    /// thread starts.
    pub fn open(path: &str, config: &Config) -> Result<Self> {
        let geometry = config.geometry();

        let mut file = OpenOptions::new().read(true).open(path)?;
        let file_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let header_len = Header::encoded_len(geometry.n_devices);
        if file_size < header_len as u64 {
            return Err(Error::HeaderInvalid {
                reason: format!(
                    "archive file is {} bytes, too small to hold a {}-byte header",
                    file_size, header_len
                ),
            });
        }
        let mut header_bytes = vec![0u8; header_len];
        file.read_exact(&mut header_bytes)?;
        let header = Header::decode(&header_bytes)?;

        if header.geometry.n_devices != geometry.n_devices
            || header.geometry.archive_mask != geometry.archive_mask
            || header.geometry.input_frame_count != geometry.input_frame_count
            || header.geometry.major_sample_count != geometry.major_sample_count
            || header.geometry.first_decimation_log2 != geometry.first_decimation_log2
            || header.geometry.second_decimation_log2 != geometry.second_decimation_log2
            || header.geometry.major_block_count != geometry.major_block_count
        {
            return Err(Error::HeaderInvalid {
                reason: "on-disk archive geometry does not match the requested configuration".into(),
            });
        }
        header.validate(Some(file_size))?;
        let geometry = header.geometry.clone();

        let index = Index::new(geometry.major_block_count);
        let dd_area =
            vec![DecimatedSample::default(); geometry.dd_total_count() as usize * geometry.k() as usize];

        // The sniffer-to-transform handoff is the bounded ring buffer of
        // §2/§5: a full channel means the consumer side has fallen behind,
        // and the sniffer drops the frame (reported via `try_push`) rather
        // than blocking indefinitely, which is how an overload becomes a
        // gap downstream. The write-request queue to the disk writer is
        // comparatively slack (the writer only has to keep up with one
        // major block per `major_sample_count` minor blocks) so it is left
        // unbounded.
        let frame_ring = RingBuffer::new(config.write_buffer_depth as usize);
        let frame_tx = frame_ring.sender();
        let frame_rx = frame_ring.receiver();
        let (write_tx, write_rx) = unbounded();

        Ok(Archive {
            geometry,
            header: Arc::new(Mutex::new(header)),
            index: Arc::new(Mutex::new(index)),
            dd_area: Arc::new(Mutex::new(dd_area)),
            frame_tx: Some(frame_tx),
            frame_rx: Some(frame_rx),
            write_tx: Some(write_tx),
            write_rx: Some(write_rx),
            sniffer: None,
            writer_thread: None,
            transform_thread: None,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn header(&self) -> SharedHeader {
        self.header.clone()
    }

    pub fn index(&self) -> SharedIndex {
        self.index.clone()
    }

    pub fn dd_area(&self) -> SharedDdArea {
        self.dd_area.clone()
    }

    /// Opens the archive file for direct writes and spawns the writer
    /// thread; also spawns the transform thread, which drains frames from
    /// the sniffer ring buffer. Both threads run until their channel closes
    /// or `terminate_*` signals them.
    pub fn initialise_disk_writer(&mut self, path: &str, write_buffer_depth: u32) -> Result<()> {
        let write_rx = self
            .write_rx
            .take()
            .ok_or_else(|| Error::HeaderInvalid {
                reason: "disk writer already initialised".into(),
            })?;

        let mut writer = DiskWriter::open(path, self.header.clone(), write_buffer_depth)?;
        self.writer_thread = Some(std::thread::spawn(move || {
            if let Err(e) = writer.run(&write_rx) {
                panic!("disk writer failed: {}", e);
            }
        }));

        let frame_rx = self
            .frame_rx
            .take()
            .ok_or_else(|| Error::HeaderInvalid {
                reason: "transform already initialised".into(),
            })?;
        let write_tx = self.write_tx.clone().ok_or_else(|| Error::HeaderInvalid {
            reason: "disk writer already initialised".into(),
        })?;

        let geometry = self.geometry.clone();
        let header = self.header.clone();
        let index = self.index.clone();
        let dd_area = self.dd_area.clone();
        let sample_size = 8usize;
        let frame_bytes = (geometry.n_devices as usize) * sample_size * (geometry.input_frame_count as usize);

        self.transform_thread = Some(std::thread::spawn(move || {
            let mut engine = TransformEngine::new(geometry, header, index, dd_area, write_tx);
            let ring_depth_hint = frame_rx.len() as u32;
            engine.report_backlog(ring_depth_hint);
            for frame in &frame_rx {
                engine.report_backlog(frame_rx.len() as u32);
                match frame {
                    Some((bytes, timestamp)) => {
                        let samples = decode_frame(&bytes, frame_bytes);
                        engine.process_block(Some((&samples, timestamp)));
                    }
                    None => engine.process_block(None),
                }
            }
        }));

        Ok(())
    }

    /// Records the sniffer adapter and optional preprocessor to use once
    /// `start_sniffer` runs; only stashes the context for that later call.
    pub fn configure_sniffer(
        &mut self,
        adapter: Box<dyn SnifferAdapter>,
        preprocessor: Option<Box<dyn Preprocessor>>,
    ) -> Result<PendingSniffer> {
        Ok(PendingSniffer {
            adapter,
            preprocessor,
        })
    }

    pub fn start_sniffer(&mut self, pending: PendingSniffer, boost_priority: bool) -> Result<()> {
        let tx = self.frame_tx.clone().ok_or_else(|| Error::HeaderInvalid {
            reason: "archive already shut down".into(),
        })?;
        let block_size = (self.geometry.n_devices as usize) * 8 * (self.geometry.input_frame_count as usize);
        self.sniffer = Some(SnifferHandle::spawn(
            pending.adapter,
            block_size,
            pending.preprocessor,
            tx,
            boost_priority,
        ));
        Ok(())
    }

    pub fn terminate_sniffer(&mut self) {
        if let Some(mut sniffer) = self.sniffer.take() {
            sniffer.terminate();
        }
    }

    pub fn terminate_disk_writer(&mut self) {
        info!("shutting down writer and transform threads");
        self.frame_tx = None;
        if let Some(join) = self.transform_thread.take() {
            let _ = join.join();
        }
        self.write_tx = None;
        if let Some(join) = self.writer_thread.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        self.terminate_sniffer();
        self.terminate_disk_writer();
    }
}

/// A configured-but-not-yet-running sniffer, returned by
/// `configure_sniffer` and consumed by `start_sniffer`.
pub struct PendingSniffer {
    adapter: Box<dyn SnifferAdapter>,
    preprocessor: Option<Box<dyn Preprocessor>>,
}

fn decode_frame(bytes: &[u8], frame_bytes: usize) -> Vec<crate::decimate::Sample> {
    let count = frame_bytes / 8;
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let at = i * 8;
        let x = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let y = i32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap());
        samples.push(crate::decimate::Sample::new(x, y));
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_builder_rejects_mismatched_mask_size() {
        let mask = FilterMask::new(4);
        let err = Config::builder(8)
            .archive_mask(mask)
            .major_sample_count(4)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::HeaderInvalid { .. }));
    }

    #[test]
    fn config_builder_rejects_non_multiple_major_sample_count() {
        let err = Config::builder(4)
            .input_frame_count(2)
            .decimation(1, 0)
            .major_sample_count(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::HeaderInvalid { .. }));
    }

    #[test]
    fn config_builder_accepts_valid_geometry() {
        let config = Config::builder(4)
            .input_frame_count(1)
            .major_sample_count(4)
            .major_block_count(2)
            .build()
            .unwrap();
        assert_eq!(config.major_sample_count, 4);
        assert_eq!(config.major_block_count, 2);
    }
}
