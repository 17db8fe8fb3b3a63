//! Disk writer: drains finished major blocks onto disk, maintains the
//! gap-record stack, and mirrors the mutable header fields to the mmap'd
//! archive file for readers to see.
//!
//! The header mmap/byte-range-lock/msync sequence is implemented with raw
//! `libc` calls for the handful of syscalls `nix` 0.10 doesn't expose a safe
//! wrapper for.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use nix::errno::Errno;
use errno::errno;

use crate::aligned::AlignedBlock;
use crate::disk::{BlockRecord, DiskStatus, SharedHeader, MAX_HEADER_BLOCKS};
use crate::error::{Error, Result};

/// A filled major block ready to be appended, or a gap marker emitted by the
/// transform engine when the sniffer produced nothing for a slot.
pub enum WriteRequest {
    /// A filled major block plus the ring buffer depth observed when it was
    /// taken, so the writer can track `write_backlog` for the header. The
    /// buffer is page-aligned ([`AlignedBlock`]), as O_DIRECT requires.
    Block { data: AlignedBlock, backlog: u32 },
    Gap,
}

pub struct DiskWriter {
    file: std::fs::File,
    header_mmap: *mut u8,
    header_len: usize,
    data_start: u64,
    data_size: u64,
    write_offset: u64,
    old_write_offset: u64,
    max_backlog: u32,
    header: SharedHeader,
}

// `header_mmap` is a page backed by the kernel and shared only with other
// processes via the file; `DiskWriter` itself is driven from a single
// thread, so handing the whole struct to that thread is sound.
unsafe impl Send for DiskWriter {}

impl DiskWriter {
    /// Opens `path` for direct, positioned writes and maps the header region
    /// described by `header` for synchronization with readers. `header` is
    /// shared with the transform engine, which owns `current_major_block`,
    /// the index, and `last_duration`.
    pub fn open(path: &str, header: SharedHeader, write_buffer: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;

        let (header_len, data_start, data_size, write_offset) = {
            let mut guard = header.lock().unwrap();
            guard.write_buffer = write_buffer;
            let header_len = guard.encode().len();
            let write_offset = if guard.block_count > 0 {
                guard.blocks[0].stop_offset.max(0) as u64
            } else {
                0
            };
            (header_len, guard.data_start, guard.data_size, write_offset)
        };

        let header_mmap = unsafe {
            let addr = libc::mmap(
                ptr::null_mut(),
                header_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(Error::Mmap {
                    inner: io::Error::from_raw_os_error(errno().0),
                });
            }
            addr as *mut u8
        };

        Ok(DiskWriter {
            data_start,
            data_size,
            file,
            header_mmap,
            header_len,
            write_offset,
            old_write_offset: write_offset,
            max_backlog: 0,
            header,
        })
    }

    /// Runs the writer loop until `requests` closes, consuming one major
    /// block (or gap marker) at a time.
    pub fn run(&mut self, requests: &Receiver<WriteRequest>) -> Result<()> {
        self.start_archive_block();
        info!("disk writer starting at offset {}", self.write_offset);

        for request in requests {
            match request {
                WriteRequest::Block { data, backlog } => {
                    self.update_backlog(backlog);
                    self.write_block(&data)?;
                    self.update_header(false)?;
                }
                WriteRequest::Gap => {
                    debug!("gap reported by transform engine, starting new archive block");
                    self.update_header(true)?;
                    self.start_archive_block();
                }
            }
        }
        info!("disk writer shutting down");
        self.close()
    }

    fn write_block(&mut self, block: &[u8]) -> Result<()> {
        self.file.write_at(block, self.data_start + self.write_offset)?;
        self.write_offset += block.len() as u64;
        if self.write_offset >= self.data_size {
            self.write_offset = 0;
        }
        Ok(())
    }

    /// A byte offset has "expired" if it falls in the interval swept since
    /// the last header update, accounting for the circular wraparound of the
    /// write pointer.
    fn expired(&self, offset: i64) -> bool {
        let offset = offset as u64;
        if self.write_offset >= self.old_write_offset {
            self.old_write_offset < offset && offset <= self.write_offset
        } else {
            offset <= self.write_offset || self.old_write_offset < offset
        }
    }

    fn expire_archive_blocks(&mut self) {
        let mut header = self.header.lock().unwrap();
        while header.block_count > 1
            && self.expired(header.blocks[(header.block_count - 1) as usize].stop_offset)
        {
            header.block_count -= 1;
        }

        let oldest = (header.block_count - 1) as usize;
        let old_start = header.blocks[oldest].start_offset;
        if self.expired(old_start) || old_start == self.old_write_offset as i64 {
            header.blocks[oldest].start_offset = self.write_offset as i64;
        }
        self.old_write_offset = self.write_offset;
    }

    /// Pushes a new gap-bounded block record onto the front of the stack,
    /// dropping the oldest entry once [`MAX_HEADER_BLOCKS`] is reached.
    fn start_archive_block(&mut self) {
        let mut header = self.header.lock().unwrap();
        header.blocks.copy_within(0..MAX_HEADER_BLOCKS - 1, 1);
        header.block_count = (header.block_count + 1).min(MAX_HEADER_BLOCKS as u32);

        let now = now_secs();
        header.blocks[0] = BlockRecord {
            start_sec: now,
            stop_sec: now,
            start_offset: self.write_offset as i64,
            stop_offset: -1,
        };
        header.disk_status = DiskStatus::Writing;
    }

    fn update_backlog(&mut self, backlog: u32) {
        if backlog > self.max_backlog {
            if backlog > self.max_backlog * 2 && self.max_backlog > 0 {
                let err = Error::WriterBacklog { backlog };
                warn!("{}", err);
            }
            self.max_backlog = backlog;
        }
    }

    /// Copies the header into the mmap'd region under an advisory
    /// byte-range write lock, then asynchronously flushes it.
    fn write_header(&self) -> Result<()> {
        lock_header(&self.file, self.header_len, true)?;
        let encoded = self.header.lock().unwrap().encode();
        unsafe {
            ptr::copy_nonoverlapping(encoded.as_ptr(), self.header_mmap, encoded.len());
            if libc::msync(
                self.header_mmap as *mut libc::c_void,
                self.header_len,
                libc::MS_ASYNC,
            ) == -1
            {
                return Err(io::Error::from_raw_os_error(errno().0).into());
            }
        }
        lock_header(&self.file, self.header_len, false)?;
        Ok(())
    }

    fn update_header(&mut self, force_write: bool) -> Result<()> {
        self.expire_archive_blocks();
        let now = now_secs();
        let should_write = {
            let mut header = self.header.lock().unwrap();
            let should_write = force_write || now != header.blocks[0].stop_sec;
            if should_write {
                header.write_backlog = self.max_backlog;
                header.blocks[0].stop_sec = now;
                header.blocks[0].stop_offset = self.write_offset as i64;
            }
            should_write
        };
        if should_write {
            self.max_backlog = 0;
            self.write_header()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.header.lock().unwrap().disk_status = DiskStatus::Idle;
        self.update_header(true)
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.header_mmap as *mut libc::c_void, self.header_len);
        }
    }
}

fn lock_header(file: &std::fs::File, len: usize, write: bool) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = if write { libc::F_WRLCK } else { libc::F_UNLCK } as i16;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = 0;
    fl.l_len = len as i64;

    let cmd = if write { libc::F_SETLKW } else { libc::F_SETLK };
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
    if ret == -1 {
        return Err(nix::Error::Sys(Errno::last()).into());
    }
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
