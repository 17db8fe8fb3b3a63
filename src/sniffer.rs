//! Sniffer adapter contract and the sniffer thread: retries a flaky device,
//! reports gaps to the transform engine, and optionally runs at elevated
//! real-time priority.
//!
//! A device is modeled as a `SnifferAdapter` trait object rather than a
//! fixed function, so a read-only deployment can plug in [`EmptyAdapter`].
//! The sniffer thread is a plain `std::thread` joined against a shutdown
//! channel rather than a cancellable pthread.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use crate::error::Result;
use crate::esrf::Preprocessor;
use crate::ring_buffer::{try_push, Frame};

/// Outcome of a `status` query. `ok` is the overall success flag; the
/// remaining fields are only meaningful when it is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnifferStatus {
    pub ok: bool,
    pub status: u32,
    pub partner: u32,
    pub last_interrupt: u32,
    pub frame_errors: u32,
    pub soft_errors: u32,
    pub hard_errors: u32,
    pub running: u32,
    pub overrun: u32,
}

/// External collaborator contract for a source of FA frames.
pub trait SnifferAdapter: Send {
    /// Blocking read of one block of raw frames into `buf`, returning the
    /// timestamp (microseconds) of the first row. An `Err` reports the
    /// device failed to deliver a block.
    fn read(&mut self, buf: &mut [u8]) -> Result<u64>;

    fn status(&self) -> SnifferStatus;

    /// Reopens or restarts the underlying device after a read failure.
    fn reset(&mut self) -> Result<()>;

    fn interrupt(&mut self) -> Result<()>;

    fn entry_count(&self) -> u32;

    fn set_entry_count(&mut self, n: u32) -> Result<()>;
}

/// Never delivers data; `read` always fails. Lets an archive run read-only
/// for test replay or for a device-less deployment.
pub struct EmptyAdapter {
    entry_count: u32,
}

impl EmptyAdapter {
    pub fn new(entry_count: u32) -> Self {
        EmptyAdapter { entry_count }
    }
}

impl SnifferAdapter for EmptyAdapter {
    fn read(&mut self, _buf: &mut [u8]) -> Result<u64> {
        Err(crate::error::Error::SnifferRead {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "empty sniffer adapter"),
        })
    }

    fn status(&self) -> SnifferStatus {
        SnifferStatus::default()
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }

    fn entry_count(&self) -> u32 {
        self.entry_count
    }

    fn set_entry_count(&mut self, n: u32) -> Result<()> {
        self.entry_count = n;
        Ok(())
    }
}

/// Runs the retry loop: read until failure, report the failure once (not on
/// every retry), sleep a second, reset, and try again. Exits once `shutdown`
/// has a pending message, which `terminate_sniffer` sends after the
/// in-flight block completes.
pub fn run(
    mut adapter: Box<dyn SnifferAdapter>,
    block_size: usize,
    mut preprocessor: Option<Box<dyn Preprocessor>>,
    tx: Sender<Frame>,
    shutdown: Receiver<()>,
) {
    'outer: loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        let mut in_gap = false;
        loop {
            if shutdown.try_recv().is_ok() {
                break 'outer;
            }

            let mut buf = vec![0u8; block_size];
            match adapter.read(&mut buf) {
                Ok(timestamp) => {
                    if let Some(pre) = preprocessor.as_deref_mut() {
                        pre.process(&mut buf);
                    }
                    if !try_push(&tx, Some((buf, timestamp))) {
                        warn!("Disk writer has fallen behind, dropping sniffer data");
                    }
                    if in_gap {
                        info!("Block read successfully");
                        in_gap = false;
                    }
                }
                Err(_) => {
                    let _ = try_push(&tx, None);
                    if !in_gap {
                        let status = adapter.status();
                        if status.ok {
                            warn!(
                                "Unable to read block: {}, {}, 0x{:x}, {}, {}, {}, {}, {}",
                                status.status,
                                status.partner,
                                status.last_interrupt,
                                status.frame_errors,
                                status.soft_errors,
                                status.hard_errors,
                                status.running,
                                status.overrun
                            );
                        } else {
                            warn!("Unable to read block");
                        }
                        in_gap = true;
                    }
                    break;
                }
            }
        }

        thread::sleep(Duration::from_secs(1));
        if let Err(e) = adapter.reset() {
            debug!("sniffer reset failed: {}", e);
        }
    }
}

/// Handle to the running sniffer thread: `terminate` signals shutdown and
/// joins, mirroring `terminate_sniffer`'s cancel-then-join pair.
pub struct SnifferHandle {
    shutdown_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl SnifferHandle {
    /// Spawns the sniffer thread. If `boost_priority`, attempts to switch the
    /// new thread to `SCHED_FIFO` at priority 1, matching
    /// `start_sniffer(true)`'s `pthread_attr_setschedpolicy` dance; failure
    /// to elevate is logged, not fatal, since an unprivileged archiver should
    /// still run, just without the real-time guarantee.
    pub fn spawn(
        adapter: Box<dyn SnifferAdapter>,
        block_size: usize,
        preprocessor: Option<Box<dyn Preprocessor>>,
        tx: Sender<Frame>,
        boost_priority: bool,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let join = thread::spawn(move || {
            if boost_priority {
                boost_thread_priority();
            }
            run(adapter, block_size, preprocessor, tx, shutdown_rx);
        });
        SnifferHandle {
            shutdown_tx,
            join: Some(join),
        }
    }

    pub fn terminate(&mut self) {
        info!("Waiting for sniffer...");
        let _ = self.shutdown_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        info!("done");
    }
}

impl Drop for SnifferHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.terminate();
        }
    }
}

/// Requests `SCHED_FIFO` scheduling for the calling thread at the lowest
/// real-time priority, a raw-libc fallback for a syscall with no ergonomic
/// wrapper in this crate's `nix` version.
fn boost_thread_priority() {
    unsafe {
        let param = libc::sched_param { sched_priority: 1 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            warn!(
                "Priority boosting requires real time thread support: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyAdapter {
        reads_before_failure: u32,
        calls: Arc<AtomicU32>,
        resets: Arc<AtomicU32>,
    }

    impl SnifferAdapter for FlakyAdapter {
        fn read(&mut self, buf: &mut [u8]) -> Result<u64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.reads_before_failure {
                buf[0] = call as u8;
                Ok(1000 + u64::from(call))
            } else {
                Err(crate::error::Error::SnifferRead {
                    inner: std::io::Error::new(std::io::ErrorKind::Other, "simulated failure"),
                })
            }
        }

        fn status(&self) -> SnifferStatus {
            SnifferStatus::default()
        }

        fn reset(&mut self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn interrupt(&mut self) -> Result<()> {
            Ok(())
        }

        fn entry_count(&self) -> u32 {
            4
        }

        fn set_entry_count(&mut self, _n: u32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn empty_adapter_always_fails_read() {
        let mut adapter = EmptyAdapter::new(256);
        let mut buf = [0u8; 8];
        assert!(adapter.read(&mut buf).is_err());
        assert_eq!(adapter.entry_count(), 256);
    }

    #[test]
    fn good_blocks_are_forwarded_then_gap_reported_on_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let resets = Arc::new(AtomicU32::new(0));
        let adapter = FlakyAdapter {
            reads_before_failure: 2,
            calls: calls.clone(),
            resets: resets.clone(),
        };
        let (tx, rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let handle = thread::spawn(move || {
            run(Box::new(adapter), 8, None, tx, shutdown_rx);
        });

        let (first, first_ts) = rx.recv().unwrap().unwrap();
        assert_eq!(first, vec![0u8; 8]);
        assert_eq!(first_ts, 1000);
        let (mut second, second_ts) = rx.recv().unwrap().unwrap();
        second[0] = 0;
        assert_eq!(second, vec![0u8; 8]);
        assert_eq!(second_ts, 1001);
        assert_eq!(rx.recv().unwrap(), None);

        shutdown_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(resets.load(Ordering::SeqCst) >= 1);
    }
}
