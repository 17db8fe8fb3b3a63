//! Fast Acquisition (FA) beam-position-monitor archiver core.
//!
//! Transposes the hardware sniffer's per-frame sample stream into
//! per-device columns, maintains two levels of decimated statistics and a
//! timestamp index over them, and writes fixed-size major blocks to a
//! circular region of a disk file. See each module for the component it
//! implements; [`archive::Archive`] is the entry point that wires a
//! sniffer, the transform engine, and the disk writer together.

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate serde_derive;

pub mod aligned;
pub mod archive;
pub mod decimate;
pub mod disk;
pub mod error;
pub mod esrf;
pub mod index;
pub mod mask;
pub mod ring_buffer;
pub mod sniffer;
pub mod transform;
pub mod wide;

pub use crate::archive::{Archive, Config};
pub use crate::decimate::{DecimatedSample, DecimationAccumulator, Sample};
pub use crate::disk::{BlockRecord, DiskStatus, Geometry, Header, IndexEntry};
pub use crate::error::{Error, Result};
pub use crate::index::Index;
pub use crate::mask::{FilterMask, MaskError};
pub use crate::sniffer::{EmptyAdapter, SnifferAdapter, SnifferStatus};
