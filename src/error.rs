//! Crate-wide error type.
//!
//! Every fallible operation in the archiver funnels into this one `Error`
//! enum so callers only ever need one `match`. Transient I/O failures on the
//! sniffer path are absorbed into gap semantics by the caller rather than
//! propagated here; what reaches `Error` is either a programming-invariant
//! violation turned into a typed result, or something a caller genuinely
//! needs to react to (bad mask text, a lookup past the end of the archive).

use std::io;

use crate::mask::MaskError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "{}", inner)]
    Mask { inner: MaskError },

    #[fail(display = "failed to mmap the archive header: {}", inner)]
    Mmap { inner: io::Error },

    #[fail(display = "failed to lock the archive header: {}", inner)]
    HeaderLock { inner: nix::Error },

    #[fail(display = "archive header failed validation: {}", reason)]
    HeaderInvalid { reason: String },

    #[fail(display = "I/O error on the archive file: {}", inner)]
    Io { inner: io::Error },

    #[fail(display = "sniffer read failed: {}", inner)]
    SnifferRead { inner: io::Error },

    #[fail(display = "{}", reason)]
    TimestampLate { reason: &'static str },

    #[fail(display = "requested timestamp falls inside a data gap")]
    TimestampInGap,

    #[fail(display = "write backlog growing quickly: {} blocks queued", backlog)]
    WriterBacklog { backlog: u32 },
}

impl From<MaskError> for Error {
    fn from(inner: MaskError) -> Self {
        Error::Mask { inner }
    }
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::HeaderLock { inner }
    }
}
