//! Error types for the CP/M personality.
//!
//! Guest-visible failures (file not found, end of file, disk full) are never
//! errors here; they travel back to the guest in register A. `CpmError`
//! covers the fatal shim conditions and host I/O failures only.

use thiserror::Error;

/// Fatal conditions raised by the emulation shim.
#[derive(Error, Debug)]
pub enum CpmError {
    /// The cr/ex/s2 bytes of an FCB do not encode a valid record position.
    #[error("invalid record position in FCB (cr={cr}, ex={ex}, s2={s2})")]
    InvalidRecordPosition { cr: u8, ex: u8, s2: u8 },

    /// A record number too large to encode into cr/ex/s2.
    #[error("record number {0} out of range")]
    RecordOutOfRange(u32),

    /// The fd bytes of an FCB fail the signature check.
    #[error("invalid file handle signature in FCB at {0:#06X}")]
    InvalidFd(u16),

    /// Read, write or close through an FCB that was never opened.
    #[error("FCB at {0:#06X} is not open")]
    FcbNotOpen(u16),

    /// An FCB carries a handle with no live host file behind it.
    #[error("stale file handle {0}")]
    StaleHandle(u16),

    /// Control reached the CBIOS region off a jump-table boundary.
    #[error("CBIOS entry at {0:#06X} is not on a jump-table boundary")]
    CbiosEntry(u16),

    /// An FCB referenced a drive with no host directory behind it.
    #[error("drive {}: is not mounted", drive_letter(.0))]
    DriveNotMounted(u8),

    /// Drive index outside A..P.
    #[error("invalid drive index {0}")]
    InvalidDrive(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn drive_letter(index: &u8) -> char {
    (b'A' + (*index).min(15)) as char
}

/// Result type for shim operations.
pub type CpmResult<T> = Result<T, CpmError>;
