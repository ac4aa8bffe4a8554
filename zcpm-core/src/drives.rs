//! Drive map: CP/M drive letters backed by host directories.
//!
//! Each mounted drive is a plain host directory; CP/M filenames resolve to
//! direct children of it. There is no disk geometry and no directory
//! structure below a drive.

use std::path::{Path, PathBuf};

use crate::error::{CpmError, CpmResult};

/// FCB drive byte meaning "use the current drive" (a `?` placeholder some
/// guests store instead of 0).
const DRIVE_WILD: u8 = 0x3F;

/// Maximum number of drives (A: through P:).
pub const DRIVE_COUNT: usize = 16;

/// Mapping from drive index (0 = A:) to a host directory.
#[derive(Debug, Default)]
pub struct DriveMap {
    dirs: [Option<PathBuf>; DRIVE_COUNT],
}

impl DriveMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a host directory as the given drive.
    pub fn set(&mut self, drive: u8, dir: impl Into<PathBuf>) -> CpmResult<()> {
        let slot = self
            .dirs
            .get_mut(drive as usize)
            .ok_or(CpmError::InvalidDrive(drive))?;
        *slot = Some(dir.into());
        Ok(())
    }

    /// Whether a drive has a directory behind it.
    pub fn is_mounted(&self, drive: u8) -> bool {
        matches!(self.dirs.get(drive as usize), Some(Some(_)))
    }

    /// Bitmap of mounted drives, bit 0 = A:.
    pub fn login_vector(&self) -> u16 {
        self.dirs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_some())
            .fold(0, |v, (i, _)| v | 1 << i)
    }

    /// Map an FCB drive byte to a drive index. 0 and 0x3F select `current`;
    /// anything else is one-based.
    pub fn effective_drive(fcb_drive: u8, current: u8) -> u8 {
        if fcb_drive == 0 || fcb_drive == DRIVE_WILD {
            current
        } else {
            fcb_drive - 1
        }
    }

    /// Resolve an FCB drive byte to the backing host directory.
    pub fn resolve(&self, fcb_drive: u8, current: u8) -> CpmResult<&Path> {
        let drive = Self::effective_drive(fcb_drive, current);
        self.dirs
            .get(drive as usize)
            .ok_or(CpmError::InvalidDrive(drive))?
            .as_deref()
            .ok_or(CpmError::DriveNotMounted(drive))
    }

    /// Resolve an FCB drive byte and join the filename onto it.
    pub fn resolve_file(&self, fcb_drive: u8, current: u8, filename: &str) -> CpmResult<PathBuf> {
        Ok(self.resolve(fcb_drive, current)?.join(filename))
    }
}
