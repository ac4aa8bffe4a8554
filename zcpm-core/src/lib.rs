//! CP/M 2.2 personality for Z80 guests on a POSIX-like host.
//!
//! This crate makes unmodified CP/M `.COM` binaries run against a host
//! directory and terminal. The Z80 itself comes from the `z80emu` crate;
//! everything CP/M (the 64 KiB address-space layout, BDOS call
//! interception, the CBIOS jump table, FCB-backed file I/O and the
//! cooperative step loop) lives here.
//!
//! # Architecture
//!
//! - [`Cpm`]: the machine: guest memory, drive map, open-file table and
//!   the scheduler that interleaves CPU steps with dispatch.
//! - [`Console`]: character I/O seam; the blocking reader is how guest
//!   console input suspends the machine.
//! - [`DriveMap`]: CP/M drives backed by host directories.
//! - [`bdos::Fcb`]: zero-copy typed view over a guest File Control Block.

pub mod bdos;
pub mod cbios;
pub mod console;
pub mod drives;
pub mod emulator;
pub mod error;
pub mod sink;

pub use console::{Console, ScriptedConsole};
pub use drives::DriveMap;
pub use emulator::Cpm;
pub use error::{CpmError, CpmResult};
pub use sink::{file_sink, null_sink, ByteSink};

/// Why the guest stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The guest returned to the warm-boot vector (jump to 0, BDOS 0 or
    /// CBIOS BOOT/WBOOT). The normal way out.
    WarmBoot,
    /// The CPU executed HALT.
    Halt,
}

/// Final state of a finished run.
#[derive(Debug, Clone)]
pub struct CpmExitInfo {
    pub reason: ExitReason,
    /// T-states consumed over the whole run.
    pub t_states: u64,
    /// Program counter at exit.
    pub pc: u16,
}
