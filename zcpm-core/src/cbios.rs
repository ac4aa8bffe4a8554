//! CBIOS jump-table decoding.
//!
//! The guest reaches the BIOS through a table of 17 three-byte entries at a
//! fixed base address. Each slot holds a `RET`; the scheduler intercepts the
//! program counter before that `RET` runs and dispatches by slot index.

use crate::bdos::addr;
use crate::error::{CpmError, CpmResult};

/// Number of entries in the CP/M 2.2 jump table.
pub const ENTRY_COUNT: u16 = 17;

/// The 17 CBIOS entry points, in jump-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbiosFunction {
    Boot,
    WBoot,
    Const,
    ConIn,
    ConOut,
    List,
    Punch,
    Reader,
    Home,
    SelDsk,
    SetTrk,
    SetSec,
    SetDma,
    Read,
    Write,
    ListSt,
    SecTran,
}

impl CbiosFunction {
    /// Decode a program counter inside the CBIOS region.
    ///
    /// A PC off a three-byte boundary means the guest jumped into the middle
    /// of the table, which is fatal. A PC past the table decodes to `None`
    /// and is treated like any other unsupported entry.
    pub fn from_pc(pc: u16) -> CpmResult<Option<Self>> {
        use CbiosFunction::*;

        let offset = pc - addr::CBIOS;
        if offset % 3 != 0 {
            return Err(CpmError::CbiosEntry(pc));
        }
        let table = [
            Boot, WBoot, Const, ConIn, ConOut, List, Punch, Reader, Home, SelDsk, SetTrk,
            SetSec, SetDma, Read, Write, ListSt, SecTran,
        ];
        Ok(table.get((offset / 3) as usize).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_table_slots() {
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS).unwrap(),
            Some(CbiosFunction::Boot)
        );
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS + 3).unwrap(),
            Some(CbiosFunction::WBoot)
        );
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS + 12).unwrap(),
            Some(CbiosFunction::ConOut)
        );
        assert_eq!(
            CbiosFunction::from_pc(addr::CBIOS + 48).unwrap(),
            Some(CbiosFunction::SecTran)
        );
    }

    #[test]
    fn past_the_table_is_unsupported_not_fatal() {
        assert_eq!(CbiosFunction::from_pc(addr::CBIOS + 51).unwrap(), None);
    }

    #[test]
    fn misaligned_entry_is_fatal() {
        assert!(CbiosFunction::from_pc(addr::CBIOS + 1).is_err());
        assert!(CbiosFunction::from_pc(addr::CBIOS + 5).is_err());
    }
}
