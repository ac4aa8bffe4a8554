//! BDOS (Basic Disk Operating System) call numbering and system layout.
//!
//! The dispatcher itself lives in [`crate::emulator`]; this module holds the
//! CP/M 2.2 function-code enum and the fixed addresses of the guest address
//! space.

pub mod fcb;

pub use fcb::Fcb;

/// CP/M 2.2 BDOS function codes, as passed in register C.
///
/// Every code CP/M 2.2 defines is named here so the dispatcher can log
/// unsupported calls by name; only a subset is actually implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BdosFunction {
    /// 0: warm boot
    SystemReset = 0,
    /// 1: console input with echo (blocking)
    ConsoleInput = 1,
    /// 2: console output
    ConsoleOutput = 2,
    /// 3: reader input
    ReaderInput = 3,
    /// 4: punch output
    PunchOutput = 4,
    /// 5: printer output
    ListOutput = 5,
    /// 6: direct console I/O
    DirectConsoleIo = 6,
    /// 7: get IOBYTE
    GetIoByte = 7,
    /// 8: set IOBYTE
    SetIoByte = 8,
    /// 9: print $-terminated string
    PrintString = 9,
    /// 10: buffered line input
    ReadConsoleBuffer = 10,
    /// 11: console status
    ConsoleStatus = 11,
    /// 12: version number
    ReturnVersion = 12,
    /// 13: reset disk system
    ResetDiskSystem = 13,
    /// 14: select disk
    SelectDisk = 14,
    /// 15: open file
    OpenFile = 15,
    /// 16: close file
    CloseFile = 16,
    /// 17: search for first directory entry
    SearchFirst = 17,
    /// 18: search for next directory entry
    SearchNext = 18,
    /// 19: delete file
    DeleteFile = 19,
    /// 20: read sequential
    ReadSequential = 20,
    /// 21: write sequential
    WriteSequential = 21,
    /// 22: create file
    MakeFile = 22,
    /// 23: rename file
    RenameFile = 23,
    /// 24: login vector
    ReturnLoginVector = 24,
    /// 25: current disk
    ReturnCurrentDisk = 25,
    /// 26: set DMA address
    SetDmaAddress = 26,
    /// 27: allocation vector
    GetAllocationVector = 27,
    /// 28: write-protect disk
    WriteProtectDisk = 28,
    /// 29: read-only vector
    GetReadOnlyVector = 29,
    /// 30: set file attributes
    SetFileAttributes = 30,
    /// 31: disk parameter block
    GetDiskParameters = 31,
    /// 32: get/set user code
    UserCode = 32,
    /// 33: read random
    ReadRandom = 33,
    /// 34: write random
    WriteRandom = 34,
    /// 35: compute file size
    ComputeFileSize = 35,
    /// 36: set random record from sequential position
    SetRandomRecord = 36,
    /// 37: reset drive
    ResetDrive = 37,
    /// 40: write random with zero fill
    WriteRandomZeroFill = 40,
}

impl TryFrom<u8> for BdosFunction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use BdosFunction::*;
        Ok(match value {
            0 => SystemReset,
            1 => ConsoleInput,
            2 => ConsoleOutput,
            3 => ReaderInput,
            4 => PunchOutput,
            5 => ListOutput,
            6 => DirectConsoleIo,
            7 => GetIoByte,
            8 => SetIoByte,
            9 => PrintString,
            10 => ReadConsoleBuffer,
            11 => ConsoleStatus,
            12 => ReturnVersion,
            13 => ResetDiskSystem,
            14 => SelectDisk,
            15 => OpenFile,
            16 => CloseFile,
            17 => SearchFirst,
            18 => SearchNext,
            19 => DeleteFile,
            20 => ReadSequential,
            21 => WriteSequential,
            22 => MakeFile,
            23 => RenameFile,
            24 => ReturnLoginVector,
            25 => ReturnCurrentDisk,
            26 => SetDmaAddress,
            27 => GetAllocationVector,
            28 => WriteProtectDisk,
            29 => GetReadOnlyVector,
            30 => SetFileAttributes,
            31 => GetDiskParameters,
            32 => UserCode,
            33 => ReadRandom,
            34 => WriteRandom,
            35 => ComputeFileSize,
            36 => SetRandomRecord,
            37 => ResetDrive,
            40 => WriteRandomZeroFill,
            _ => return Err(value),
        })
    }
}

/// CP/M record size. All file I/O moves in 128-byte units.
pub const RECORD_SIZE: usize = 128;

/// End-of-text sentinel used to pad short records on read.
pub const EOF_BYTE: u8 = 0x1A;

/// Sentinel byte for unused directory-entry slots in a DMA record.
pub const DIR_FILLER: u8 = 0xE5;

/// Fixed addresses of the guest address space.
pub mod addr {
    /// Transient Program Area, where `.COM` images load.
    pub const TPA: u16 = 0x0100;
    /// The `CALL 0x0005` system-call vector.
    pub const BDOS_VECTOR: u16 = 0x0005;
    /// BDOS trampoline (a single `RET`).
    pub const BDOS: u16 = 0xFE00;
    /// Base of the 17-entry CBIOS jump table.
    pub const CBIOS: u16 = 0xFF00;
    /// Default DMA buffer, doubling as the command tail.
    pub const DEFAULT_DMA: u16 = 0x0080;
    /// First command-line File Control Block.
    pub const FCB1: u16 = 0x005C;
    /// Second command-line File Control Block.
    pub const FCB2: u16 = 0x006C;
    /// Command tail: length byte followed by the argument text.
    pub const CMDLINE: u16 = 0x0080;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_codes_round_trip() {
        for code in (0..=37).chain([40]) {
            let func = BdosFunction::try_from(code).expect("defined code");
            assert_eq!(func as u8, code);
        }
    }

    #[test]
    fn undefined_codes_are_rejected() {
        assert_eq!(BdosFunction::try_from(38), Err(38));
        assert_eq!(BdosFunction::try_from(99), Err(99));
        assert_eq!(BdosFunction::try_from(255), Err(255));
    }
}
