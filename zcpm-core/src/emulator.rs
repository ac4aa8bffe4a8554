//! The CP/M machine: guest memory, BDOS/CBIOS dispatch and the step loop.
//!
//! The scheduler steps the CPU one instruction at a time and watches the
//! program counter. Landing on the BDOS trampoline or inside the CBIOS jump
//! table hands control to the matching dispatcher; both trampolines hold a
//! `RET`, so once the dispatcher returns the very next instruction pops the
//! guest's return address and execution resumes where it called from.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroU16;
use std::path::PathBuf;
use std::thread;

use z80emu::host::TsCounter;
use z80emu::{Clock, Cpu, CpuDebug, Io, Memory, Reg8, StkReg16, Z80NMOS};

use crate::bdos::{addr, BdosFunction, Fcb, DIR_FILLER, EOF_BYTE, RECORD_SIZE};
use crate::cbios::{self, CbiosFunction};
use crate::console::Console;
use crate::drives::DriveMap;
use crate::error::{CpmError, CpmResult};
use crate::sink::{null_sink, ByteSink};
use crate::{CpmExitInfo, ExitReason};

/// Type alias for the T-state clock.
type TsClock = TsCounter<i32>;

/// Instructions executed before yielding to the host scheduler, so the
/// keyboard producer and timers get a chance to run.
const STEP_BATCH: u32 = 100_000;

/// Memory and port bus handed to the CPU for each step.
///
/// Ports are inert: reads return 0, writes vanish. The supported software
/// set talks to the system exclusively through the memory-mapped BDOS and
/// CBIOS vectors.
struct GuestBus<'a> {
    memory: &'a mut [u8; 65536],
}

impl Memory for GuestBus<'_> {
    type Timestamp = i32;

    fn read_debug(&self, addr: u16) -> u8 {
        self.memory[addr as usize]
    }

    fn read_mem(&self, addr: u16, _ts: Self::Timestamp) -> u8 {
        self.memory[addr as usize]
    }

    fn write_mem(&mut self, addr: u16, value: u8, _ts: Self::Timestamp) {
        self.memory[addr as usize] = value;
    }
}

impl Io for GuestBus<'_> {
    type Timestamp = i32;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, _port: u16, _ts: Self::Timestamp) -> (u8, Option<NonZeroU16>) {
        (0, None)
    }

    fn write_io(
        &mut self,
        _port: u16,
        _value: u8,
        _ts: Self::Timestamp,
    ) -> (Option<Self::WrIoBreak>, Option<NonZeroU16>) {
        (None, None)
    }
}

/// The CP/M machine.
pub struct Cpm<C: Console> {
    /// Z80 CPU.
    cpu: Z80NMOS,
    /// T-state counter.
    clock: TsClock,
    /// Guest address space.
    memory: Box<[u8; 65536]>,
    /// Console channel.
    console: C,
    /// Drive letters backed by host directories.
    drives: DriveMap,
    /// Current drive (0 = A:).
    current_drive: u8,
    /// Current user number (0-15).
    user_code: u8,
    /// DMA pointer for record I/O.
    dma: u16,
    /// Snapshot consumed by search-first/search-next.
    dir_entries: VecDeque<String>,
    /// Host files opened on behalf of guest FCBs; slot index + 1 is the
    /// handle stashed in the FCB.
    files: Vec<Option<File>>,
    /// LIST output.
    printer: ByteSink,
    /// Emulator log; receives the disassembly stream when enabled.
    log: ByteSink,
    /// Stream each executed instruction to the log sink.
    pub dump_asm: bool,
}

impl<C: Console> Cpm<C> {
    /// Create a machine with blank memory and the boot pattern installed.
    pub fn new(console: C) -> Self {
        let mut cpm = Self {
            cpu: Z80NMOS::default(),
            clock: TsClock::default(),
            memory: Box::new([0; 65536]),
            console,
            drives: DriveMap::new(),
            current_drive: 0,
            user_code: 0,
            dma: addr::DEFAULT_DMA,
            dir_entries: VecDeque::new(),
            files: Vec::new(),
            printer: null_sink(),
            log: null_sink(),
            dump_asm: false,
        };
        cpm.install_bootstrap();
        cpm
    }

    /// Write the fixed byte patterns of the zero page, the BDOS trampoline
    /// and the CBIOS jump table, and blank the command-line FCBs.
    fn install_bootstrap(&mut self) {
        // JP WBOOT at the warm-boot vector
        let wboot = addr::CBIOS + 3;
        self.memory[0x0000] = 0xC3;
        self.memory[0x0001] = wboot as u8;
        self.memory[0x0002] = (wboot >> 8) as u8;

        // JP BDOS at the system-call vector
        self.memory[addr::BDOS_VECTOR as usize] = 0xC3;
        self.memory[addr::BDOS_VECTOR as usize + 1] = addr::BDOS as u8;
        self.memory[addr::BDOS_VECTOR as usize + 2] = (addr::BDOS >> 8) as u8;

        // RET at the BDOS trampoline and in every jump-table slot; the
        // dispatchers run before these bytes execute.
        self.memory[addr::BDOS as usize] = 0xC9;
        for k in 0..cbios::ENTRY_COUNT {
            self.memory[(addr::CBIOS + 3 * k) as usize] = 0xC9;
        }

        Fcb::at(&mut self.memory, addr::FCB1).blank();
        Fcb::at(&mut self.memory, addr::FCB2).blank();
    }

    /// Mount a host directory as a drive (0 = A:).
    pub fn mount(&mut self, drive: u8, dir: impl Into<PathBuf>) -> CpmResult<()> {
        self.drives.set(drive, dir)
    }

    /// Route LIST output into `sink`.
    pub fn set_printer_sink(&mut self, sink: ByteSink) {
        self.printer = sink;
    }

    /// Route the emulator log (and the disassembly stream) into `sink`.
    pub fn set_log_sink(&mut self, sink: ByteSink) {
        self.log = sink;
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    /// Read-only view of guest memory.
    pub fn memory(&self) -> &[u8; 65536] {
        &self.memory
    }

    /// Load a `.COM` image at the start of the transient program area.
    pub fn load_com(&mut self, data: &[u8]) {
        self.load_at(addr::TPA, data);
    }

    /// Copy raw bytes into guest memory at `address`.
    pub fn load_at(&mut self, address: u16, data: &[u8]) {
        let start = address as usize;
        let end = (start + data.len()).min(self.memory.len());
        self.memory[start..end].copy_from_slice(&data[..end - start]);
    }

    /// Store the command tail the way the CCP would: uppercased text with a
    /// length byte at 0x0080, and the first two tokens parsed into the
    /// command-line FCBs.
    pub fn set_command_line(&mut self, tail: &str) {
        let upper = tail.to_uppercase();
        let bytes = upper.as_bytes();
        let len = bytes.len().min(127);

        self.memory[addr::CMDLINE as usize] = len as u8;
        self.memory[addr::CMDLINE as usize + 1..addr::CMDLINE as usize + 1 + len]
            .copy_from_slice(&bytes[..len]);

        let mut tokens = upper.split_whitespace();
        if let Some(token) = tokens.next() {
            Fcb::at(&mut self.memory, addr::FCB1).parse_filename(token);
        }
        if let Some(token) = tokens.next() {
            Fcb::at(&mut self.memory, addr::FCB2).parse_filename(token);
        }
    }

    /// Run the guest from the transient program area until it exits.
    ///
    /// Returns when the guest reaches the warm-boot vector or halts; fatal
    /// shim conditions and host write failures surface as errors. Console
    /// input may block the calling thread inside a dispatch.
    pub fn run(&mut self) -> CpmResult<CpmExitInfo> {
        self.cpu.reset();
        self.cpu.set_pc(addr::TPA);
        self.cpu.set_sp(addr::BDOS - 2);

        let mut batched = 0u32;
        loop {
            self.step_instruction();

            if self.cpu.is_halt() {
                return Ok(self.finish(ExitReason::Halt));
            }

            let pc = self.cpu.get_pc();
            let exit = match pc {
                addr::BDOS => self.handle_bdos()?,
                pc if pc >= addr::CBIOS => self.handle_cbios()?,
                0x0000 => Some(ExitReason::WarmBoot),
                pc if pc < addr::TPA && pc != addr::BDOS_VECTOR => {
                    log::warn!("guest reached unhandled address {:#06X}", pc);
                    None
                }
                _ => None,
            };
            if let Some(reason) = exit {
                return Ok(self.finish(reason));
            }

            batched += 1;
            if batched == STEP_BATCH {
                batched = 0;
                thread::yield_now();
            }
        }
    }

    /// Execute exactly one instruction, streaming disassembly if enabled.
    fn step_instruction(&mut self) {
        let mut bus = GuestBus {
            memory: &mut *self.memory,
        };
        if self.dump_asm {
            let log = &mut self.log;
            let _ = self.cpu.execute_next(
                &mut bus,
                &mut self.clock,
                Some(|deb: CpuDebug| {
                    let _ = writeln!(log, "{}", deb);
                }),
            );
        } else {
            let _ = self
                .cpu
                .execute_next(&mut bus, &mut self.clock, None::<fn(CpuDebug)>);
        }
    }

    fn finish(&mut self, reason: ExitReason) -> CpmExitInfo {
        self.flush_sinks();
        CpmExitInfo {
            reason,
            t_states: self.clock.as_timestamp() as u64,
            pc: self.cpu.get_pc(),
        }
    }

    fn flush_sinks(&mut self) {
        let _ = self.printer.flush();
        let _ = self.log.flush();
    }

    // ==================== register conventions ====================

    fn set_a(&mut self, v: u8) {
        self.cpu.set_reg(Reg8::A, None, v);
    }

    /// A with L mirror, the console-status and disk-select convention.
    fn set_al(&mut self, v: u8) {
        self.cpu.set_reg(Reg8::A, None, v);
        self.cpu.set_reg(Reg8::L, None, v);
    }

    /// Record-read convention: A mirrored into L, H and B zeroed.
    fn set_read_status(&mut self, v: u8) {
        self.set_al(v);
        self.cpu.set_reg(Reg8::H, None, 0);
        self.cpu.set_reg(Reg8::B, None, 0);
    }

    // ==================== DMA buffer ====================

    fn dma_write(&mut self, buf: &[u8; RECORD_SIZE]) {
        for (i, &b) in buf.iter().enumerate() {
            self.memory[self.dma.wrapping_add(i as u16) as usize] = b;
        }
    }

    fn dma_read(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.memory[self.dma.wrapping_add(i as u16) as usize];
        }
        buf
    }

    // ==================== open-file table ====================

    fn stash_file(&mut self, file: File) -> u16 {
        if let Some(idx) = self.files.iter().position(Option::is_none) {
            self.files[idx] = Some(file);
            (idx + 1) as u16
        } else {
            self.files.push(Some(file));
            self.files.len() as u16
        }
    }

    fn file_at(&mut self, handle: u16, fcb_addr: u16) -> CpmResult<&mut File> {
        if handle == 0 {
            return Err(CpmError::FcbNotOpen(fcb_addr));
        }
        self.files
            .get_mut(handle as usize - 1)
            .and_then(|slot| slot.as_mut())
            .ok_or(CpmError::StaleHandle(handle))
    }

    // ==================== BDOS dispatch ====================

    /// Handle the guest landing on the BDOS trampoline. Returns the exit
    /// reason when the call terminates the guest.
    fn handle_bdos(&mut self) -> CpmResult<Option<ExitReason>> {
        let c = self.cpu.get_reg(Reg8::C, None);
        let e = self.cpu.get_reg(Reg8::E, None);
        let de = self.cpu.get_reg16(StkReg16::DE);

        log::trace!("BDOS {:3} E={:#04X} DE={:#06X}", c, e, de);

        match BdosFunction::try_from(c) {
            Ok(func) => self.dispatch_bdos(func, e, de),
            Err(code) => {
                log::error!("Unhandled BDOS function {} (DE={:#06X})", code, de);
                Ok(None)
            }
        }
    }

    fn dispatch_bdos(
        &mut self,
        func: BdosFunction,
        e: u8,
        de: u16,
    ) -> CpmResult<Option<ExitReason>> {
        use BdosFunction::*;

        match func {
            SystemReset => return Ok(Some(ExitReason::WarmBoot)),

            ConsoleInput => {
                let ch = self.console.read_key();
                self.console.put_char(ch);
                self.set_al(ch);
            }

            ConsoleOutput => self.console.put_char(e),

            ListOutput => {
                if let Err(err) = self.printer.write_all(&[e]) {
                    log::warn!("printer write failed: {}", err);
                }
            }

            DirectConsoleIo => {
                if e == 0xFF {
                    let ch = self.console.try_key().unwrap_or(0);
                    self.set_a(ch);
                } else {
                    self.console.put_char(e);
                }
            }

            PrintString => self.bdos_print_string(de),

            ReadConsoleBuffer => self.bdos_read_line(de),

            ConsoleStatus => {
                let pending = if self.console.key_ready() { 1 } else { 0 };
                self.set_al(pending);
            }

            ReturnVersion => {
                // CP/M 2.2
                self.cpu.set_reg16(StkReg16::HL, 0x0022);
                self.set_a(0x22);
            }

            ResetDiskSystem => {}

            SelectDisk => {
                if self.drives.is_mounted(e) {
                    self.current_drive = e;
                    self.set_al(0x00);
                } else {
                    self.set_al(0xFF);
                }
            }

            ReturnCurrentDisk => self.set_a(self.current_drive),

            SetDmaAddress => self.dma = de,

            ReturnLoginVector => {
                let vector = self.drives.login_vector();
                self.cpu.set_reg16(StkReg16::HL, vector);
                self.set_a(vector as u8);
            }

            UserCode => {
                if e == 0xFF {
                    self.set_a(self.user_code);
                } else {
                    self.user_code = e & 0x0F;
                }
            }

            OpenFile => self.bdos_open(de)?,
            CloseFile => self.bdos_close(de)?,
            SearchFirst => self.bdos_search_first(de)?,
            SearchNext => self.bdos_search_next(),
            DeleteFile => self.bdos_delete(de)?,
            ReadSequential => self.bdos_read_sequential(de)?,
            WriteSequential => self.bdos_write_sequential(de)?,
            MakeFile => self.bdos_make(de)?,
            RenameFile => self.bdos_rename(de)?,
            ReadRandom => self.bdos_read_random(de)?,
            WriteRandom | WriteRandomZeroFill => self.bdos_write_random(de)?,
            ComputeFileSize => self.bdos_file_size(de)?,
            SetRandomRecord => self.bdos_set_random_record(de)?,

            other => {
                log::error!("Unhandled BDOS call {:?} ({})", other, other as u8);
            }
        }

        Ok(None)
    }

    /// BDOS 9: write the `$`-terminated string at DE.
    fn bdos_print_string(&mut self, de: u16) {
        let mut addr = de;
        for _ in 0..self.memory.len() {
            let ch = self.memory[addr as usize];
            if ch == b'$' {
                return;
            }
            self.console.put_char(ch);
            addr = addr.wrapping_add(1);
        }
        log::warn!("unterminated print string at {:#06X}", de);
    }

    /// BDOS 10: buffered line input. DE points at max-length byte, actual
    /// length byte, then the text.
    fn bdos_read_line(&mut self, de: u16) {
        let max = self.memory[de as usize] as usize;
        let mut len = 0usize;

        loop {
            let ch = self.console.read_key();
            match ch {
                0 => break,
                13 | 10 => {
                    self.console.put_char(13);
                    self.console.put_char(10);
                    break;
                }
                8 | 127 => {
                    if len > 0 {
                        len -= 1;
                        self.console.put_char(8);
                        self.console.put_char(b' ');
                        self.console.put_char(8);
                    }
                }
                ch if ch >= 0x20 && len < max => {
                    self.memory[de.wrapping_add(2 + len as u16) as usize] = ch;
                    len += 1;
                    self.console.put_char(ch);
                }
                _ => {}
            }
        }

        self.memory[de.wrapping_add(1) as usize] = len as u8;
    }

    /// BDOS 15: open an existing file read+write, falling back to read-only
    /// when the host denies writing.
    fn bdos_open(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let path = {
            let mut fcb = Fcb::at(&mut self.memory, fcb_addr);
            fcb.clear();
            self.drives
                .resolve_file(fcb.drive(), self.current_drive, &fcb.filename())?
        };

        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|err| {
                if err.kind() == io::ErrorKind::PermissionDenied {
                    OpenOptions::new().read(true).open(&path)
                } else {
                    Err(err)
                }
            });

        match opened {
            Ok(file) => {
                let handle = self.stash_file(file);
                Fcb::at(&mut self.memory, fcb_addr).set_handle(handle);
                self.set_a(0x00);
            }
            Err(err) => {
                log::debug!("open {} failed: {}", path.display(), err);
                self.set_a(0xFF);
            }
        }
        Ok(())
    }

    /// BDOS 16: close. Closing an FCB that was never opened is a guest bug
    /// the shim refuses to paper over.
    fn bdos_close(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let handle = Fcb::at(&mut self.memory, fcb_addr).handle()?;
        if handle == 0 {
            return Err(CpmError::FcbNotOpen(fcb_addr));
        }
        let slot = self
            .files
            .get_mut(handle as usize - 1)
            .ok_or(CpmError::StaleHandle(handle))?;
        slot.take().ok_or(CpmError::StaleHandle(handle))?;

        Fcb::at(&mut self.memory, fcb_addr).clear_handle();
        self.set_a(0x00);
        Ok(())
    }

    /// BDOS 17: snapshot the directory of the resolved drive and yield the
    /// first entry.
    fn bdos_search_first(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let dir = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            self.drives
                .resolve(fcb.drive(), self.current_drive)?
                .to_path_buf()
        };

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(CpmError::Io)? {
            let entry = entry.map_err(CpmError::Io)?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        self.dir_entries = names.into();
        self.bdos_search_next();
        Ok(())
    }

    /// BDOS 18: yield the next snapshot entry into the DMA buffer.
    fn bdos_search_next(&mut self) {
        let Some(name) = self.dir_entries.pop_front() else {
            self.set_a(0xFF);
            return;
        };

        // Directory entry at slot 0 of the DMA record; the other three
        // slots carry the unused-entry sentinel.
        let mut buf = [0u8; RECORD_SIZE];
        buf[32..].fill(DIR_FILLER);
        buf[1..12].fill(b' ');

        let (base, ext) = match name.rfind('.') {
            Some(pos) => (&name[..pos], &name[pos + 1..]),
            None => (name.as_str(), ""),
        };
        for (i, b) in base.bytes().take(8).enumerate() {
            buf[1 + i] = b;
        }
        for (i, b) in ext.bytes().take(3).enumerate() {
            buf[9 + i] = b;
        }

        self.dma_write(&buf);
        self.set_a(0x00);
    }

    /// BDOS 19: delete. Wildcards in the FCB are not matched; the name is
    /// taken literally.
    fn bdos_delete(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let path = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            self.drives
                .resolve_file(fcb.drive(), self.current_drive, &fcb.filename())?
        };

        match fs::remove_file(&path) {
            Ok(()) => self.set_a(0x00),
            Err(err) => {
                log::debug!("delete {} failed: {}", path.display(), err);
                self.set_a(0xFF);
            }
        }
        Ok(())
    }

    /// BDOS 20: read the record at the sequential position into the DMA
    /// buffer, advancing on success.
    fn bdos_read_sequential(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let (handle, record) = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            (fcb.handle()?, fcb.sequential_record()?)
        };

        let mut buf = [EOF_BYTE; RECORD_SIZE];
        let n = {
            let file = self.file_at(handle, fcb_addr)?;
            read_record_at(file, record, &mut buf)?
        };

        if n == 0 {
            self.set_read_status(0x01);
        } else {
            self.dma_write(&buf);
            Fcb::at(&mut self.memory, fcb_addr).set_sequential_record(record + 1)?;
            self.set_read_status(0x00);
        }
        Ok(())
    }

    /// BDOS 21: write the DMA buffer at the sequential position. A host
    /// write failure here is not survivable for the guest's data, so it
    /// ends the run.
    fn bdos_write_sequential(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let (handle, record) = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            (fcb.handle()?, fcb.sequential_record()?)
        };

        let buf = self.dma_read();
        {
            let file = self.file_at(handle, fcb_addr)?;
            write_record_at(file, record, &buf)?;
        }

        Fcb::at(&mut self.memory, fcb_addr).set_sequential_record(record + 1)?;
        self.set_a(0x00);
        Ok(())
    }

    /// BDOS 22: create a file that must not already exist.
    fn bdos_make(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let path = {
            let mut fcb = Fcb::at(&mut self.memory, fcb_addr);
            fcb.clear();
            self.drives
                .resolve_file(fcb.drive(), self.current_drive, &fcb.filename())?
        };

        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                let handle = self.stash_file(file);
                Fcb::at(&mut self.memory, fcb_addr).set_handle(handle);
                self.set_a(0x00);
            }
            Err(err) => {
                log::debug!("make {} failed: {}", path.display(), err);
                self.set_a(0xFF);
            }
        }
        Ok(())
    }

    /// BDOS 23: rename; the target name sits in the second half of the FCB.
    fn bdos_rename(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let (drive, old_name) = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            (fcb.drive(), fcb.filename())
        };
        let new_name = Fcb::at(&mut self.memory, fcb_addr.wrapping_add(16)).filename();

        let old_path = self
            .drives
            .resolve_file(drive, self.current_drive, &old_name)?;
        let new_path = self
            .drives
            .resolve_file(drive, self.current_drive, &new_name)?;

        match fs::rename(&old_path, &new_path) {
            Ok(()) => self.set_a(0x00),
            Err(err) => {
                log::debug!(
                    "rename {} -> {} failed: {}",
                    old_path.display(),
                    new_path.display(),
                    err
                );
                self.set_a(0xFF);
            }
        }
        Ok(())
    }

    /// BDOS 33: read the record named by the random-record field; the
    /// sequential position follows it.
    fn bdos_read_random(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let (handle, record) = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            (fcb.handle()?, fcb.random_record())
        };
        Fcb::at(&mut self.memory, fcb_addr).set_sequential_record(record)?;

        let mut buf = [EOF_BYTE; RECORD_SIZE];
        let n = {
            let file = self.file_at(handle, fcb_addr)?;
            read_record_at(file, record, &mut buf)?
        };

        if n == 0 {
            self.set_read_status(0x01);
        } else {
            self.dma_write(&buf);
            self.set_read_status(0x00);
        }
        Ok(())
    }

    /// BDOS 34: write the DMA buffer at the random-record position. Writing
    /// past end of file extends it; the gap reads back as zeros.
    fn bdos_write_random(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let (handle, record) = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            (fcb.handle()?, fcb.random_record())
        };
        Fcb::at(&mut self.memory, fcb_addr).set_sequential_record(record)?;

        let buf = self.dma_read();
        let written = {
            let file = self.file_at(handle, fcb_addr)?;
            write_record_at(file, record, &buf)
        };

        match written {
            Ok(()) => self.set_a(0x00),
            Err(err) => {
                log::debug!("random write failed: {}", err);
                self.set_a(0x05); // disk full
            }
        }
        Ok(())
    }

    /// BDOS 35: stat the named file and store its size, in records, into
    /// the random-record field.
    fn bdos_file_size(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let path = {
            let fcb = Fcb::at(&mut self.memory, fcb_addr);
            self.drives
                .resolve_file(fcb.drive(), self.current_drive, &fcb.filename())?
        };

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                let records = meta.len().div_ceil(RECORD_SIZE as u64);
                let records = u32::try_from(records).unwrap_or(u32::MAX);
                Fcb::at(&mut self.memory, fcb_addr).set_random_record(records);
                self.set_a(0x00);
            }
            _ => self.set_a(0xFF),
        }
        Ok(())
    }

    /// BDOS 36: derive the random-record field from the sequential position.
    fn bdos_set_random_record(&mut self, fcb_addr: u16) -> CpmResult<()> {
        let mut fcb = Fcb::at(&mut self.memory, fcb_addr);
        let record = fcb.sequential_record()?;
        fcb.set_random_record(record);
        Ok(())
    }

    // ==================== CBIOS dispatch ====================

    /// Handle the guest landing inside the CBIOS jump table.
    fn handle_cbios(&mut self) -> CpmResult<Option<ExitReason>> {
        let pc = self.cpu.get_pc();
        let func = CbiosFunction::from_pc(pc)?;

        log::trace!("CBIOS {:?} at {:#06X}", func, pc);

        match func {
            Some(CbiosFunction::Boot) | Some(CbiosFunction::WBoot) => {
                return Ok(Some(ExitReason::WarmBoot));
            }
            Some(CbiosFunction::Const) => {
                let pending = if self.console.key_ready() { 0xFF } else { 0x00 };
                self.set_a(pending);
            }
            Some(CbiosFunction::ConIn) => {
                let ch = self.console.read_key();
                self.set_a(ch);
            }
            Some(CbiosFunction::ConOut) => {
                let ch = self.cpu.get_reg(Reg8::C, None);
                self.console.put_char(ch);
            }
            Some(other) => log::error!("Unhandled CBIOS entry {:?}", other),
            None => log::error!("Unhandled CBIOS entry at {:#06X}", pc),
        }
        Ok(None)
    }
}

/// Read up to one record at `record * 128`, tolerating short host reads.
fn read_record_at(file: &mut File, record: u32, buf: &mut [u8; RECORD_SIZE]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(record as u64 * RECORD_SIZE as u64))?;
    let mut total = 0;
    while total < RECORD_SIZE {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// Write one full record at `record * 128`.
fn write_record_at(file: &mut File, record: u32, buf: &[u8; RECORD_SIZE]) -> io::Result<()> {
    file.seek(SeekFrom::Start(record as u64 * RECORD_SIZE as u64))?;
    file.write_all(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ScriptedConsole;

    fn machine() -> Cpm<ScriptedConsole> {
        Cpm::new(ScriptedConsole::new())
    }

    #[test]
    fn boot_pattern() {
        let cpm = machine();
        let mem = cpm.memory();

        // warm-boot vector: JP CBIOS+3
        assert_eq!(&mem[0x0000..0x0003], &[0xC3, 0x03, 0xFF]);
        // system-call vector: JP BDOS
        assert_eq!(&mem[0x0005..0x0008], &[0xC3, 0x00, 0xFE]);
        // trampolines
        assert_eq!(mem[0xFE00], 0xC9);
        for k in 0..17 {
            assert_eq!(mem[0xFF00 + 3 * k], 0xC9);
        }
        // blanked command-line FCBs
        for base in [0x005C, 0x006C] {
            assert_eq!(mem[base], 0);
            assert!(mem[base + 1..base + 12].iter().all(|&b| b == b' '));
        }
    }

    #[test]
    fn hello_program() {
        // LD C,2 / LD E,ch / CALL 5 three times, then JP 0.
        let program = [
            0x0E, 0x02, // LD C, 2
            0x1E, b'H', // LD E, 'H'
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x1E, b'i', // LD E, 'i'
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x1E, 0x0A, // LD E, '\n'
            0xCD, 0x05, 0x00, // CALL 0x0005
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let mut cpm = machine();
        cpm.load_com(&program);

        let info = cpm.run().unwrap();
        assert_eq!(info.reason, ExitReason::WarmBoot);
        assert_eq!(cpm.console().output_string(), "Hi\n");
    }

    #[test]
    fn unhandled_bdos_call_leaves_registers_alone() {
        // LD A,0x55 / LD C,99 / CALL 5 / LD (0x0200),A / JP 0
        let program = [
            0x3E, 0x55, // LD A, 0x55
            0x0E, 99, // LD C, 99
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x00, 0x02, // LD (0x0200), A
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let mut cpm = machine();
        cpm.load_com(&program);
        cpm.run().unwrap();

        assert_eq!(cpm.memory()[0x0200], 0x55);
    }

    #[test]
    fn console_status_and_input() {
        // CONST, CONIN (consumes the key), CONST again.
        let program = [
            0x0E, 0x0B, // LD C, 11
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x00, 0x02, // LD (0x0200), A
            0x0E, 0x01, // LD C, 1
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x01, 0x02, // LD (0x0201), A
            0x0E, 0x0B, // LD C, 11
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x02, 0x02, // LD (0x0202), A
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let mut cpm = Cpm::new(ScriptedConsole::with_keys(b"X"));
        cpm.load_com(&program);
        cpm.run().unwrap();

        let mem = cpm.memory();
        assert_eq!(mem[0x0200], 1, "key pending before read");
        assert_eq!(mem[0x0201], b'X');
        assert_eq!(mem[0x0202], 0, "queue drained after read");
        // BDOS 1 echoes.
        assert_eq!(cpm.console().output_string(), "X");
    }

    #[test]
    fn direct_console_io() {
        // Poll with no key, output 'Z', poll again with a key queued.
        let program = [
            0x0E, 0x06, // LD C, 6
            0x1E, 0xFF, // LD E, 0xFF (input poll)
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x00, 0x02, // LD (0x0200), A
            0x0E, 0x06, // LD C, 6
            0x1E, b'Z', // LD E, 'Z' (output)
            0xCD, 0x05, 0x00, // CALL 0x0005
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let mut cpm = machine();
        cpm.load_com(&program);
        cpm.run().unwrap();

        assert_eq!(cpm.memory()[0x0200], 0, "no key queued");
        assert_eq!(cpm.console().output_string(), "Z");
    }

    #[test]
    fn print_string_stops_at_dollar() {
        let program = [
            0x0E, 0x09, // LD C, 9
            0x11, 0x00, 0x02, // LD DE, 0x0200
            0xCD, 0x05, 0x00, // CALL 0x0005
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let mut cpm = machine();
        cpm.load_com(&program);
        cpm.load_at(0x0200, b"READY$IGNORED");
        cpm.run().unwrap();

        assert_eq!(cpm.console().output_string(), "READY");
    }

    #[test]
    fn list_output_reaches_printer_sink() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Capture(Arc<Mutex<Vec<u8>>>);

        impl Write for Capture {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let program = [
            0x0E, 0x05, // LD C, 5
            0x1E, b'P', // LD E, 'P'
            0xCD, 0x05, 0x00, // CALL 0x0005
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let capture = Capture::default();
        let mut cpm = machine();
        cpm.set_printer_sink(Box::new(capture.clone()));
        cpm.load_com(&program);
        cpm.run().unwrap();

        assert_eq!(*capture.0.lock().unwrap(), b"P");
        assert!(cpm.console().output().is_empty());
    }

    #[test]
    fn halt_ends_the_run() {
        let mut cpm = machine();
        cpm.load_com(&[0x76]); // HALT
        let info = cpm.run().unwrap();
        assert_eq!(info.reason, ExitReason::Halt);
    }

    #[test]
    fn select_missing_drive_keeps_current() {
        // SELDSK 7 (unmounted), then GETDRV.
        let program = [
            0x0E, 0x0E, // LD C, 14
            0x1E, 0x07, // LD E, 7
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x00, 0x02, // LD (0x0200), A
            0x0E, 0x19, // LD C, 25
            0xCD, 0x05, 0x00, // CALL 0x0005
            0x32, 0x01, 0x02, // LD (0x0201), A
            0xC3, 0x00, 0x00, // JP 0x0000
        ];

        let mut cpm = machine();
        cpm.load_com(&program);
        cpm.run().unwrap();

        assert_eq!(cpm.memory()[0x0200], 0xFF);
        assert_eq!(cpm.memory()[0x0201], 0x00, "current drive unchanged");
    }
}
