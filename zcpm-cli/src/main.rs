//! zcpm: run CP/M 2.2 programs against a host directory.
//!
//! Usage:
//!   zcpm --drive <DIR> <PROGRAM.COM> [args...]
//!
//! Examples:
//!   zcpm --drive ./disk ZORK1.COM          # mount ./disk as A:, run Zork
//!   zcpm --drive ./disk MBASIC.COM DEMO    # pass a command tail
//!   RUST_LOG=trace zcpm --drive ./disk WS.COM   # with BDOS call tracing

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::sync::mpsc as tokio_mpsc;

use zcpm_core::{file_sink, null_sink, Console, Cpm};

/// Run CP/M 2.2 programs against a host directory.
#[derive(Parser, Debug)]
#[command(name = "zcpm")]
#[command(about = "Run CP/M 2.2 programs against a host directory")]
struct Args {
    /// Host directory mounted as drive A:
    #[arg(long, value_name = "DIR")]
    drive: PathBuf,

    /// CP/M executable (.COM image)
    program: PathBuf,

    /// Command tail handed to the program
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Stream per-instruction disassembly into the log sink
    #[arg(long)]
    dump_asm: bool,

    /// Write the emulator log to cpm.log in the working directory
    #[arg(long)]
    log: bool,

    /// Write LIST output to cpm.prn in the working directory
    #[arg(long)]
    printer: bool,
}

/// Console wired to the terminal: output goes straight to stdout, keys
/// arrive over a channel from the raw-mode reader task. A blocking read
/// parks the emulator thread on the channel until a key shows up.
struct TerminalConsole {
    key_rx: mpsc::Receiver<u8>,
    pending: VecDeque<u8>,
}

impl TerminalConsole {
    fn new(key_rx: mpsc::Receiver<u8>) -> Self {
        Self {
            key_rx,
            pending: VecDeque::new(),
        }
    }

    fn drain(&mut self) {
        while let Ok(ch) = self.key_rx.try_recv() {
            self.pending.push_back(ch);
        }
    }
}

impl Console for TerminalConsole {
    fn put_char(&mut self, ch: u8) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();

        match ch {
            0x0D => {
                let _ = handle.write_all(b"\r");
            }
            0x0A => {
                let _ = handle.write_all(b"\n");
            }
            0x08 => {
                let _ = handle.write_all(b"\x08 \x08");
            }
            0x07 => {
                let _ = handle.write_all(b"\x07");
            }
            _ => {
                let _ = handle.write_all(&[ch]);
            }
        }
        let _ = handle.flush();
    }

    fn key_ready(&mut self) -> bool {
        self.drain();
        !self.pending.is_empty()
    }

    fn try_key(&mut self) -> Option<u8> {
        self.drain();
        self.pending.pop_front()
    }

    fn read_key(&mut self) -> u8 {
        if let Some(ch) = self.pending.pop_front() {
            return ch;
        }
        // Suspend here until the reader task delivers a key. A closed
        // channel means the process is going down; NUL keeps the guest
        // from spinning on garbage.
        self.key_rx.recv().unwrap_or(0)
    }
}

/// Translate a crossterm key event to a CP/M codepoint.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<u8> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                return Some(upper as u8 - 64); // Ctrl+A = 1, Ctrl+C = 3, etc.
            }
        }
    }

    match code {
        KeyCode::Char(c) if c.is_ascii() => Some(c as u8),
        KeyCode::Enter => Some(13),
        KeyCode::Backspace => Some(8),
        KeyCode::Tab => Some(9),
        KeyCode::Esc => Some(27),
        KeyCode::Up => Some(11),
        KeyCode::Down => Some(10),
        KeyCode::Left => Some(8),
        KeyCode::Right => Some(12),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    // Startup validation happens before the terminal goes raw; failures
    // here are ordinary error exits.
    let image = std::fs::read(&args.program)
        .map_err(|err| format!("cannot read {}: {}", args.program.display(), err))?;
    std::fs::read_dir(&args.drive)
        .map_err(|err| format!("cannot read drive directory {}: {}", args.drive.display(), err))?;

    let printer = if args.printer {
        file_sink("cpm.prn")?
    } else {
        null_sink()
    };
    let log_sink = if args.log {
        file_sink("cpm.log")?
    } else {
        null_sink()
    };

    // Keys flow keyboard task -> emulator thread; Ctrl-C takes the side
    // channel back to main for shutdown.
    let (key_tx, key_rx) = mpsc::channel::<u8>();
    let (ctrlc_tx, mut ctrlc_rx) = tokio_mpsc::channel::<()>(1);
    let (shutdown_tx, mut shutdown_rx) = tokio_mpsc::channel::<()>(1);

    let console = TerminalConsole::new(key_rx);
    let raw_mode_enabled = enable_raw_mode().is_ok();

    let drive_dir = args.drive.clone();
    let tail = args.args.join(" ");
    let dump_asm = args.dump_asm;

    let guest = tokio::task::spawn_blocking(move || {
        let mut cpm = Cpm::new(console);
        cpm.dump_asm = dump_asm;
        cpm.set_printer_sink(printer);
        cpm.set_log_sink(log_sink);
        cpm.mount(0, drive_dir)?;
        cpm.load_com(&image);
        if !tail.is_empty() {
            cpm.set_command_line(&tail);
        }
        cpm.run()
    });

    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    while event::poll(Duration::from_millis(0)).unwrap_or(false) {
                        if let Ok(Event::Key(key)) = event::read() {
                            if key.kind == KeyEventKind::Release {
                                continue;
                            }
                            if let Some(ch) = translate_key(key.code, key.modifiers) {
                                if ch == 0x03 {
                                    let _ = ctrlc_tx.send(()).await;
                                    return;
                                }
                                if key_tx.send(ch).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    });

    let outcome = tokio::select! {
        joined = guest => Some(joined?),
        _ = ctrlc_rx.recv() => None,
    };

    let _ = shutdown_tx.send(()).await;
    let _ = reader.await;

    if raw_mode_enabled {
        let _ = disable_raw_mode();
    }

    match outcome {
        // Ctrl-C: the guest thread may still be parked on the key channel.
        // The sinks write straight through to the host files, so nothing
        // is left to flush.
        None => std::process::exit(0),
        Some(Ok(info)) => {
            log::debug!(
                "guest exited: {:?} after {} T-states (PC={:#06X})",
                info.reason,
                info.t_states,
                info.pc
            );
            Ok(())
        }
        Some(Err(err)) => {
            eprintln!("zcpm: {}", err);
            std::process::exit(1);
        }
    }
}
