//! Console channel abstraction.
//!
//! The guest sees a character device: one blocking reader, a pending-key
//! queue, and a status probe. Implementations decide where keys come from
//! and where output goes: the CLI blocks the emulator thread on a channel
//! fed by the raw-mode keyboard thread, tests script the traffic in memory.

use std::collections::VecDeque;

/// Character I/O as the BDOS and CBIOS consume it.
///
/// `read_key` may block the calling thread; while it does, no CPU steps run.
/// Implementations must deliver keys in arrival order.
pub trait Console: Send {
    /// Write one character to the console output.
    fn put_char(&mut self, ch: u8);

    /// True when at least one key is queued.
    fn key_ready(&mut self) -> bool;

    /// Dequeue a key without blocking.
    fn try_key(&mut self) -> Option<u8>;

    /// Dequeue a key, blocking until one arrives.
    fn read_key(&mut self) -> u8;
}

/// In-memory console for tests: output is captured, input is scripted.
#[derive(Default)]
pub struct ScriptedConsole {
    output: Vec<u8>,
    keys: VecDeque<u8>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a pre-scripted key sequence.
    pub fn with_keys(keys: &[u8]) -> Self {
        Self {
            output: Vec::new(),
            keys: keys.iter().copied().collect(),
        }
    }

    /// Append keys to the script.
    pub fn queue_keys(&mut self, keys: &[u8]) {
        self.keys.extend(keys.iter().copied());
    }

    /// Everything the guest has written so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Output as a lossy string, for assertions.
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Console for ScriptedConsole {
    fn put_char(&mut self, ch: u8) {
        self.output.push(ch);
    }

    fn key_ready(&mut self) -> bool {
        !self.keys.is_empty()
    }

    fn try_key(&mut self) -> Option<u8> {
        self.keys.pop_front()
    }

    fn read_key(&mut self) -> u8 {
        // A scripted console cannot wait for more input; an exhausted
        // script reads as NUL.
        self.keys.pop_front().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_captured_in_order() {
        let mut console = ScriptedConsole::new();
        console.put_char(b'O');
        console.put_char(b'K');
        assert_eq!(console.output_string(), "OK");
    }

    #[test]
    fn keys_drain_fifo() {
        let mut console = ScriptedConsole::with_keys(b"AB");
        assert!(console.key_ready());
        assert_eq!(console.try_key(), Some(b'A'));
        assert_eq!(console.read_key(), b'B');
        assert!(!console.key_ready());
        assert_eq!(console.try_key(), None);
        assert_eq!(console.read_key(), 0);
    }
}
