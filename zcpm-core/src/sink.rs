//! Write-only byte sinks for the printer and the emulator log.
//!
//! Both are plain `Write` trait objects; a disabled sink is `io::sink()`,
//! so call sites never branch on whether output is wanted.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// A printer or log destination.
pub type ByteSink = Box<dyn Write + Send>;

/// A sink that swallows everything.
pub fn null_sink() -> ByteSink {
    Box::new(io::sink())
}

/// A sink backed by a freshly created host file.
pub fn file_sink(path: impl AsRef<Path>) -> io::Result<ByteSink> {
    Ok(Box::new(File::create(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_writes() {
        let mut sink = null_sink();
        sink.write_all(b"discarded").unwrap();
        sink.flush().unwrap();
    }
}
