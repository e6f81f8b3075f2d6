//! Log sink - shared REPL transcript buffer.
//!
//! The session tick appends every byte read from or written to the REPL;
//! a slower poller (the presentation layer) drains it. Append and drain
//! take the same lock, so a drain returns exactly the text appended since
//! the previous drain and leaves the sink empty.

use std::sync::{Arc, Mutex};

/// Cheaply clonable handle to the shared transcript buffer.
#[derive(Clone, Default)]
pub struct LogSink {
    buffer: Arc<Mutex<String>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw text (REPL output or an echoed command).
    pub fn append(&self, text: &str) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_str(text);
    }

    /// Append a session status message, prefixed so it stands out from the
    /// raw REPL echo.
    pub fn message(&self, text: &str) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_str("marionette: ");
        buffer.push_str(text);
    }

    /// Take everything appended since the last drain.
    pub fn drain_all(&self) -> String {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buffer)
    }
}
