//! Channel reader - pattern-delimited records over a child process pipe.
//!
//! Raw output bytes accumulate in a bounded buffer; each read scans the
//! newly arrived region and cuts the buffer at the earliest position where
//! one of the caller's stop patterns matches the whole prefix. Unmatched
//! bytes are retained between calls, and exceeding the buffer bound without
//! a match is an explicit error, never silent truncation.

pub mod process;

use thiserror::Error;

pub use process::{ChildProcess, ProcessError};

/// Upper bound on unmatched bytes held between reads.
pub const BUFFER_CAPACITY: usize = 64 * 1024;

/// Bytes pulled from the pipe per availability check.
const READ_CHUNK: usize = 4096;

/// Errors from the buffered pattern scan.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The accumulated output hit the buffer bound with no pattern match.
    #[error("Channel buffer overflow: {held} bytes held without a match (capacity {capacity})")]
    Overflow { held: usize, capacity: usize },

    /// The output pipe reported end-of-stream: the process is gone.
    #[error("Channel disconnected")]
    Disconnected,

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// A stop pattern tested against growing buffer prefixes.
///
/// Matches are whole-prefix: the pattern must cover every byte up to the
/// scan position. Compiled byte-wise (`(?-u)`) since the stream may split
/// multi-byte sequences anywhere.
pub struct Pattern {
    regex: regex::bytes::Regex,
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = regex::bytes::Regex::new(&format!(r"(?-u)\A(?:{})\z", pattern))?;
        Ok(Self { regex })
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        self.regex.is_match(prefix)
    }
}

/// One pattern-delimited record cut from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Everything up to and including the matched position.
    pub text: String,
    /// Index into the pattern slice that matched.
    pub pattern: usize,
}

/// Growable byte accumulator with a scan cursor.
///
/// Invariant: every byte before the cursor has already been tested against
/// all patterns without a match. The cursor resets to zero whenever a match
/// removes the buffer prefix.
pub struct PatternBuffer {
    buf: Vec<u8>,
    cursor: usize,
    capacity: usize,
}

impl PatternBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            cursor: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Room left before the overflow bound.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append raw bytes; errors when the bound would be exceeded.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.buf.len() + bytes.len() > self.capacity {
            return Err(ChannelError::Overflow {
                held: self.buf.len() + bytes.len(),
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Scan forward from the cursor, testing every pattern against each
    /// prefix. The earliest matching position wins; among patterns matching
    /// at the same position, the one listed first wins. The matched prefix
    /// is removed from the buffer.
    pub fn scan(&mut self, patterns: &[Pattern]) -> Option<Record> {
        for i in self.cursor..self.buf.len() {
            for (index, pattern) in patterns.iter().enumerate() {
                if pattern.matches(&self.buf[..=i]) {
                    let text = String::from_utf8_lossy(&self.buf[..=i]).into_owned();
                    self.buf.drain(..=i);
                    self.cursor = 0;
                    return Some(Record {
                        text,
                        pattern: index,
                    });
                }
            }
        }
        self.cursor = self.buf.len();
        None
    }

    /// Drop all held bytes and reset the cursor.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.cursor = 0;
    }
}

/// Seam between the protocol state machine and the byte channel, so the
/// protocol can be driven by a scripted endpoint in tests.
pub trait Transport {
    fn start(&mut self, command: &str, redirect_io: bool, visible: bool)
        -> Result<(), ProcessError>;
    fn write(&mut self, text: &str) -> bool;
    fn read_record(&mut self, patterns: &[Pattern]) -> Result<Option<Record>, ChannelError>;
    fn stop(&mut self);
    fn process_id(&self) -> Option<u32>;
}

/// Turns a spawned process's raw output stream into discrete,
/// pattern-delimited records.
pub struct ChannelReader {
    proc: ChildProcess,
    buffer: PatternBuffer,
}

impl ChannelReader {
    pub fn new() -> Self {
        Self {
            proc: ChildProcess::new(),
            buffer: PatternBuffer::new(BUFFER_CAPACITY),
        }
    }
}

impl Default for ChannelReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ChannelReader {
    fn start(
        &mut self,
        command: &str,
        redirect_io: bool,
        visible: bool,
    ) -> Result<(), ProcessError> {
        self.proc.start(command, redirect_io, visible)
    }

    fn write(&mut self, text: &str) -> bool {
        self.proc.write(text.as_bytes())
    }

    /// Non-blocking: pulls whatever output is pending (bounded by the
    /// remaining buffer capacity), then scans for the next record. `None`
    /// means no pattern has matched yet; all bytes are retained.
    fn read_record(&mut self, patterns: &[Pattern]) -> Result<Option<Record>, ChannelError> {
        if !self.proc.is_redirected() {
            return Ok(None);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = self.buffer.remaining().min(READ_CHUNK);
        if want > 0 {
            let n = match self.proc.read_available(&mut chunk[..want]) {
                Ok(n) => n,
                Err(ProcessError::Disconnected) => return Err(ChannelError::Disconnected),
                Err(e) => return Err(e.into()),
            };
            if n > 0 {
                self.buffer.extend(&chunk[..n])?;
            }
        }

        if let Some(record) = self.buffer.scan(patterns) {
            return Ok(Some(record));
        }

        if self.buffer.remaining() == 0 {
            return Err(ChannelError::Overflow {
                held: self.buffer.len(),
                capacity: BUFFER_CAPACITY,
            });
        }

        Ok(None)
    }

    fn stop(&mut self) {
        self.proc.stop();
        self.buffer.clear();
    }

    fn process_id(&self) -> Option<u32> {
        self.proc.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<Pattern> {
        vec![
            Pattern::new(r".*\n").unwrap(),
            Pattern::new(r"(?:[0-9]+:)?[0-9]+> ").unwrap(),
        ]
    }

    #[test]
    fn line_then_prompt() {
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"Hello\n0:000> ").unwrap();

        let pats = patterns();
        let first = buffer.scan(&pats).unwrap();
        assert_eq!(first.text, "Hello\n");
        assert_eq!(first.pattern, 0);

        let second = buffer.scan(&pats).unwrap();
        assert_eq!(second.text, "0:000> ");
        assert_eq!(second.pattern, 1);

        assert!(buffer.scan(&pats).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_input_is_retained_across_scans() {
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        let pats = patterns();

        buffer.extend(b"hel").unwrap();
        assert!(buffer.scan(&pats).is_none());
        buffer.extend(b"lo").unwrap();
        assert!(buffer.scan(&pats).is_none());
        buffer.extend(b"\n").unwrap();

        let record = buffer.scan(&pats).unwrap();
        assert_eq!(record.text, "hello\n");
    }

    #[test]
    fn bytes_are_conserved_across_incremental_feeds() {
        let input = b"first line\nsecond\n0:000> partial";
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        let pats = patterns();

        let mut emitted = 0usize;
        for chunk in input.chunks(3) {
            buffer.extend(chunk).unwrap();
            while let Some(record) = buffer.scan(&pats) {
                emitted += record.text.len();
            }
        }

        assert_eq!(emitted + buffer.len(), input.len());
    }

    #[test]
    fn first_listed_pattern_wins_at_equal_positions() {
        // Both patterns match the one-byte prefix "a".
        let pats = vec![Pattern::new("a").unwrap(), Pattern::new("[a-z]").unwrap()];
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"a").unwrap();
        assert_eq!(buffer.scan(&pats).unwrap().pattern, 0);

        // Listed order decides, not declaration complexity.
        let pats = vec![Pattern::new("[a-z]").unwrap(), Pattern::new("a").unwrap()];
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"a").unwrap();
        assert_eq!(buffer.scan(&pats).unwrap().pattern, 0);
    }

    #[test]
    fn earliest_position_wins_over_pattern_order() {
        // The prompt completes at byte 7, before any newline arrives.
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"0:000> db @rip").unwrap();
        let record = buffer.scan(&patterns()).unwrap();
        assert_eq!(record.text, "0:000> ");
        assert_eq!(record.pattern, 1);
    }

    #[test]
    fn overflow_is_an_error_not_truncation() {
        let mut buffer = PatternBuffer::new(8);
        buffer.extend(b"12345678").unwrap();
        assert!(buffer.scan(&patterns()).is_none());
        assert!(matches!(
            buffer.extend(b"9"),
            Err(ChannelError::Overflow { .. })
        ));
        // Held bytes survive the failed extend.
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn prompt_pattern_accepts_both_prompt_forms() {
        let pats = patterns();

        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"12> ").unwrap();
        assert_eq!(buffer.scan(&pats).unwrap().pattern, 1);

        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"1:023> ").unwrap();
        assert_eq!(buffer.scan(&pats).unwrap().pattern, 1);

        // No trailing space yet: not a prompt.
        let mut buffer = PatternBuffer::new(BUFFER_CAPACITY);
        buffer.extend(b"0:000>").unwrap();
        assert!(buffer.scan(&pats).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reader_cuts_records_from_a_live_process() {
        use std::time::{Duration, Instant};

        let mut reader = ChannelReader::new();
        reader.start("echo hello", true, false).unwrap();

        let pats = patterns();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut record = None;
        while Instant::now() < deadline {
            match reader.read_record(&pats) {
                Ok(Some(r)) => {
                    record = Some(r);
                    break;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                Err(ChannelError::Disconnected) => break,
                Err(e) => panic!("unexpected channel error: {}", e),
            }
        }

        let record = record.expect("echo output should become a line record");
        assert_eq!(record.text, "hello\n");
        assert_eq!(record.pattern, 0);
        reader.stop();
    }

    #[test]
    fn unstarted_reader_is_inert() {
        let mut reader = ChannelReader::new();
        assert!(!reader.write("g\n"));
        assert!(reader.read_record(&patterns()).unwrap().is_none());
    }
}
