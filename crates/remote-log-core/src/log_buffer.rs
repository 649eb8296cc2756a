//! Bounded, line-aware in-memory log cache.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::config::BufferConfig;

/// Default minimum number of bytes retained after an eviction.
pub const DEFAULT_RETAIN_FLOOR: usize = 200 * 80;

/// Default hard byte ceiling.
pub const DEFAULT_CAPACITY: usize = 300 * 80;

struct Inner {
    contents: Vec<u8>,
    discard_count: u64,
}

/// Line-aware log cache with a hard byte ceiling.
///
/// Writers append continuously; readers drain complete lines from the
/// front. When an append would push the contents past `capacity`, the
/// oldest text is evicted down to roughly `retain_floor` bytes, cut at a
/// line boundary, and the discard counter is bumped once. Overflow is never
/// an error: a reader that sees the discard counter move knows some text
/// was lost since it last looked.
///
/// Every operation holds the buffer's lock for its full duration.
pub struct LogBuffer {
    inner: Mutex<Inner>,
    data_ready: Condvar,
    capacity: usize,
    retain_floor: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RETAIN_FLOOR)
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("LogBuffer")
            .field("capacity", &self.capacity)
            .field("retain_floor", &self.retain_floor)
            .field("size", &inner.contents.len())
            .field("discard_count", &inner.discard_count)
            .finish()
    }
}

const fn is_terminator(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

impl LogBuffer {
    /// Create a buffer with the given ceiling and retain floor.
    ///
    /// A zero floor, or one larger than `capacity`, is replaced by half the
    /// capacity.
    #[must_use]
    pub fn new(capacity: usize, retain_floor: usize) -> Self {
        let capacity = capacity.max(1);
        let retain_floor = if retain_floor == 0 || retain_floor > capacity {
            (capacity / 2).max(1)
        } else {
            retain_floor
        };
        Self {
            inner: Mutex::new(Inner {
                contents: Vec::with_capacity(capacity),
                discard_count: 0,
            }),
            data_ready: Condvar::new(),
            capacity,
            retain_floor,
        }
    }

    /// Create a buffer sized from configuration.
    #[must_use]
    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(config.capacity, config.retain_floor)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation completes before the guard drops, so a poisoned
        // buffer is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hard byte ceiling.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Minimum number of bytes kept after an eviction.
    #[must_use]
    pub const fn retain_floor(&self) -> usize {
        self.retain_floor
    }

    /// Append bytes, evicting old text first if the ceiling would be crossed.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let mut data = data;

        if inner.contents.len() + data.len() > self.capacity {
            if data.len() >= self.retain_floor {
                // Incoming text alone fills the floor: keep only its tail.
                inner.contents.clear();
                data = &data[data.len() - self.retain_floor..];
            } else {
                let len = inner.contents.len();
                let mut keep = self.retain_floor - data.len();
                let mut pos = len - keep;
                while keep > 0 && !is_terminator(inner.contents[pos]) {
                    keep -= 1;
                    pos += 1;
                }
                while keep > 0 && is_terminator(inner.contents[pos]) {
                    keep -= 1;
                    pos += 1;
                }
                inner.contents.drain(..pos);
            }
            inner.discard_count += 1;
        }

        inner.contents.extend_from_slice(data);
        drop(inner);
        self.data_ready.notify_all();
    }

    /// Append a string.
    pub fn append_str(&self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Append a string followed by a newline, as a single append.
    pub fn append_line(&self, s: &str) {
        let mut line = String::with_capacity(s.len() + 1);
        line.push_str(s);
        line.push('\n');
        self.append(line.as_bytes());
    }

    /// Remove and return the first complete line, terminator included.
    ///
    /// Returns `None` until a terminator has arrived; a partial trailing line
    /// is never returned.
    pub fn read_line(&self) -> Option<String> {
        self.take_line(true)
    }

    /// Return the first complete line without removing it.
    #[must_use]
    pub fn peek_line(&self) -> Option<String> {
        self.take_line(false)
    }

    fn take_line(&self, remove: bool) -> Option<String> {
        let mut inner = self.lock();
        let end = line_end(&inner.contents)?;
        let line = String::from_utf8_lossy(&inner.contents[..end]).into_owned();
        if remove {
            inner.contents.drain(..end);
        }
        Some(line)
    }

    /// Remove and return every complete line currently buffered.
    ///
    /// Lines are drained under a single lock acquisition.
    pub fn drain_lines(&self) -> Vec<String> {
        let mut inner = self.lock();
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(end) = line_end(&inner.contents[start..]) {
            lines.push(String::from_utf8_lossy(&inner.contents[start..start + end]).into_owned());
            start += end;
        }
        inner.contents.drain(..start);
        lines
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().contents.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().contents.is_empty()
    }

    /// Number of eviction events since creation or the last reset.
    #[must_use]
    pub fn discard_count(&self) -> u64 {
        self.lock().discard_count
    }

    /// Clear all buffered text and the discard counter.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.contents.clear();
        inner.discard_count = 0;
    }

    /// Block until the buffer holds data or `timeout` elapses.
    ///
    /// Returns `true` if data is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .data_ready
            .wait_timeout_while(inner, timeout, |inner| inner.contents.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !inner.contents.is_empty()
    }
}

/// Offset just past the first line terminator, treating CRLF as one.
fn line_end(bytes: &[u8]) -> Option<usize> {
    let pos = bytes.iter().position(|&b| is_terminator(b))?;
    if bytes[pos] == b'\r' && bytes.get(pos + 1) == Some(&b'\n') {
        Some(pos + 2)
    } else {
        Some(pos + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_read_lines_in_order() {
        let buffer = LogBuffer::new(100, 50);
        buffer.append(b"abc\ndef\n");

        assert_eq!(buffer.read_line().as_deref(), Some("abc\n"));
        assert_eq!(buffer.read_line().as_deref(), Some("def\n"));
        assert_eq!(buffer.read_line(), None);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_partial_line_never_returned() {
        let buffer = LogBuffer::new(100, 50);
        buffer.append_str("complete\npartial");

        assert_eq!(buffer.read_line().as_deref(), Some("complete\n"));
        assert_eq!(buffer.read_line(), None);
        assert_eq!(buffer.peek_line(), None);
        assert_eq!(buffer.size(), "partial".len());

        buffer.append_str(" now done\n");
        assert_eq!(buffer.read_line().as_deref(), Some("partial now done\n"));
    }

    #[test]
    fn test_crlf_is_one_terminator() {
        let buffer = LogBuffer::new(100, 50);
        buffer.append(b"one\r\ntwo\rthree\n");

        assert_eq!(buffer.read_line().as_deref(), Some("one\r\n"));
        assert_eq!(buffer.read_line().as_deref(), Some("two\r"));
        assert_eq!(buffer.read_line().as_deref(), Some("three\n"));
    }

    #[test]
    fn test_peek_is_idempotent() {
        let buffer = LogBuffer::new(100, 50);
        buffer.append_line("first");
        buffer.append_line("second");
        let size = buffer.size();

        let a = buffer.peek_line();
        let b = buffer.peek_line();
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("first\n"));
        assert_eq!(buffer.size(), size);
    }

    #[test]
    fn test_overflow_trims_to_line_boundary() {
        let buffer = LogBuffer::new(10, 5);
        buffer.append(b"1234567890");
        assert_eq!(buffer.discard_count(), 0);

        buffer.append(b"X\n");

        assert_eq!(buffer.discard_count(), 1);
        assert_eq!(buffer.read_line().as_deref(), Some("X\n"));
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_overflow_keeps_whole_trailing_lines() {
        let buffer = LogBuffer::new(20, 12);
        buffer.append(b"aaaa\nbbbb\ncccc\ndddd\n");
        buffer.append(b"ee\n");

        // Window of 9 old bytes starts mid "cccc", so cut forward to "dddd".
        assert_eq!(buffer.discard_count(), 1);
        assert_eq!(buffer.drain_lines(), vec!["dddd\n", "ee\n"]);
    }

    #[test]
    fn test_oversized_append_keeps_tail() {
        let buffer = LogBuffer::new(10, 4);
        buffer.append(b"abc\n");
        buffer.append(b"0123456789AB");

        assert_eq!(buffer.discard_count(), 1);
        assert_eq!(buffer.size(), 4);
        buffer.append(b"\n");
        assert_eq!(buffer.read_line().as_deref(), Some("89AB\n"));
    }

    #[test]
    fn test_capacity_and_discard_invariants() {
        let buffer = LogBuffer::new(64, 40);
        let mut last_discard = 0;
        for i in 0..500 {
            let line = format!("line number {i}\n");
            let before = buffer.discard_count();
            let overflow = buffer.size() + line.len() > buffer.capacity();
            buffer.append_str(&line);
            let after = buffer.discard_count();

            assert!(buffer.size() <= buffer.capacity());
            assert_eq!(after, before + u64::from(overflow));
            assert!(after >= last_discard);
            last_discard = after;
        }
        assert!(last_discard > 0);

        for line in buffer.drain_lines() {
            assert!(line.starts_with("line number "));
            assert!(line.ends_with('\n'));
        }
    }

    #[test]
    fn test_single_byte_appends_match_bulk() {
        let bulk = LogBuffer::new(16, 8);
        let bytewise = LogBuffer::new(16, 8);
        let text = b"alpha\nbeta\ngamma\n";

        for chunk in text.chunks(1) {
            bytewise.append(chunk);
        }
        bulk.append(b"alpha\nbeta\n");
        bulk.append(b"gamma\n");

        assert!(bytewise.size() <= bytewise.capacity());
        assert!(bytewise.discard_count() >= 1);
        assert_eq!(bytewise.read_line().as_deref(), Some("gamma\n"));
        assert_eq!(bulk.read_line().as_deref(), Some("gamma\n"));
    }

    #[test]
    fn test_reset_clears_state() {
        let buffer = LogBuffer::new(10, 5);
        buffer.append(b"1234567890");
        buffer.append(b"X\n");
        assert_eq!(buffer.discard_count(), 1);

        buffer.reset();

        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.discard_count(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_floor_defaults_to_half() {
        assert_eq!(LogBuffer::new(100, 0).retain_floor(), 50);
        assert_eq!(LogBuffer::new(100, 200).retain_floor(), 50);
        assert_eq!(LogBuffer::new(100, 100).retain_floor(), 100);
        assert_eq!(LogBuffer::default().capacity(), DEFAULT_CAPACITY);
        assert_eq!(LogBuffer::default().retain_floor(), DEFAULT_RETAIN_FLOOR);
    }

    #[test]
    fn test_wait_for_data_wakes_on_append() {
        let buffer = Arc::new(LogBuffer::default());
        assert!(!buffer.wait_for_data(Duration::from_millis(10)));

        let writer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.append_line("wake up");
        });

        assert!(buffer.wait_for_data(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_concurrent_writers_keep_lines_intact() {
        let buffer = Arc::new(LogBuffer::new(4096, 2048));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..200 {
                        buffer.append_line(&format!("writer {t} message {i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(buffer.size() <= buffer.capacity());
        for line in buffer.drain_lines() {
            assert!(line.starts_with("writer "), "torn line: {line:?}");
        }
    }
}
