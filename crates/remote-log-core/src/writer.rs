//! Redirects process log output into a [`LogBuffer`].

use std::{io, sync::Arc};

use tracing_subscriber::fmt::MakeWriter;

use crate::LogBuffer;

/// `io::Write` sink that appends everything written to a shared buffer.
///
/// Also a [`MakeWriter`], so it can back a `tracing_subscriber::fmt` layer:
///
/// ```ignore
/// let buffer = Arc::new(LogBuffer::default());
/// tracing_subscriber::fmt()
///     .with_ansi(false)
///     .with_writer(LogBufferWriter::new(Arc::clone(&buffer)))
///     .init();
/// ```
///
/// The `fmt` layer formats a whole event before writing it, so each event
/// reaches the buffer as one append and lines from concurrent threads never
/// interleave.
#[derive(Debug, Clone)]
pub struct LogBufferWriter {
    buffer: Arc<LogBuffer>,
}

impl LogBufferWriter {
    #[must_use]
    pub const fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }

    /// The buffer this writer feeds.
    #[must_use]
    pub const fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBufferWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tracing_subscriber::fmt;

    use super::*;

    #[test]
    fn test_write_appends() {
        let buffer = Arc::new(LogBuffer::new(100, 50));
        let mut writer = LogBufferWriter::new(Arc::clone(&buffer));

        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(buffer.read_line().as_deref(), Some("hello\n"));
    }

    #[test]
    fn test_tracing_events_land_in_buffer() {
        let buffer = Arc::new(LogBuffer::default());
        let subscriber = fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(LogBufferWriter::new(Arc::clone(&buffer)))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("first event");
            tracing::warn!(code = 7, "second event");
        });

        let lines = buffer.drain_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO") && lines[0].contains("first event"));
        assert!(lines[1].contains("WARN") && lines[1].contains("code=7"));
    }
}
