//! Packet framing: turns a byte stream into request packets.

use bytes::{Bytes, BytesMut};
use remote_log_core::PacketLength;

/// Default longest packet when neither engine nor handler sets one.
pub const DEFAULT_MAXIMUM_PACKET_LENGTH: usize = 1024;

/// Byte-level rules shared by every connection of an engine.
#[derive(Debug, Clone)]
pub struct FramingRules {
    /// Text packets are edited line by line; binary packets are raw.
    pub text_packets: bool,
    pub line_terminators: Vec<u8>,
    pub backspace_chars: Vec<u8>,
    pub ignore_chars: Vec<u8>,
    pub minimum_packet_length: usize,
    pub maximum_packet_length: usize,
}

impl Default for FramingRules {
    fn default() -> Self {
        Self {
            text_packets: true,
            line_terminators: vec![b'\r', b'\n'],
            backspace_chars: vec![0x08],
            ignore_chars: Vec::new(),
            minimum_packet_length: 1,
            maximum_packet_length: DEFAULT_MAXIMUM_PACKET_LENGTH,
        }
    }
}

impl FramingRules {
    fn is_terminator(&self, b: u8) -> bool {
        self.line_terminators.contains(&b)
    }
}

/// Result of feeding one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    NeedMore,
    Complete,
}

/// Accumulates the bytes of one packet.
///
/// In text mode the line terminator ends the packet and is dropped, ignore
/// characters are skipped, backspace deletes the previous byte, and other
/// control bytes except TAB are discarded. In binary mode the handler is
/// asked for the real length once `minimum` bytes have arrived.
#[derive(Debug)]
pub struct PacketAssembler<'a> {
    rules: &'a FramingRules,
    buf: BytesMut,
    minimum: usize,
    maximum: usize,
    length: Option<PacketLength>,
}

impl<'a> PacketAssembler<'a> {
    /// Start a packet. Handler limits, when present, override the rules.
    #[must_use]
    pub fn new(rules: &'a FramingRules, minimum: Option<usize>, maximum: Option<usize>) -> Self {
        let minimum = minimum.filter(|&n| n > 0).unwrap_or(rules.minimum_packet_length).max(1);
        let maximum = maximum
            .filter(|&n| n > 0)
            .unwrap_or(rules.maximum_packet_length)
            .max(minimum);
        let length = rules.text_packets.then_some(PacketLength::LineTerminator);
        Self {
            rules,
            buf: BytesMut::with_capacity(minimum.max(64)),
            minimum,
            maximum,
            length,
        }
    }

    /// Feed one byte. `length_of` is consulted at most once, for binary
    /// packets, after the minimum length has been read.
    pub fn push<F>(&mut self, byte: u8, length_of: F) -> Feed
    where
        F: FnOnce(&[u8]) -> PacketLength,
    {
        if self.rules.text_packets {
            return self.push_text(byte);
        }

        self.buf.extend_from_slice(&[byte]);
        if self.length.is_none() && self.buf.len() >= self.minimum {
            self.length = Some(length_of(&self.buf));
        }

        let complete = match self.length {
            None => false,
            Some(PacketLength::Exact(n)) => self.buf.len() >= n,
            Some(PacketLength::LineTerminator) => self.rules.is_terminator(byte),
            Some(PacketLength::EndOfStream) => false,
        };
        if complete || self.buf.len() >= self.maximum {
            Feed::Complete
        } else {
            Feed::NeedMore
        }
    }

    fn push_text(&mut self, byte: u8) -> Feed {
        if self.rules.is_terminator(byte) {
            return Feed::Complete;
        }
        if self.rules.ignore_chars.contains(&byte) {
            return Feed::NeedMore;
        }
        if self.rules.backspace_chars.contains(&byte) {
            let len = self.buf.len();
            self.buf.truncate(len.saturating_sub(1));
            return Feed::NeedMore;
        }
        if byte < b' ' && byte != b'\t' {
            return Feed::NeedMore;
        }

        self.buf.extend_from_slice(&[byte]);
        if self.buf.len() >= self.maximum {
            Feed::Complete
        } else {
            Feed::NeedMore
        }
    }

    /// Bytes accumulated so far.
    #[must_use]
    pub fn partial(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the packet is only complete when the peer closes.
    #[must_use]
    pub fn reads_to_end_of_stream(&self) -> bool {
        self.length == Some(PacketLength::EndOfStream)
    }

    /// Take the packet and reset for the next one.
    pub fn take(&mut self) -> Bytes {
        self.length = self.rules.text_packets.then_some(PacketLength::LineTerminator);
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(assembler: &mut PacketAssembler<'_>, bytes: &[u8], length: PacketLength) -> Vec<Bytes> {
        let mut packets = Vec::new();
        for &b in bytes {
            if assembler.push(b, |_| length) == Feed::Complete {
                packets.push(assembler.take());
            }
        }
        packets
    }

    #[test]
    fn test_text_lines_split_on_any_terminator() {
        let rules = FramingRules::default();
        let mut assembler = PacketAssembler::new(&rules, None, None);

        let packets = feed_all(&mut assembler, b"get\rreset\nsample 2\r\n", PacketLength::LineTerminator);

        assert_eq!(packets, vec![
            Bytes::from_static(b"get"),
            Bytes::from_static(b"reset"),
            Bytes::from_static(b"sample 2"),
            Bytes::new(),
        ]);
    }

    #[test]
    fn test_text_editing() {
        let rules = FramingRules {
            ignore_chars: vec![b'~'],
            ..FramingRules::default()
        };
        let mut assembler = PacketAssembler::new(&rules, None, None);

        let packets = feed_all(&mut assembler, b"gex\x08t~\x01\tx\n", PacketLength::LineTerminator);

        assert_eq!(packets, vec![Bytes::from_static(b"get\tx")]);
    }

    #[test]
    fn test_text_maximum_length() {
        let rules = FramingRules::default();
        let mut assembler = PacketAssembler::new(&rules, None, Some(4));

        let packets = feed_all(&mut assembler, b"abcdefgh", PacketLength::LineTerminator);

        assert_eq!(packets, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_binary_exact_length() {
        let rules = FramingRules {
            text_packets: false,
            minimum_packet_length: 2,
            ..FramingRules::default()
        };
        let mut assembler = PacketAssembler::new(&rules, None, None);
        let mut asked = Vec::new();

        let mut packets = Vec::new();
        for &b in b"\x00\x03XYZ\x00\x01Q" {
            let feed = assembler.push(b, |partial| {
                asked.push(partial.to_vec());
                PacketLength::Exact(2 + usize::from(partial[1]))
            });
            if feed == Feed::Complete {
                packets.push(assembler.take());
            }
        }

        assert_eq!(asked, vec![vec![0, 3], vec![0, 1]]);
        assert_eq!(packets, vec![
            Bytes::from_static(b"\x00\x03XYZ"),
            Bytes::from_static(b"\x00\x01Q"),
        ]);
    }

    #[test]
    fn test_binary_line_terminator_keeps_terminator() {
        let rules = FramingRules {
            text_packets: false,
            ..FramingRules::default()
        };
        let mut assembler = PacketAssembler::new(&rules, None, None);

        let packets = feed_all(&mut assembler, b"ab\x08c\n", PacketLength::LineTerminator);

        assert_eq!(packets, vec![Bytes::from_static(b"ab\x08c\n")]);
    }

    #[test]
    fn test_binary_end_of_stream() {
        let rules = FramingRules {
            text_packets: false,
            ..FramingRules::default()
        };
        let mut assembler = PacketAssembler::new(&rules, None, Some(100));

        let packets = feed_all(&mut assembler, b"line1\nline2\n", PacketLength::EndOfStream);

        assert!(packets.is_empty());
        assert!(assembler.reads_to_end_of_stream());
        assert_eq!(assembler.take(), Bytes::from_static(b"line1\nline2\n"));
    }
}
