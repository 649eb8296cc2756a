//! The contract between a protocol handler and the socket session engine.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::session::Session;

/// How the engine should delimit the packet currently being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// Read through the next line terminator.
    LineTerminator,
    /// Read until the peer closes the stream.
    EndOfStream,
    /// The packet is exactly this many bytes.
    Exact(usize),
}

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),
    #[error("Packet timeout after {0:?}")]
    PacketTimeout(Duration),
    #[error("Session timeout after {0:?}")]
    SessionTimeout(Duration),
}

impl SessionError {
    /// Whether the engine closed the session because a timer expired.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::IdleTimeout(_) | Self::PacketTimeout(_) | Self::SessionTimeout(_)
        )
    }
}

/// Application logic plugged into the socket session engine.
///
/// The engine creates one handler per accepted connection and drives it
/// through `session_started`, any number of `handle_packet` calls, and
/// exactly one `session_terminated`. Handlers never see the socket.
///
/// Every method is required. [`HandlerBase`] supplies the stock behaviour
/// for each, so a handler embeds one and delegates whatever it does not
/// customise.
#[async_trait]
pub trait SessionHandler: Send {
    /// Minimum bytes to read before asking for the actual length.
    /// `None` lets the engine decide.
    fn minimum_packet_length(&self) -> Option<usize>;

    /// Longest packet accepted. `None` lets the engine decide.
    fn maximum_packet_length(&self) -> Option<usize>;

    /// Where the packet that starts with `partial` ends.
    fn actual_packet_length(&self, partial: &[u8]) -> PacketLength;

    /// Called once when the connection is accepted.
    fn session_started(&mut self, remote_address: Option<SocketAddr>, duplex: bool, text_mode: bool);

    /// Called once when the connection closes, for any reason.
    ///
    /// `err` is `None` for a normal close. Must be safe to call even if
    /// `session_started` never ran.
    fn session_terminated(&mut self, err: Option<&SessionError>, bytes_read: u64, bytes_written: u64);

    /// Called periodically while the engine waits for the next packet.
    fn idle_timeout_interrupt(&mut self);

    /// Bytes sent before the first request, if any.
    fn initial_packet(&mut self) -> Option<Vec<u8>>;

    /// Bytes sent after the last response, if any.
    fn final_packet(&mut self, had_error: bool) -> Option<Vec<u8>>;

    /// Handle one request. `None` sends nothing back.
    async fn handle_packet(&mut self, request: &[u8]) -> Option<Vec<u8>>;

    /// Ask the engine to close the connection after the current packet.
    fn request_termination(&mut self);

    /// Polled by the engine after each packet.
    fn is_termination_requested(&self) -> bool;

    /// Whether the engine should write its prompt before the next request.
    fn is_prompt_enabled(&self) -> bool;
}

/// Stock behaviour for [`SessionHandler`] methods.
///
/// Owns the connection's [`Session`]. Defaults: the engine picks packet
/// lengths, text sessions split on line terminators, no initial or final
/// packet, and termination after every packet until a handler clears it.
#[derive(Debug)]
pub struct HandlerBase {
    session: Session,
}

impl HandlerBase {
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    pub const fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    #[must_use]
    pub const fn minimum_packet_length(&self) -> Option<usize> {
        None
    }

    #[must_use]
    pub const fn maximum_packet_length(&self) -> Option<usize> {
        None
    }

    #[must_use]
    pub const fn actual_packet_length(&self, partial: &[u8]) -> PacketLength {
        if self.session.is_text_mode() {
            PacketLength::LineTerminator
        } else {
            PacketLength::Exact(partial.len())
        }
    }

    pub fn session_started(&mut self, remote_address: Option<SocketAddr>, duplex: bool, text_mode: bool) {
        self.session.start(remote_address, duplex, text_mode);
        tracing::info!(
            sequence_id = self.session.sequence_id(),
            remote = self.session.host_address().as_deref().unwrap_or("?"),
            "Begin {} session",
            self.session.session_type()
        );
    }

    pub fn session_terminated(&mut self, err: Option<&SessionError>, bytes_read: u64, bytes_written: u64) {
        if let Some(err) = err {
            tracing::warn!(sequence_id = self.session.sequence_id(), error = %err, "Session ended abnormally");
        }
        tracing::info!(
            sequence_id = self.session.sequence_id(),
            remote = self.session.host_address().as_deref().unwrap_or("?"),
            bytes_read,
            bytes_written,
            "End {} session [{} ms]",
            self.session.session_type(),
            self.session.elapsed().as_millis()
        );
    }

    pub const fn idle_timeout_interrupt(&mut self) {}

    #[must_use]
    pub const fn initial_packet(&self) -> Option<Vec<u8>> {
        None
    }

    #[must_use]
    pub const fn final_packet(&self, _had_error: bool) -> Option<Vec<u8>> {
        None
    }

    pub const fn request_termination(&mut self) {
        self.session.set_terminate_requested(true);
    }

    pub const fn clear_termination(&mut self) {
        self.session.set_terminate_requested(false);
    }

    #[must_use]
    pub const fn is_termination_requested(&self) -> bool {
        self.session.is_terminate_requested()
    }

    pub const fn set_prompt_enabled(&mut self, enabled: bool) {
        self.session.set_prompt_enabled(enabled);
    }

    #[must_use]
    pub const fn is_prompt_enabled(&self) -> bool {
        self.session.is_prompt_enabled()
    }
}
