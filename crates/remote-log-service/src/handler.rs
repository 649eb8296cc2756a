//! Session handler serving the remote log protocol.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use remote_log_core::{HandlerBase, LogBuffer, PacketLength, SequenceId, Session, SessionError, SessionHandler};
use tokio::sync::mpsc;

use crate::command::{Command, CommandDispatcher, CommandError, Response};

const BANNER_RULE: &str = "-------------------------------------------------\n";

/// Per-command failure reported to the server's owner.
#[derive(Debug)]
pub struct CommandFailure {
    pub sequence_id: SequenceId,
    /// Request text, lossily decoded.
    pub request: String,
    pub error: CommandError,
}

/// State shared by every connection of one server.
#[derive(Debug)]
pub struct ServiceContext {
    dispatcher: CommandDispatcher,
    header: Option<String>,
    errors: Option<mpsc::UnboundedSender<CommandFailure>>,
}

impl ServiceContext {
    #[must_use]
    pub fn new(buffer: Arc<LogBuffer>, sample_interval: Duration) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(buffer, sample_interval),
            header: None,
            errors: None,
        }
    }

    /// Banner sent on connect. Blank headers are ignored.
    #[must_use]
    pub fn with_header(mut self, header: Option<String>) -> Self {
        self.header = header.filter(|h| !h.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_error_reporter(mut self, errors: Option<mpsc::UnboundedSender<CommandFailure>>) -> Self {
        self.errors = errors;
        self
    }

    #[must_use]
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    #[must_use]
    pub const fn buffer(&self) -> &Arc<LogBuffer> {
        self.dispatcher.buffer()
    }
}

/// Remote log viewer: one instance per connection, all sharing one buffer.
///
/// Sessions stay open across requests until the client disconnects or the
/// engine times them out.
pub struct RemoteLogHandler {
    base: HandlerBase,
    context: Arc<ServiceContext>,
}

impl RemoteLogHandler {
    #[must_use]
    pub fn new(session: Session, context: Arc<ServiceContext>) -> Self {
        let mut base = HandlerBase::new(session);
        base.clear_termination();
        Self { base, context }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        self.base.session()
    }

    fn process(&mut self, request: &[u8]) -> Result<Response, CommandError> {
        let line = std::str::from_utf8(request).map_err(|_| CommandError::InvalidEncoding)?;
        let command = Command::parse(line);
        tracing::trace!(sequence_id = self.base.session().sequence_id(), ?command, "Remote log command");
        self.context.dispatcher.dispatch(&command, self.base.session_mut())
    }

    fn report(&self, request: &[u8], error: CommandError) -> Vec<u8> {
        let sequence_id = self.base.session().sequence_id();
        let request = String::from_utf8_lossy(request).trim().to_string();
        tracing::error!(sequence_id, request = %request, error = %error, "Remote log command failed");

        let response = error.encode();
        if let Some(errors) = &self.context.errors {
            let failure = CommandFailure {
                sequence_id,
                request,
                error,
            };
            if errors.send(failure).is_err() {
                tracing::debug!(sequence_id, "Command failure receiver dropped");
            }
        }
        response
    }
}

#[async_trait]
impl SessionHandler for RemoteLogHandler {
    fn minimum_packet_length(&self) -> Option<usize> {
        self.base.minimum_packet_length()
    }

    fn maximum_packet_length(&self) -> Option<usize> {
        self.base.maximum_packet_length()
    }

    fn actual_packet_length(&self, _partial: &[u8]) -> PacketLength {
        PacketLength::LineTerminator
    }

    fn session_started(&mut self, remote_address: Option<SocketAddr>, duplex: bool, text_mode: bool) {
        self.base.session_started(remote_address, duplex, text_mode);
    }

    fn session_terminated(&mut self, err: Option<&SessionError>, bytes_read: u64, bytes_written: u64) {
        self.base.session_terminated(err, bytes_read, bytes_written);
    }

    fn idle_timeout_interrupt(&mut self) {
        self.base.idle_timeout_interrupt();
    }

    fn initial_packet(&mut self) -> Option<Vec<u8>> {
        let header = self.context.header()?;
        let mut banner = String::with_capacity(header.len() + 2 * BANNER_RULE.len() + 1);
        banner.push_str(BANNER_RULE);
        banner.push_str(header);
        if !header.ends_with('\n') {
            banner.push('\n');
        }
        banner.push_str(BANNER_RULE);
        Some(banner.into_bytes())
    }

    fn final_packet(&mut self, had_error: bool) -> Option<Vec<u8>> {
        self.base.final_packet(had_error)
    }

    async fn handle_packet(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        match self.process(request) {
            Ok(response) => response.encode(),
            Err(err) => Some(self.report(request, err)),
        }
    }

    fn request_termination(&mut self) {
        self.base.request_termination();
    }

    fn is_termination_requested(&self) -> bool {
        self.base.is_termination_requested()
    }

    fn is_prompt_enabled(&self) -> bool {
        self.base.is_prompt_enabled()
    }
}
