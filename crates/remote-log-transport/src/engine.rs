//! TCP socket session engine.
//!
//! Accepts connections, runs one task per connection, frames request
//! packets, enforces idle/packet/session timeouts, and drives a
//! [`SessionHandler`] through its lifecycle.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use remote_log_core::{SequenceId, Session, SessionError, SessionHandler, SessionRegistry};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    task::JoinHandle,
    time::Instant,
};

use crate::framing::{Feed, FramingRules, PacketAssembler};

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Unable to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local interface; all interfaces when `None`.
    pub bind_addr: Option<IpAddr>,
    pub port: u16,
    pub framing: FramingRules,
    /// Written before each request while the handler allows it.
    pub prompt: Option<Vec<u8>>,
    /// Longest wait for the first byte of a packet.
    pub idle_timeout: Option<Duration>,
    /// Longest wait from the first byte of a packet to its end.
    pub packet_timeout: Option<Duration>,
    /// Longest total session.
    pub session_timeout: Option<Duration>,
    /// Close the session when the idle or packet timeout fires. Otherwise
    /// the partial packet is delivered and reading resumes.
    pub terminate_on_timeout: bool,
    /// How often `idle_timeout_interrupt` runs while a read is pending.
    pub interrupt_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            port: 0,
            framing: FramingRules::default(),
            prompt: None,
            idle_timeout: None,
            packet_timeout: None,
            session_timeout: None,
            terminate_on_timeout: true,
            interrupt_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Socket address to listen on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), self.port)
    }
}

type HandlerFactory<H> = Arc<dyn Fn(Session) -> H + Send + Sync>;

/// A bound listener ready to serve sessions.
pub struct SessionEngine<H> {
    listener: TcpListener,
    config: Arc<EngineConfig>,
    registry: Arc<SessionRegistry>,
    factory: HandlerFactory<H>,
}

impl<H> SessionEngine<H>
where
    H: SessionHandler + 'static,
{
    /// Bind the listener. `factory` builds one handler per connection from
    /// the session the engine opened for it.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind<F>(config: EngineConfig, factory: F) -> Result<Self, TransportError>
    where
        F: Fn(Session) -> H + Send + Sync + 'static,
    {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            factory: Arc::new(factory),
        })
    }

    /// Address actually bound (resolves port 0).
    ///
    /// # Errors
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` flips to `true`.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => self.spawn_session(stream, addr),
                        Err(err) => back_off_after_accept_error(&err).await,
                    }
                }
            }
        }
        tracing::debug!("Session engine stopped");
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "Unable to set TCP_NODELAY");
        }
        let session = self.registry.open();
        let sequence_id = session.sequence_id();
        let handler = (self.factory)(session);
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let _open = OpenSession {
                registry,
                sequence_id,
            };
            run_session(stream, addr, handler, &config).await;
        });
    }

    /// Run the accept loop on a background task.
    ///
    /// # Errors
    /// Returns error if the local address cannot be read.
    pub fn spawn(self) -> Result<EngineHandle, TransportError> {
        let local_addr = self.local_addr()?;
        let registry = Arc::clone(&self.registry);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(EngineHandle {
            local_addr,
            registry,
            shutdown_tx,
            task,
        })
    }
}

/// Pause after a failed accept, e.g. when file descriptors run out.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn back_off_after_accept_error(err: &std::io::Error) {
    tracing::warn!(error = %err, "Accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Closes the registry entry when the session task ends, even by panic.
struct OpenSession {
    registry: Arc<SessionRegistry>,
    sequence_id: SequenceId,
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        self.registry.close(self.sequence_id);
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently open.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.registry.active_sessions()
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "Session engine task failed");
        }
    }
}

/// Drive one connection from start to termination.
pub(crate) async fn run_session<H: SessionHandler>(
    stream: TcpStream,
    addr: SocketAddr,
    mut handler: H,
    config: &EngineConfig,
) {
    handler.session_started(Some(addr), true, config.framing.text_packets);

    let mut conn = Connection::new(stream, config);
    let result = conn.serve(&mut handler).await;
    let err = result.err();

    if conn.writable {
        if let Some(packet) = handler.final_packet(err.is_some()) {
            if let Err(e) = conn.write(&packet).await {
                tracing::debug!(error = %e, "Unable to send final packet");
            }
        }
    }
    conn.close().await;

    handler.session_terminated(err.as_ref(), conn.bytes_read, conn.bytes_written);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Idle,
    Packet,
    Session,
}

enum ReadOutcome {
    Packet(Bytes),
    /// Peer closed the stream.
    Closed,
    /// Handler asked to stop while waiting for data.
    Interrupted,
}

struct Connection<'a> {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    config: &'a EngineConfig,
    session_deadline: Option<Instant>,
    bytes_read: u64,
    bytes_written: u64,
    writable: bool,
}

impl<'a> Connection<'a> {
    fn new(stream: TcpStream, config: &'a EngineConfig) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            config,
            session_deadline: config.session_timeout.map(|t| Instant::now() + t),
            bytes_read: 0,
            bytes_written: 0,
            writable: true,
        }
    }

    async fn serve<H: SessionHandler>(&mut self, handler: &mut H) -> Result<(), SessionError> {
        let config = self.config;
        if let Some(packet) = handler.initial_packet() {
            self.write(&packet).await?;
        }

        loop {
            if let Some(deadline) = self.session_deadline {
                if Instant::now() >= deadline {
                    return Err(self.timeout_error(Timer::Session));
                }
            }

            if handler.is_prompt_enabled() {
                if let Some(prompt) = &config.prompt {
                    self.write(prompt).await?;
                }
            }

            let packet = match self.read_packet(handler).await? {
                ReadOutcome::Packet(packet) => packet,
                ReadOutcome::Closed | ReadOutcome::Interrupted => return Ok(()),
            };

            if let Some(response) = handler.handle_packet(&packet).await {
                self.write(&response).await?;
            }

            if handler.is_termination_requested() {
                return Ok(());
            }
        }
    }

    async fn read_packet<H: SessionHandler>(&mut self, handler: &mut H) -> Result<ReadOutcome, SessionError> {
        let config = self.config;
        let mut assembler = PacketAssembler::new(
            &config.framing,
            handler.minimum_packet_length(),
            handler.maximum_packet_length(),
        );
        let mut timer = Timer::Idle;
        let mut packet_deadline = config.idle_timeout.map(|t| Instant::now() + t);

        loop {
            let (deadline, fired) = match (packet_deadline, self.session_deadline) {
                (Some(p), Some(s)) if s < p => (Some(s), Timer::Session),
                (None, Some(s)) => (Some(s), Timer::Session),
                (p, _) => (p, timer),
            };

            let byte = match self.read_byte(handler, deadline).await {
                Ok(Some(byte)) => byte,
                Ok(None) if assembler.reads_to_end_of_stream() && !assembler.is_empty() => {
                    return Ok(ReadOutcome::Packet(assembler.take()));
                }
                Ok(None) => {
                    if !assembler.is_empty() {
                        tracing::warn!(
                            partial = %String::from_utf8_lossy(assembler.partial()),
                            "End of stream inside packet"
                        );
                    }
                    return Ok(ReadOutcome::Closed);
                }
                Err(ReadError::Interrupted) => return Ok(ReadOutcome::Interrupted),
                Err(ReadError::Io(err)) => return Err(err.into()),
                Err(ReadError::TimedOut) => {
                    if !assembler.is_empty() {
                        tracing::warn!(
                            partial = %String::from_utf8_lossy(assembler.partial()),
                            "Timeout inside packet"
                        );
                    }
                    if fired == Timer::Session || config.terminate_on_timeout {
                        return Err(self.timeout_error(fired));
                    }
                    return Ok(ReadOutcome::Packet(assembler.take()));
                }
            };

            if timer == Timer::Idle {
                timer = Timer::Packet;
                packet_deadline = config.packet_timeout.map(|t| Instant::now() + t);
            }

            if assembler.push(byte, |partial| handler.actual_packet_length(partial)) == Feed::Complete {
                return Ok(ReadOutcome::Packet(assembler.take()));
            }
        }
    }

    /// Read one byte, waking every interrupt interval to poll the handler.
    async fn read_byte<H: SessionHandler>(
        &mut self,
        handler: &mut H,
        deadline: Option<Instant>,
    ) -> Result<Option<u8>, ReadError> {
        loop {
            let mut wait = self.config.interrupt_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ReadError::TimedOut);
                }
                wait = wait.min(deadline - now);
            }

            match tokio::time::timeout(wait, self.reader.read_u8()).await {
                Ok(Ok(byte)) => {
                    self.bytes_read += 1;
                    return Ok(Some(byte));
                }
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Ok(Err(err)) => return Err(ReadError::Io(err)),
                Err(_) => {
                    handler.idle_timeout_interrupt();
                    if handler.is_termination_requested() {
                        return Err(ReadError::Interrupted);
                    }
                }
            }
        }
    }

    fn timeout_error(&self, timer: Timer) -> SessionError {
        match timer {
            Timer::Idle => SessionError::IdleTimeout(self.config.idle_timeout.unwrap_or_default()),
            Timer::Packet => SessionError::PacketTimeout(self.config.packet_timeout.unwrap_or_default()),
            Timer::Session => SessionError::SessionTimeout(self.config.session_timeout.unwrap_or_default()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        let result = async {
            self.writer.write_all(data).await?;
            self.writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                self.bytes_written += data.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.writable = false;
                Err(err.into())
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            tracing::trace!(error = %err, "Socket shutdown failed");
        }
    }
}

enum ReadError {
    TimedOut,
    Interrupted,
    Io(std::io::Error),
}
