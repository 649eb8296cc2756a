//! Remote log server: binds the session engine to the log protocol.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use remote_log_core::{LogBuffer, config::ServerConfig};
use remote_log_transport::{EngineConfig, EngineHandle, FramingRules, SessionEngine, TransportError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::handler::{CommandFailure, RemoteLogHandler, ServiceContext};

/// Crate version, shown in the demo banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prompt written before each request.
pub const DEFAULT_PROMPT: &str = ">> ";

/// Longest command line accepted.
pub const MAX_COMMAND_LENGTH: usize = 1000;

/// Pause between `sample` lines.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Server startup error.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Listen port must be greater than zero")]
    InvalidPort,
    #[error("Unable to resolve bind host '{host}': {reason}")]
    Resolve { host: String, reason: String },
    #[error(transparent)]
    Bind(#[from] TransportError),
}

/// Resolve a bind host to its first address. Blank means all interfaces.
///
/// # Errors
/// Returns error if the host does not resolve.
pub async fn resolve_bind_address(host: &str) -> Result<Option<IpAddr>, ServerError> {
    let host = host.trim();
    if host.is_empty() {
        return Ok(None);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Some(ip));
    }

    let resolve_err = |reason: String| ServerError::Resolve {
        host: host.to_string(),
        reason,
    };
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;
    addrs
        .next()
        .map(|addr| Some(addr.ip()))
        .ok_or_else(|| resolve_err("no addresses found".to_string()))
}

/// Serves one shared [`LogBuffer`] to remote viewers.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use remote_log_core::LogBuffer;
/// # use remote_log_service::RemoteLogServer;
/// # async fn run() -> Result<(), remote_log_service::ServerError> {
/// let buffer = Arc::new(LogBuffer::default());
/// let handle = RemoteLogServer::new(12345, buffer)?
///     .with_header("Gateway logs")
///     .start()
///     .await?;
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RemoteLogServer {
    buffer: Arc<LogBuffer>,
    engine: EngineConfig,
    header: Option<String>,
    errors: Option<mpsc::UnboundedSender<CommandFailure>>,
    sample_interval: Duration,
}

impl RemoteLogServer {
    /// Create a server for `buffer` listening on `port`, with the stock
    /// engine settings for an interactive text console.
    ///
    /// # Errors
    /// Returns error if `port` is zero.
    pub fn new(port: u16, buffer: Arc<LogBuffer>) -> Result<Self, ServerError> {
        if port == 0 {
            return Err(ServerError::InvalidPort);
        }
        let engine = EngineConfig {
            bind_addr: None,
            port,
            framing: FramingRules {
                text_packets: true,
                line_terminators: vec![b'\r', b'\n'],
                backspace_chars: vec![0x08],
                ignore_chars: vec![b'\n'],
                minimum_packet_length: 1,
                maximum_packet_length: MAX_COMMAND_LENGTH,
            },
            prompt: Some(DEFAULT_PROMPT.as_bytes().to_vec()),
            idle_timeout: Some(Duration::from_secs(600)),
            packet_timeout: Some(Duration::from_secs(600)),
            session_timeout: Some(Duration::from_secs(1200)),
            terminate_on_timeout: true,
            ..EngineConfig::default()
        };
        Ok(Self {
            buffer,
            engine,
            header: None,
            errors: None,
            sample_interval: SAMPLE_INTERVAL,
        })
    }

    /// Build a server from configuration, resolving the bind host.
    ///
    /// # Errors
    /// Returns error if the port is zero or the bind host does not resolve.
    pub async fn from_config(config: &ServerConfig, buffer: Arc<LogBuffer>) -> Result<Self, ServerError> {
        let mut server = Self::new(config.port, buffer)?;
        if let Some(host) = &config.bind_host {
            server = server.with_bind_host(host).await?;
        }
        if let Some(header) = &config.header {
            server = server.with_header(header.clone());
        }
        let engine = server.engine_config_mut();
        engine.prompt = (!config.prompt.is_empty()).then(|| config.prompt.as_bytes().to_vec());
        engine.idle_timeout = config.idle_timeout();
        engine.packet_timeout = config.packet_timeout();
        engine.session_timeout = config.session_timeout();
        if config.max_packet_length > 0 {
            engine.framing.maximum_packet_length = config.max_packet_length;
        }
        Ok(server)
    }

    /// Restrict the listener to one local interface.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: Option<IpAddr>) -> Self {
        self.engine.bind_addr = addr;
        self
    }

    /// Restrict the listener to the interface `host` resolves to.
    ///
    /// # Errors
    /// Returns error if the host does not resolve.
    pub async fn with_bind_host(self, host: &str) -> Result<Self, ServerError> {
        let addr = resolve_bind_address(host).await?;
        Ok(self.with_bind_addr(addr))
    }

    /// Banner sent to each viewer on connect.
    #[must_use]
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    /// Also deliver per-command failures to `errors`.
    #[must_use]
    pub fn with_error_reporter(mut self, errors: mpsc::UnboundedSender<CommandFailure>) -> Self {
        self.errors = Some(errors);
        self
    }

    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Engine settings, for anything the builders do not cover.
    pub const fn engine_config_mut(&mut self) -> &mut EngineConfig {
        &mut self.engine
    }

    #[must_use]
    pub const fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Address the listener will bind.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        self.engine.listen_addr()
    }

    /// Bind and start accepting viewers in the background.
    ///
    /// # Errors
    /// Returns error if the listen address cannot be bound.
    pub async fn start(self) -> Result<EngineHandle, ServerError> {
        let addr = self.listen_addr();
        let context = Arc::new(
            ServiceContext::new(self.buffer, self.sample_interval)
                .with_header(self.header)
                .with_error_reporter(self.errors),
        );

        let engine = SessionEngine::bind(self.engine, move |session| {
            RemoteLogHandler::new(session, Arc::clone(&context))
        })
        .await
        .inspect_err(|e| tracing::error!(%addr, error = %e, "Unable to start RemoteLogServer"))?;

        let handle = engine.spawn()?;
        tracing::info!(addr = %handle.local_addr(), "Starting RemoteLogServer listener");
        Ok(handle)
    }
}
