//! Remote log server demo.
//!
//! Redirects this process's log output into a shared cache and serves it to
//! remote viewers.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p log-server -- --port 12345
//!
//! # in another terminal
//! nc localhost 12345
//! >> sample 5
//! >> get
//! ```

use std::{env, sync::Arc};

use anyhow::Context;
use remote_log_core::{LogBuffer, LogBufferWriter, RemoteLogConfig, config::LoggingConfig};
use remote_log_service::{RemoteLogServer, server::VERSION};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut config = RemoteLogConfig::load().context("Failed to load configuration")?;
    if let Some(port) = get_arg(&args, "--port") {
        config.server.port = port.parse().with_context(|| format!("Invalid port '{port}'"))?;
    }
    if let Some(host) = get_arg(&args, "--host") {
        config.server.bind_host = Some(host);
    }

    let buffer = Arc::new(LogBuffer::from_config(&config.buffer));
    init_tracing(&config.logging, &buffer);

    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let header = config
        .server
        .header
        .clone()
        .unwrap_or_else(|| format!("RemoteLogServer test [Version {VERSION}]"));
    let server = RemoteLogServer::from_config(&config.server, Arc::clone(&buffer))
        .await?
        .with_header(header)
        .with_error_reporter(errors_tx);
    let handle = server.start().await?;

    tracing::info!(addr = %handle.local_addr(), "Waiting ...");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            Some(failure) = errors_rx.recv() => {
                tracing::warn!(
                    sequence_id = failure.sequence_id,
                    request = %failure.request,
                    "Viewer command failed: {}",
                    failure.error
                );
            }
        }
    }

    tracing::info!(active_sessions = handle.active_sessions(), "Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, buffer: &Arc<LogBuffer>) {
    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let cache = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(LogBufferWriter::new(Arc::clone(buffer)));
    let stderr = logging.stderr.then(|| fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(cache)
        .with(stderr)
        .try_init();
}

fn get_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}
