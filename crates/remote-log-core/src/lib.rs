//! Core abstractions for remote log inspection.
//!
//! This crate provides the fundamental building blocks:
//! - `LogBuffer` - Bounded, line-aware log cache shared by writers and viewers
//! - `Session` / `SessionRegistry` - Per-connection state and sequence ids
//! - `SessionHandler` / `HandlerBase` - Contract with the socket session engine
//! - `LogBufferWriter` - Routes `tracing` output into a `LogBuffer`
//! - `RemoteLogConfig` - Layered configuration

pub mod config;
pub mod log_buffer;
pub mod session;
pub mod traits;
pub mod writer;

pub use config::RemoteLogConfig;
pub use log_buffer::LogBuffer;
pub use session::{SequenceId, Session, SessionRegistry};
pub use traits::{HandlerBase, PacketLength, SessionError, SessionHandler};
pub use writer::LogBufferWriter;
