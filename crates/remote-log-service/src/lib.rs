//! Remote log viewer service.
//!
//! Provides:
//! - `RemoteLogServer` - Serve a shared `LogBuffer` over TCP
//! - `RemoteLogHandler` - Per-connection command handler
//! - `Command` / `Response` - Text command grammar and wire encoding

pub mod command;
pub mod handler;
pub mod sample;
pub mod server;

pub use command::{Command, CommandDispatcher, CommandError, Response};
pub use handler::{CommandFailure, RemoteLogHandler, ServiceContext};
pub use server::{RemoteLogServer, ServerError, resolve_bind_address};
