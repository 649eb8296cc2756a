//! Socket session engine for line-oriented TCP services.
//!
//! Provides:
//! - `SessionEngine` - TCP acceptor running one task per connection
//! - `PacketAssembler` - Text and binary packet framing
//! - Idle, packet and session timeouts with handler interrupts

pub mod engine;
pub mod framing;

pub use engine::{EngineConfig, EngineHandle, SessionEngine, TransportError};
pub use framing::{Feed, FramingRules, PacketAssembler};
