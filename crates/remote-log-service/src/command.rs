//! Command grammar and dispatch for the remote log protocol.

use std::{sync::Arc, time::Duration};

use remote_log_core::{LogBuffer, Session};
use thiserror::Error;

use crate::sample;

pub const LOG_OUTPUT_BEGIN: &str = "<LogOutput>\n";
pub const LOG_OUTPUT_END: &str = "</LogOutput>\n";

/// Lines emitted by `sample` without an argument.
pub const DEFAULT_SAMPLE_COUNT: usize = 3;

/// Upper bound on lines emitted by one `sample`.
pub const MAX_SAMPLE_COUNT: usize = 30;

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Blank line.
    Empty,
    /// Drain buffered lines.
    Get,
    /// Clear the buffer (`reset` or `clear`).
    Reset,
    /// Emit synthetic log lines.
    Sample(usize),
    /// Toggle the interactive prompt.
    Prompt(bool),
    /// Anything else, trimmed.
    Unknown(String),
}

impl Command {
    /// Parse a request line. Command words are case-insensitive.
    ///
    /// `get`, `reset` and `clear` must match the whole line. `sample` and
    /// `prompt` match as prefixes and take whatever follows the first space
    /// as their argument.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let arg = line.split_once(char::is_whitespace).map(|(_, arg)| arg.trim());

        if line.eq_ignore_ascii_case("get") {
            Self::Get
        } else if line.eq_ignore_ascii_case("reset") || line.eq_ignore_ascii_case("clear") {
            Self::Reset
        } else if starts_with_ignore_case(line, "sample") {
            Self::Sample(arg.map_or(DEFAULT_SAMPLE_COUNT, parse_count))
        } else if starts_with_ignore_case(line, "prompt") {
            Self::Prompt(arg.is_none_or(|a| parse_bool(a, true)))
        } else {
            Self::Unknown(line.to_string())
        }
    }
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Sample count argument: unparsable means the default, negative means none.
fn parse_count(arg: &str) -> usize {
    arg.parse::<i64>().map_or(DEFAULT_SAMPLE_COUNT, |n| {
        usize::try_from(n).unwrap_or(0).min(MAX_SAMPLE_COUNT)
    })
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "y" | "1" => true,
        "off" | "false" | "no" | "n" | "0" => false,
        _ => default,
    }
}

/// Outcome of a successfully executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Send nothing.
    Silent,
    /// Drained log lines, each with its terminator.
    LogOutput(Vec<String>),
    Reset,
    SampleStarted,
    Unknown(String),
}

impl Response {
    /// Wire encoding; `None` means no bytes are sent.
    #[must_use]
    pub fn encode(&self) -> Option<Vec<u8>> {
        let text = match self {
            Self::Silent => return None,
            Self::LogOutput(lines) if lines.is_empty() => return None,
            Self::LogOutput(lines) => {
                let body: usize = lines.iter().map(String::len).sum();
                let mut out = String::with_capacity(LOG_OUTPUT_BEGIN.len() + body + LOG_OUTPUT_END.len());
                out.push_str(LOG_OUTPUT_BEGIN);
                for line in lines {
                    out.push_str(line);
                }
                out.push_str(LOG_OUTPUT_END);
                out
            }
            Self::Reset => "Reset\n\n".to_string(),
            Self::SampleStarted => "Loading log samples\n\n".to_string(),
            Self::Unknown(cmd) => format!("Unknown Command: {cmd}\n\n"),
        };
        Some(text.into_bytes())
    }
}

/// Command execution failure.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Request is not valid UTF-8")]
    InvalidEncoding,
    #[error("No async runtime available for background task")]
    NoRuntime,
}

impl CommandError {
    /// Wire encoding of the failure.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        format!("ERROR: {self}\n\n").into_bytes()
    }
}

/// Executes commands against the shared log buffer.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    buffer: Arc<LogBuffer>,
    sample_interval: Duration,
}

impl CommandDispatcher {
    #[must_use]
    pub const fn new(buffer: Arc<LogBuffer>, sample_interval: Duration) -> Self {
        Self {
            buffer,
            sample_interval,
        }
    }

    #[must_use]
    pub const fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Run one command. Each buffer access is a single atomic operation.
    ///
    /// # Errors
    /// Returns error if a background sample task cannot be started.
    pub fn dispatch(&self, command: &Command, session: &mut Session) -> Result<Response, CommandError> {
        match command {
            Command::Empty => Ok(Response::Silent),
            Command::Get => {
                let discarded = self.buffer.discard_count();
                if discarded > 0 {
                    tracing::trace!(discarded, "Log text was evicted before this read");
                }
                Ok(Response::LogOutput(self.buffer.drain_lines()))
            }
            Command::Reset => {
                self.buffer.reset();
                Ok(Response::Reset)
            }
            Command::Sample(count) => {
                sample::spawn_samples(Arc::clone(&self.buffer), *count, self.sample_interval)?;
                Ok(Response::SampleStarted)
            }
            Command::Prompt(enabled) => {
                session.set_prompt_enabled(*enabled);
                Ok(Response::Silent)
            }
            Command::Unknown(cmd) => Ok(Response::Unknown(cmd.clone())),
        }
    }
}
