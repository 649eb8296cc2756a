//! Per-connection session state and the registry that numbers sessions.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Session sequence identifier.
pub type SequenceId = u64;

/// Identity and mutable state for one client connection.
#[derive(Debug, Clone)]
pub struct Session {
    sequence_id: SequenceId,
    /// Start timestamp (Unix epoch seconds), set when the session starts.
    started_at: Option<i64>,
    started: Option<Instant>,
    remote_address: Option<SocketAddr>,
    duplex: bool,
    text_mode: bool,
    terminate_requested: bool,
    prompt_enabled: bool,
    saved_event_count: u32,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl Session {
    /// Create a session that has not started yet.
    ///
    /// Sessions terminate after each packet unless the handler clears the
    /// request.
    #[must_use]
    pub const fn new(sequence_id: SequenceId) -> Self {
        Self {
            sequence_id,
            started_at: None,
            started: None,
            remote_address: None,
            duplex: true,
            text_mode: false,
            terminate_requested: true,
            prompt_enabled: true,
            saved_event_count: 0,
        }
    }

    /// Record the start of the session.
    pub fn start(&mut self, remote_address: Option<SocketAddr>, duplex: bool, text_mode: bool) {
        self.started_at = Some(now());
        self.started = Some(Instant::now());
        self.remote_address = remote_address;
        self.duplex = duplex;
        self.text_mode = text_mode;
        self.clear_saved_event_count();
    }

    #[must_use]
    pub const fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Whether `start` has been called.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started.is_some()
    }

    /// Start timestamp in Unix epoch seconds.
    #[must_use]
    pub const fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    /// Time since the session started; zero if it never started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    #[must_use]
    pub const fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// Remote IP as text, if known.
    #[must_use]
    pub fn host_address(&self) -> Option<String> {
        self.remote_address.map(|a| a.ip().to_string())
    }

    /// Whether this is a connection-oriented session.
    #[must_use]
    pub const fn is_duplex(&self) -> bool {
        self.duplex
    }

    #[must_use]
    pub const fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    /// Transport name for log messages.
    #[must_use]
    pub const fn session_type(&self) -> &'static str {
        if self.duplex { "TCP" } else { "UDP" }
    }

    pub const fn set_terminate_requested(&mut self, terminate: bool) {
        self.terminate_requested = terminate;
    }

    #[must_use]
    pub const fn is_terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    pub const fn set_prompt_enabled(&mut self, enabled: bool) {
        self.prompt_enabled = enabled;
    }

    #[must_use]
    pub const fn is_prompt_enabled(&self) -> bool {
        self.prompt_enabled
    }

    pub const fn set_saved_event_count(&mut self, count: u32) {
        self.saved_event_count = count;
    }

    pub const fn clear_saved_event_count(&mut self) {
        self.saved_event_count = 0;
    }

    pub const fn increment_saved_event_count(&mut self) {
        self.saved_event_count = self.saved_event_count.saturating_add(1);
    }

    #[must_use]
    pub const fn saved_event_count(&self) -> u32 {
        self.saved_event_count
    }

    #[must_use]
    pub const fn has_saved_events(&self) -> bool {
        self.saved_event_count > 0
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_id == other.sequence_id
    }
}

impl Eq for Session {}

/// Hands out session sequence ids and tracks how many sessions are open.
///
/// One registry is shared by every connection of a server; ids start at 1.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
        }
    }

    /// Create a new session with the next sequence id.
    pub fn open(&self) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Session::new(id)
    }

    /// Mark a session opened by this registry as finished.
    pub fn close(&self, sequence_id: SequenceId) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        tracing::trace!(sequence_id, "Session closed");
    }

    /// Number of sessions opened and not yet closed.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new(7);
        assert_eq!(session.sequence_id(), 7);
        assert!(!session.is_started());
        assert!(session.is_terminate_requested());
        assert!(session.is_prompt_enabled());
        assert_eq!(session.elapsed(), Duration::ZERO);
        assert_eq!(session.host_address(), None);
    }

    #[test]
    fn test_start_records_peer() {
        let mut session = Session::new(1);
        session.set_saved_event_count(4);
        let addr: SocketAddr = "10.1.2.3:5000".parse().unwrap();

        session.start(Some(addr), true, true);

        assert!(session.is_started());
        assert!(session.started_at().is_some_and(|t| t > 0));
        assert_eq!(session.host_address().as_deref(), Some("10.1.2.3"));
        assert_eq!(session.session_type(), "TCP");
        assert!(session.is_text_mode());
        assert!(!session.has_saved_events());
    }

    #[test]
    fn test_saved_event_count() {
        let mut session = Session::new(1);
        session.increment_saved_event_count();
        session.increment_saved_event_count();
        assert_eq!(session.saved_event_count(), 2);
        assert!(session.has_saved_events());
        session.clear_saved_event_count();
        assert!(!session.has_saved_events());
    }

    #[test]
    fn test_registry_ids_are_unique_across_threads() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || (0..100).map(|_| registry.open().sequence_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 400);
        assert_eq!(ids.iter().min(), Some(&1));
        assert_eq!(registry.active_sessions(), 400);
    }

    #[test]
    fn test_registry_close_never_underflows() {
        let registry = SessionRegistry::new();
        let id = registry.open().sequence_id();
        registry.close(id);
        registry.close(id);
        assert_eq!(registry.active_sessions(), 0);
    }
}
