//! In-process actor counters and mailbox backlog sampling.
//!
//! Every actor samples its own queue length each time it takes a message
//! off the queue. Backlog bands per actor type:
//!
//! | Actor      | Healthy | Elevated  | Saturated |
//! |------------|---------|-----------|-----------|
//! | registry   | <= 100  | 101-500   | > 500     |
//! | session    | <= 100  | 101-500   | > 500     |
//! | connection | <= 50   | 51-200    | > 200     |
//!
//! [`ActorMetrics`] backs the admin endpoints; every change is mirrored to
//! the Prometheus gauges in [`crate::observability::metrics`].

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Registry,
    Session,
    Connection,
}

/// Backlog limits above which a mailbox is elevated or saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogBands {
    pub elevated_above: usize,
    pub saturated_above: usize,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Session => "session",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn bands(self) -> BacklogBands {
        match self {
            ActorType::Registry | ActorType::Session => BacklogBands {
                elevated_above: 100,
                saturated_above: 500,
            },
            ActorType::Connection => BacklogBands {
                elevated_above: 50,
                saturated_above: 200,
            },
        }
    }

    #[must_use]
    pub const fn classify(self, backlog: usize) -> BacklogLevel {
        let bands = self.bands();
        if backlog > bands.saturated_above {
            BacklogLevel::Saturated
        } else if backlog > bands.elevated_above {
            BacklogLevel::Elevated
        } else {
            BacklogLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogLevel {
    Healthy,
    Elevated,
    Saturated,
}

/// Backlog samples for one actor. Owned by the actor it watches.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    backlog: usize,
    peak: usize,
    processed: u64,
    level: BacklogLevel,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            backlog: 0,
            peak: 0,
            processed: 0,
            level: BacklogLevel::Healthy,
        }
    }

    /// Records one dequeued message and the queue length behind it.
    ///
    /// Logs only when the backlog moves between bands.
    pub fn observe(&mut self, backlog: usize) {
        self.processed += 1;
        self.backlog = backlog;
        self.peak = self.peak.max(backlog);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), backlog);

        let level = self.actor_type.classify(backlog);
        if level == self.level {
            return;
        }
        match level {
            BacklogLevel::Saturated => warn!(
                target: "sig.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog,
                limit = self.actor_type.bands().saturated_above,
                "Mailbox saturated"
            ),
            BacklogLevel::Elevated => debug!(
                target: "sig.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog,
                "Mailbox backlog elevated"
            ),
            BacklogLevel::Healthy => debug!(
                target: "sig.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                peak = self.peak,
                "Mailbox backlog cleared"
            ),
        }
        self.level = level;
    }

    /// Queue length at the last sample.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak
    }

    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed
    }

    #[must_use]
    pub fn level(&self) -> BacklogLevel {
        self.level
    }
}

/// Live counts shared by every actor in the process.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    sessions: AtomicUsize,
    participants: AtomicUsize,
    connections: AtomicUsize,
    panics: AtomicU64,
}

/// Saturating decrement; returns the new value.
fn decrement(counter: &AtomicUsize) -> usize {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .map_or(0, |previous| previous - 1)
}

fn increment(counter: &AtomicUsize) -> usize {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_created(&self) {
        prom::set_active_sessions(increment(&self.sessions));
    }

    pub fn session_removed(&self) {
        prom::set_active_sessions(decrement(&self.sessions));
    }

    pub fn participant_joined(&self) {
        prom::set_active_participants(increment(&self.participants));
    }

    pub fn participant_left(&self) {
        prom::set_active_participants(decrement(&self.participants));
    }

    pub fn connection_created(&self) {
        prom::set_active_connections(increment(&self.connections));
    }

    pub fn connection_closed(&self) {
        prom::set_active_connections(decrement(&self.connections));
    }

    /// A task died by panicking. Always a bug.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        error!(
            target: "sig.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor task panicked"
        );
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_classify_backlog() {
        assert_eq!(ActorType::Session.classify(100), BacklogLevel::Healthy);
        assert_eq!(ActorType::Session.classify(101), BacklogLevel::Elevated);
        assert_eq!(ActorType::Registry.classify(501), BacklogLevel::Saturated);
        assert_eq!(ActorType::Connection.classify(50), BacklogLevel::Healthy);
        assert_eq!(ActorType::Connection.classify(200), BacklogLevel::Elevated);
        assert_eq!(ActorType::Connection.classify(201), BacklogLevel::Saturated);
    }

    #[test]
    fn test_monitor_tracks_backlog_and_peak() {
        let mut monitor = MailboxMonitor::new(ActorType::Session, "room-123");

        monitor.observe(3);
        monitor.observe(7);
        monitor.observe(2);

        assert_eq!(monitor.backlog(), 2);
        assert_eq!(monitor.peak(), 7);
        assert_eq!(monitor.processed(), 3);
        assert_eq!(monitor.level(), BacklogLevel::Healthy);
    }

    #[test]
    fn test_monitor_moves_between_levels() {
        let mut monitor = MailboxMonitor::new(ActorType::Connection, "conn-456");

        monitor.observe(75);
        assert_eq!(monitor.level(), BacklogLevel::Elevated);
        monitor.observe(250);
        assert_eq!(monitor.level(), BacklogLevel::Saturated);
        monitor.observe(0);
        assert_eq!(monitor.level(), BacklogLevel::Healthy);
        assert_eq!(monitor.peak(), 250);
    }

    #[test]
    fn test_counts_never_underflow() {
        let metrics = ActorMetrics::new();

        metrics.session_created();
        metrics.session_created();
        metrics.participant_joined();
        metrics.connection_created();
        assert_eq!(metrics.session_count(), 2);
        assert_eq!(metrics.participant_count(), 1);
        assert_eq!(metrics.connection_count(), 1);

        metrics.session_removed();
        metrics.participant_left();
        metrics.participant_left();
        assert_eq!(metrics.session_count(), 1);
        assert_eq!(metrics.participant_count(), 0);
    }

    #[test]
    fn test_panics_are_counted() {
        let metrics = ActorMetrics::new();

        metrics.record_panic(ActorType::Session);
        metrics.record_panic(ActorType::Connection);
        assert_eq!(metrics.panic_count(), 2);
    }
}
