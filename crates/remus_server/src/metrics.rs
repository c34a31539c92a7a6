//! Metrics Module for Observability
//!
//! In-memory counters for monitoring broker health. Lock-free atomics,
//! single writer (the broker loop), any number of readers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance - lock-free atomics for counters
pub static METRICS: Metrics = Metrics::new();

/// Broker metrics - all fields are atomic for thread-safe access
pub struct Metrics {
    // Job counters
    pub jobs_submitted: AtomicU64,
    pub jobs_dispatched: AtomicU64,
    pub jobs_finished: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_expired: AtomicU64,
    pub jobs_terminated: AtomicU64,

    // Peer counters
    pub workers_registered: AtomicU64,
    pub workers_reaped: AtomicU64,
    pub clients_reaped: AtomicU64,

    // Message counters
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub status_events_published: AtomicU64,

    // Error counters
    pub decode_errors: AtomicU64,
    pub protocol_violations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_dispatched: AtomicU64::new(0),
            jobs_finished: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_expired: AtomicU64::new(0),
            jobs_terminated: AtomicU64::new(0),
            workers_registered: AtomicU64::new(0),
            workers_reaped: AtomicU64::new(0),
            clients_reaped: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            status_events_published: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_finished(&self) {
        self.jobs_finished.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_expired(&self) {
        self.jobs_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_terminated(&self) {
        self.jobs_terminated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_registered(&self) {
        self.workers_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_reaped(&self) {
        self.workers_reaped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_clients_reaped(&self) {
        self.clients_reaped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_status_events_published(&self) {
        self.status_events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_finished: self.jobs_finished.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_expired: self.jobs_expired.load(Ordering::Relaxed),
            jobs_terminated: self.jobs_terminated.load(Ordering::Relaxed),
            workers_registered: self.workers_registered.load(Ordering::Relaxed),
            workers_reaped: self.workers_reaped.load(Ordering::Relaxed),
            clients_reaped: self.clients_reaped.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            status_events_published: self.status_events_published.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP remus_jobs_submitted_total Total jobs accepted from clients
# TYPE remus_jobs_submitted_total counter
remus_jobs_submitted_total {}

# HELP remus_jobs_dispatched_total Total jobs handed to workers
# TYPE remus_jobs_dispatched_total counter
remus_jobs_dispatched_total {}

# HELP remus_jobs_finished_total Total jobs finished with a result
# TYPE remus_jobs_finished_total counter
remus_jobs_finished_total {}

# HELP remus_jobs_failed_total Total jobs that failed
# TYPE remus_jobs_failed_total counter
remus_jobs_failed_total {}

# HELP remus_jobs_expired_total Total jobs reaped by the retention window
# TYPE remus_jobs_expired_total counter
remus_jobs_expired_total {}

# HELP remus_jobs_terminated_total Total client-requested terminations
# TYPE remus_jobs_terminated_total counter
remus_jobs_terminated_total {}

# HELP remus_workers_registered_total Total worker registrations
# TYPE remus_workers_registered_total counter
remus_workers_registered_total {}

# HELP remus_workers_reaped_total Total workers removed for missed heartbeats
# TYPE remus_workers_reaped_total counter
remus_workers_reaped_total {}

# HELP remus_clients_reaped_total Total clients removed for inactivity
# TYPE remus_clients_reaped_total counter
remus_clients_reaped_total {}

# HELP remus_messages_received_total Total messages received
# TYPE remus_messages_received_total counter
remus_messages_received_total {}

# HELP remus_messages_sent_total Total messages sent
# TYPE remus_messages_sent_total counter
remus_messages_sent_total {}

# HELP remus_status_events_published_total Total status events published
# TYPE remus_status_events_published_total counter
remus_status_events_published_total {}

# HELP remus_decode_errors_total Total undecodable messages dropped
# TYPE remus_decode_errors_total counter
remus_decode_errors_total {}

# HELP remus_protocol_violations_total Total well-formed but invalid messages dropped
# TYPE remus_protocol_violations_total counter
remus_protocol_violations_total {}
"#,
            s.jobs_submitted,
            s.jobs_dispatched,
            s.jobs_finished,
            s.jobs_failed,
            s.jobs_expired,
            s.jobs_terminated,
            s.workers_registered,
            s.workers_reaped,
            s.clients_reaped,
            s.messages_received,
            s.messages_sent,
            s.status_events_published,
            s.decode_errors,
            s.protocol_violations,
        )
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_dispatched: u64,
    pub jobs_finished: u64,
    pub jobs_failed: u64,
    pub jobs_expired: u64,
    pub jobs_terminated: u64,
    pub workers_registered: u64,
    pub workers_reaped: u64,
    pub clients_reaped: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub status_events_published: u64,
    pub decode_errors: u64,
    pub protocol_violations: u64,
}

impl MetricsSnapshot {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Jobs: {} submitted, {} dispatched, {} finished, {} failed, {} expired | \
             Workers: {} registered, {} reaped | \
             Errors: {} decode, {} violations",
            self.jobs_submitted,
            self.jobs_dispatched,
            self.jobs_finished,
            self.jobs_failed,
            self.jobs_expired,
            self.workers_registered,
            self.workers_reaped,
            self.decode_errors,
            self.protocol_violations,
        )
    }
}
