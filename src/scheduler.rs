//! Pacing of processing passes: coalesces invalidations and enforces the
//! minimum inter-pass interval.

use std::time::{Duration, Instant};

use crate::database::LiveQueryKey;

/// Tracks the last processing pass, the set of queued queries and the
/// single pending deadline for a deferred pass.
pub(crate) struct UpdateScheduler {
    min_interval: Duration,
    last_pass: Instant,
    deadline: Option<Instant>,
    queued: Vec<LiveQueryKey>,
    wal_pending: bool,
}

impl UpdateScheduler {
    pub fn new(min_interval: Duration) -> UpdateScheduler {
        UpdateScheduler {
            min_interval,
            last_pass: Instant::now(),
            deadline: None,
            queued: Vec::new(),
            wal_pending: false,
        }
    }

    /// Record a processing pass at `now` without going through
    /// [`request_pass`](Self::request_pass) (initial query executions).
    pub fn touch(&mut self, now: Instant) {
        self.last_pass = now;
    }

    /// A WAL change notification arrived; a WAL read is now owed to the
    /// next pass. Returns true when that pass should run immediately;
    /// otherwise a single deferred pass is scheduled at
    /// `last_pass + min_interval`.
    pub fn request_pass(&mut self, now: Instant) -> bool {
        self.wal_pending = true;
        if now.duration_since(self.last_pass) >= self.min_interval {
            return true;
        }
        if self.deadline.is_none() {
            self.deadline = Some(self.last_pass + self.min_interval);
        }
        false
    }

    /// Whether a deferred pass exists and its deadline has been reached.
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Time remaining until the pending deadline, if any.
    pub fn until_deadline(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Begin a processing pass: stamps `last_pass` and clears the pending
    /// deadline. Returns whether a WAL read is owed to this pass.
    pub fn begin_pass(&mut self, now: Instant) -> bool {
        self.last_pass = now;
        self.deadline = None;
        std::mem::take(&mut self.wal_pending)
    }

    /// Drop the pending deadline without losing queued work (pause).
    pub fn suspend(&mut self) {
        self.deadline = None;
        self.wal_pending = false;
    }

    pub fn is_queued(&self, key: LiveQueryKey) -> bool {
        self.queued.contains(&key)
    }

    /// Queue a query for re-execution; already-queued queries stay queued
    /// once.
    pub fn enqueue(&mut self, key: LiveQueryKey) {
        if !self.queued.contains(&key) {
            self.queued.push(key);
        }
    }

    /// Take the queued set atomically; invalidations arriving later queue
    /// for the next pass.
    pub fn take_queued(&mut self) -> Vec<LiveQueryKey> {
        std::mem::take(&mut self.queued)
    }

    /// Forget a stopped query.
    pub fn remove(&mut self, key: LiveQueryKey) {
        self.queued.retain(|queued| *queued != key);
    }
}
