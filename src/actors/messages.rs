//! Message and report types shared between the pipeline tasks
//!
//! The only message that flows between tasks at runtime is the
//! [`ChangeEvent`] on the change notifier. The report types are returned by
//! the single-cycle entry points (`poll_once`, `drain_once`, `publish_pending`)
//! so that run loops can log them and tests can assert on them.

use crate::BufferedRecord;

/// Emitted on the change notifier whenever the cache accepts a newer sample
///
/// It has exactly the shape of a buffer line.
pub type ChangeEvent = BufferedRecord;

/// Outcome of `Manager::set_entry`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpdate {
    /// Cache updated and change event queued
    Applied,

    /// Cache updated but the notifier was full or closed; the event is lost
    AppliedUnnotified,

    /// Sample not newer than the cached one; nothing changed
    Stale,
}

impl EntryUpdate {
    pub fn is_applied(&self) -> bool {
        !matches!(self, EntryUpdate::Stale)
    }
}

/// Result of one collector cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Guests whose series was fetched
    pub fetched: usize,

    /// Guests whose fetch failed (skipped until the next cycle)
    pub failed: usize,

    /// Samples accepted by the cache
    pub applied: usize,

    /// Samples accepted but not announced to the buffer writer
    pub unnotified: usize,
}

impl PollSummary {
    pub fn merge(&mut self, other: PollSummary) {
        self.fetched += other.fetched;
        self.failed += other.failed;
        self.applied += other.applied;
        self.unnotified += other.unnotified;
    }
}

/// Result of one successful drain run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records decoded and committed
    pub records: usize,

    /// Batches committed
    pub batches: usize,

    /// Lines that could not be decoded and were dropped
    pub malformed: usize,

    /// Bytes appended while the drain ran, kept for the next run
    pub carried_over: u64,
}

/// Result of one outbox cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records published and marked delivered
    pub delivered: usize,

    /// Records that stay pending (publish or status update failed)
    pub failed: usize,
}
