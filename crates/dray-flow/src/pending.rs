//! Pending submissions and the ready-time delay queue.
//!
//! A [`PendingSubmission`] is a transient, delayable wrapper around a
//! submission awaiting dispatch. Ordering is an explicit priority structure
//! keyed by a computed ready time (`created_at + submission_delay`, or a
//! retry/resume deadline), with `now` injected by the caller so ordering is
//! reproducible in tests.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dray_core::SubmissionId;

use crate::submission::{Submission, SubmissionConfiguration, SubmissionKeyPair, SubmissionState};

/// A submission awaiting assignment to a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSubmission {
    /// Keys of the submission and its paired result record.
    pub key: SubmissionKeyPair,
    /// Opaque work description, carried for dispatcher inspection.
    pub payload: Value,
    /// Routing and delay options.
    pub configuration: SubmissionConfiguration,
    /// When the pending wrapper was created.
    pub created_at: DateTime<Utc>,
    /// When the submission becomes eligible for dispatch.
    pub ready_at: DateTime<Utc>,
    /// The store state a dispatch acceptance transitions from.
    ///
    /// `Submitted` for fresh and retried work, `Suspended` for work being
    /// re-offered after a checkpoint yield.
    pub dispatch_state: SubmissionState,
}

impl PendingSubmission {
    /// Creates a pending submission whose ready time honors the
    /// configuration's submission delay.
    #[must_use]
    pub fn new(
        key: SubmissionKeyPair,
        payload: Value,
        configuration: SubmissionConfiguration,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = chrono::Duration::from_std(configuration.submission_delay)
            .unwrap_or(chrono::Duration::MAX);
        Self {
            key,
            payload,
            configuration,
            created_at: now,
            ready_at: now + delay,
            dispatch_state: SubmissionState::Submitted,
        }
    }

    /// Creates the initial dispatch offer for a submission.
    ///
    /// The ready window is anchored to the submission's creation time, so
    /// `submission_delay` counts from when the client submitted, not from
    /// when the offer was enqueued.
    #[must_use]
    pub fn for_submission(submission: &Submission) -> Self {
        Self::new(
            submission.key_pair(),
            submission.payload.clone(),
            submission.configuration.clone(),
            submission.created_at,
        )
    }

    /// Creates a pending re-offer of a suspended submission, ready no
    /// sooner than `resume_delay` from `now`.
    #[must_use]
    pub fn resume(
        key: SubmissionKeyPair,
        payload: Value,
        configuration: SubmissionConfiguration,
        resume_delay: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = chrono::Duration::from_std(resume_delay).unwrap_or(chrono::Duration::MAX);
        Self {
            key,
            payload,
            configuration,
            created_at: now,
            ready_at: now + delay,
            dispatch_state: SubmissionState::Suspended,
        }
    }

    /// Returns the submission identifier.
    #[must_use]
    pub const fn submission_id(&self) -> SubmissionId {
        self.key.submission_id
    }

    /// Returns true if the submission is eligible for dispatch at `now`.
    #[must_use]
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.ready_at <= now
    }

    /// Pushes the ready time to `now + delay`, used for `RetryLater` requeues.
    pub fn delay_until(&mut self, delay: Duration, now: DateTime<Utc>) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.ready_at = now + delay;
    }
}

#[derive(Debug)]
struct QueueEntry {
    ready_at: DateTime<Utc>,
    seq: u64,
    pending: PendingSubmission,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// A priority queue of pending submissions ordered by ready time.
///
/// Insertion order breaks ties, so two submissions ready at the same
/// instant pop in arrival order. Discards are tombstoned and collapsed
/// lazily on pop, since each submission has at most one live entry.
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    live: HashSet<SubmissionId>,
    discarded: HashSet<SubmissionId>,
    seq: u64,
}

impl DelayQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a pending submission at its ready time.
    pub fn push(&mut self, pending: PendingSubmission) {
        let id = pending.submission_id();
        self.discarded.remove(&id);
        self.live.insert(id);
        self.seq += 1;
        self.heap.push(Reverse(QueueEntry {
            ready_at: pending.ready_at,
            seq: self.seq,
            pending,
        }));
    }

    /// Pops the next submission whose ready time has passed, skipping
    /// discarded entries.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<PendingSubmission> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.ready_at > now {
                return None;
            }
            let Reverse(entry) = self.heap.pop()?;
            let id = entry.pending.submission_id();
            if self.discarded.remove(&id) {
                continue;
            }
            self.live.remove(&id);
            return Some(entry.pending);
        }
        None
    }

    /// Returns the earliest ready time among live entries, if any.
    #[must_use]
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.heap
            .iter()
            .filter(|Reverse(e)| !self.discarded.contains(&e.pending.submission_id()))
            .map(|Reverse(e)| e.ready_at)
            .min()
    }

    /// Discards a still-pending submission.
    ///
    /// Returns true if an entry was discarded; discarding an unknown or
    /// already-discarded identifier is a no-op returning false.
    pub fn discard(&mut self, id: &SubmissionId) -> bool {
        if self.live.remove(id) {
            self.discarded.insert(*id);
            true
        } else {
            false
        }
    }

    /// Returns true if the queue holds a live entry for the identifier.
    #[must_use]
    pub fn contains(&self, id: &SubmissionId) -> bool {
        self.live.contains(id)
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Returns true if the queue holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
