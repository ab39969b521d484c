//! Property-based tests for engine invariants.
//!
//! These tests use proptest to verify invariants hold across randomly
//! generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use dray_flow::lease::Lease;
use dray_flow::pending::{DelayQueue, PendingSubmission};
use dray_flow::submission::{Submission, SubmissionConfiguration, SubmissionKeyPair, SubmissionState};
use dray_core::{ResultId, SubmissionId};

const ALL_STATES: [SubmissionState; 9] = [
    SubmissionState::Initial,
    SubmissionState::Submitted,
    SubmissionState::Assigned,
    SubmissionState::Executing,
    SubmissionState::Suspended,
    SubmissionState::Retry,
    SubmissionState::Done,
    SubmissionState::Failed,
    SubmissionState::Cancelled,
];

fn arb_state() -> impl Strategy<Value = SubmissionState> {
    prop::sample::select(ALL_STATES.to_vec())
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

proptest! {
    /// Any walk that only takes edges the state machine offers succeeds,
    /// and no walk continues past a terminal state.
    #[test]
    fn random_walks_follow_the_state_machine(steps in prop::collection::vec(0usize..8, 0..12)) {
        let mut submission = Submission::new(json!({}), SubmissionConfiguration::new());
        let mut observed = vec![submission.state];

        for step in steps {
            let options = submission.state.valid_transitions();
            if options.is_empty() {
                prop_assert!(submission.state.is_terminal());
                break;
            }
            let target = options[step % options.len()];
            submission.transition_to(target).expect("offered edge must be takeable");
            observed.push(submission.state);
        }

        // Every consecutive pair in the observed path is a legal edge.
        for pair in observed.windows(2) {
            prop_assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    /// `transition_to` succeeds exactly when the state machine allows the
    /// edge; a rejected transition leaves the submission untouched.
    #[test]
    fn transition_agrees_with_can_transition_to(from in arb_state(), to in arb_state()) {
        let mut submission = Submission::new(json!({}), SubmissionConfiguration::new());
        submission.state = from;

        let allowed = from.can_transition_to(to);
        let outcome = submission.transition_to(to);
        prop_assert_eq!(outcome.is_ok(), allowed);
        if allowed {
            prop_assert_eq!(submission.state, to);
        } else {
            prop_assert_eq!(submission.state, from);
        }
    }

    /// Terminal states never offer an exit edge.
    #[test]
    fn terminal_states_are_absorbing(to in arb_state()) {
        for terminal in [SubmissionState::Done, SubmissionState::Failed, SubmissionState::Cancelled] {
            prop_assert!(!terminal.can_transition_to(to));
        }
    }

    /// An active lease is valid exactly within its window.
    #[test]
    fn lease_validity_matches_its_window(
        duration_secs in 1i64..3600,
        probe_offset in 0i64..7200,
    ) {
        let lease = Lease::acquired(
            Duration::from_secs(duration_secs.unsigned_abs()),
            epoch(0),
        );
        let valid = lease.is_valid_at(epoch(probe_offset));
        prop_assert_eq!(valid, probe_offset <= duration_secs);
    }

    /// Extension resets the validity window from the extension time.
    #[test]
    fn extension_resets_the_window(
        duration_secs in 1i64..600,
        extend_at in 0i64..600,
    ) {
        let mut lease = Lease::acquired(
            Duration::from_secs(duration_secs.unsigned_abs()),
            epoch(0),
        );
        lease
            .extend(Duration::from_secs(duration_secs.unsigned_abs()), epoch(extend_at))
            .unwrap();
        prop_assert!(lease.is_valid_at(epoch(extend_at + duration_secs)));
        prop_assert!(!lease.is_valid_at(epoch(extend_at + duration_secs + 1)));
    }

    /// Without mutation, an invalid active lease never becomes valid again.
    #[test]
    fn invalidity_is_monotone(
        duration_secs in 1i64..600,
        first_probe in 0i64..2000,
        gap in 0i64..2000,
    ) {
        let lease = Lease::acquired(
            Duration::from_secs(duration_secs.unsigned_abs()),
            epoch(0),
        );
        if !lease.is_valid_at(epoch(first_probe)) {
            prop_assert!(!lease.is_valid_at(epoch(first_probe + gap)));
        }
    }

    /// The delay queue pops entries in nondecreasing ready-time order.
    #[test]
    fn delay_queue_pops_in_ready_order(delays in prop::collection::vec(0u64..120, 1..20)) {
        let mut queue = DelayQueue::new();
        let now = epoch(0);
        for delay in &delays {
            let key = SubmissionKeyPair::new(SubmissionId::generate(), ResultId::generate());
            let config = SubmissionConfiguration::new()
                .with_submission_delay(Duration::from_secs(*delay));
            queue.push(PendingSubmission::new(key, json!({}), config, now));
        }

        let mut popped = Vec::new();
        while let Some(pending) = queue.pop_ready(epoch(1000)) {
            popped.push(pending.ready_at);
        }
        prop_assert_eq!(popped.len(), delays.len());
        for pair in popped.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }
}
