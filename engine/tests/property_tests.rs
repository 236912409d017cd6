use kommandant_engine::conductor::types::{
    AggregateResult, DelegationStatus, TaskOutcome, TaskPriority, MAX_CONFIDENCE, MIN_CONFIDENCE,
};
use kommandant_engine::conductor::{Availability, LearningLoop, SpecialistRegistry};
use kommandant_engine::db::TaskStatus;
use proptest::prelude::*;
use sdk::SpecialistKind;

fn any_outcome() -> impl Strategy<Value = TaskOutcome> {
    prop_oneof![
        Just(TaskOutcome::Success),
        Just(TaskOutcome::PartialSuccess),
        Just(TaskOutcome::Failure),
        Just(TaskOutcome::Cancelled),
        Just(TaskOutcome::Timeout),
        Just(TaskOutcome::RequiresHuman),
    ]
}

// Load never drops below zero and availability always matches the load
proptest! {
    #[test]
    fn test_load_stays_consistent(
        max_load in 1u32..6,
        deltas in prop::collection::vec(-3i64..=3, 0..40),
    ) {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("doc", SpecialistKind::DocumentSpecialist, &[], max_load)
            .unwrap();

        let mut expected: i64 = 0;
        for delta in deltas {
            expected = (expected + delta).max(0);
            let load = registry.update_load("doc", delta).unwrap();
            prop_assert_eq!(i64::from(load), expected);

            let info = registry.get("doc").unwrap();
            let availability = if info.current_load == 0 {
                Availability::Available
            } else if info.current_load < info.max_load {
                Availability::Busy
            } else {
                Availability::Overloaded
            };
            prop_assert_eq!(info.availability, availability);
        }
    }
}

// Learned confidence stays inside its bounds whatever the outcome sequence
proptest! {
    #[test]
    fn test_confidence_stays_bounded(
        start in -1.0f64..2.0,
        outcomes in prop::collection::vec(any_outcome(), 0..60),
    ) {
        let learning = LearningLoop::new("kommandant_1");
        let mut value = learning.set_confidence("document_analysis", start);
        prop_assert!((MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&value));

        for outcome in outcomes {
            value = learning.set_confidence(
                "document_analysis",
                value + outcome.confidence_delta(),
            );
            prop_assert!((MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&value));
        }
        prop_assert_eq!(learning.confidence_for("document_analysis"), value);
    }
}

// Success requires fewer than half of the steps to fail
proptest! {
    #[test]
    fn test_success_threshold(total in 0usize..20, failed in 0usize..20) {
        let failed = failed.min(total);
        let success = AggregateResult::compute_success(total, failed);
        prop_assert_eq!(success, total > 0 && (failed as f64) < total as f64 / 2.0);
    }
}

proptest! {
    #[test]
    fn test_priority_levels_parse(level in 1u8..=5) {
        let parsed: TaskPriority = level.to_string().parse().unwrap();
        prop_assert_eq!(parsed.value(), level);
        let by_name: TaskPriority = parsed.as_str().parse().unwrap();
        prop_assert_eq!(by_name, parsed);
    }

    #[test]
    fn test_out_of_range_priority_rejected(level in 6u8..=255) {
        prop_assert!(level.to_string().parse::<TaskPriority>().is_err());
    }
}

#[test]
fn test_status_names_round_trip() {
    for status in TaskStatus::ALL {
        let parsed: TaskStatus = status.as_str().parse().unwrap();
        assert_eq!(parsed, status);
    }
    for outcome in [
        TaskOutcome::Success,
        TaskOutcome::PartialSuccess,
        TaskOutcome::Failure,
        TaskOutcome::Cancelled,
        TaskOutcome::Timeout,
        TaskOutcome::RequiresHuman,
    ] {
        let parsed: TaskOutcome = outcome.as_str().parse().unwrap();
        assert_eq!(parsed, outcome);
    }
    for status in [
        DelegationStatus::Completed,
        DelegationStatus::Failed,
        DelegationStatus::Timeout,
        DelegationStatus::SendFailed,
    ] {
        assert!(status.is_terminal());
    }
}
