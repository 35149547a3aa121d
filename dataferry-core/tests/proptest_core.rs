//! Property-based tests for core invariants.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

use dataferry_core::pipeline::PipelineStep;
use dataferry_core::retry::{RetryConfig, compute_backoff};
use dataferry_core::trigger::step_token;
use dataferry_core::{ArtifactLocator, DatasetRef, RunState, Schedule};

fn patterns() -> Vec<String> {
    vec![
        "covid data.csv".to_string(),
        "Covid Data.csv".to_string(),
        "*.csv".to_string(),
    ]
}

// --- Artifact locator ---

proptest! {
    #[test]
    fn locator_prefers_earlier_patterns(
        others in prop::collection::btree_set("[a-z]{1,8}\\.(csv|txt)", 0..6),
        exact in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        for name in &others {
            std::fs::write(dir.path().join(name), "a\n1\n").unwrap();
        }
        if exact {
            std::fs::write(dir.path().join("Covid Data.csv"), "a\n1\n").unwrap();
        }

        let locator = ArtifactLocator::new(&patterns()).unwrap();
        let found = locator.locate(dir.path()).unwrap();
        let first_csv = others.iter().find(|n| n.ends_with(".csv"));

        match (exact, first_csv) {
            (true, _) => prop_assert_eq!(found, Some(dir.path().join("Covid Data.csv"))),
            (false, Some(name)) => prop_assert_eq!(found, Some(dir.path().join(name))),
            (false, None) => prop_assert_eq!(found, None),
        }
    }

    #[test]
    fn locator_is_deterministic(names in prop::collection::btree_set("[a-z]{1,6}\\.csv", 1..8)) {
        let dir = TempDir::new().unwrap();
        for name in &names {
            std::fs::write(dir.path().join(name), "a\n1\n").unwrap();
        }
        let locator = ArtifactLocator::new(&patterns()).unwrap();
        let first = locator.locate(dir.path()).unwrap();
        let second = locator.locate(dir.path()).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.is_some());
    }
}

// --- Retry backoff ---

proptest! {
    #[test]
    fn backoff_never_exceeds_cap(
        initial in 1u64..10_000,
        cap in 1u64..60_000,
        multiplier in 1.0f64..4.0,
        attempt in 0u32..40,
    ) {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: initial,
            max_backoff_ms: cap,
            backoff_multiplier: multiplier,
            jitter: false,
        };
        prop_assert!(compute_backoff(&config, attempt) <= cap);
    }

    #[test]
    fn backoff_is_monotonic_without_jitter(initial in 1u64..1_000, attempt in 0u32..20) {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: initial,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        prop_assert!(compute_backoff(&config, attempt) <= compute_backoff(&config, attempt + 1));
    }
}

// --- Step inference from child output ---

proptest! {
    #[test]
    fn step_token_finds_step_field(
        prefix in "[ a-zA-Z0-9:=.]{0,30}",
        step in prop::sample::select(vec!["Fetching", "Staging", "Loading"]),
    ) {
        let line = format!("{} step={} duration_ms=3", prefix, step);
        prop_assert_eq!(step_token(&line), Some(step.to_string()));
    }

    #[test]
    fn step_token_ignores_suffixed_keys(value in "[A-Za-z]{1,10}") {
        let line = format!("next_step={} laststep={}", value, value);
        prop_assert_eq!(step_token(&line), None);
    }
}

// --- Dataset references and run states ---

proptest! {
    #[test]
    fn dataset_ref_display_roundtrips(
        owner in "[a-z0-9][a-z0-9_-]{0,15}",
        name in "[a-z0-9][a-z0-9_.-]{0,20}",
    ) {
        let text = format!("{}/{}", owner, name);
        let parsed = DatasetRef::parse(&text).unwrap();
        prop_assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn dataset_ref_rejects_extra_segments(a in "[a-z]{1,5}", b in "[a-z]{1,5}", c in "[a-z]{1,5}") {
        let text = format!("{}/{}/{}", a, b, c);
        prop_assert!(DatasetRef::parse(&text).is_err());
    }

    #[test]
    fn terminal_states_accept_no_transition(idx in 0usize..3) {
        let step = PipelineStep::ALL[idx];
        let failed = RunState::Failed { step, cause: "boom".into() };
        for next in [RunState::NotStarted, RunState::Fetching, RunState::Succeeded] {
            prop_assert!(!failed.can_transition_to(&next));
            prop_assert!(!RunState::Succeeded.can_transition_to(&next));
        }
    }
}

// --- Schedules ---

proptest! {
    #[test]
    fn daily_schedule_fires_within_a_day(secs in 0i64..(10 * 365 * 86_400)) {
        let schedule = Schedule::new("daily_ingest", "0 0 2 * * *", "UTC").unwrap();
        let after = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let next = schedule.next_after(after).unwrap();
        prop_assert!(next > after);
        prop_assert!(next - after <= chrono::Duration::days(1));
        prop_assert_eq!(next.format("%H:%M:%S").to_string(), "02:00:00");
    }
}
