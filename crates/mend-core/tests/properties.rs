//! Property tests for loop invariants

use chrono::{Duration, TimeZone, Utc};
use mend_core::{allowed_transitions, validate_transition, AuditAction, AuditLog, Incident, Phase};
use mend_model::{Event, ExecutionId, ExecutionInfo, ExecutionStatus, StepError, TargetId};
use mend_test_utils::{cooldown, session_error, test_config, FixedClassifier, Harness, CHAT};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

const PHASES: [Phase; 7] = [
    Phase::Monitoring,
    Phase::Analyzing,
    Phase::PendingApproval,
    Phase::Fixing,
    Phase::Testing,
    Phase::Resolved,
    Phase::Escalated,
];

fn phase() -> impl Strategy<Value = Phase> {
    prop::sample::select(PHASES.to_vec())
}

fn incident() -> Incident {
    let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let info = ExecutionInfo {
        id: ExecutionId::from("e1"),
        target_id: TargetId::from("wf"),
        status: ExecutionStatus::Error,
        finished: true,
        started_at: at,
        stopped_at: Some(at),
    };
    let error = StepError::new("HTTP", "NodeApiError", "boom");
    Incident::open(&Event::from_execution(&info, Some(&error)).unwrap(), at)
}

proptest! {
    #[test]
    fn only_listed_transitions_are_accepted(from in phase(), to in phase()) {
        let listed = allowed_transitions(from).contains(&to);
        prop_assert_eq!(validate_transition(from, to).is_ok(), listed);
        if from.is_terminal() {
            prop_assert!(!listed);
        }
    }

    #[test]
    fn random_walks_never_leave_a_terminal_phase(steps in prop::collection::vec(phase(), 0..40)) {
        let mut incident = incident();
        let mut finished = false;
        for to in steps {
            let ok = incident.transition(to).is_ok();
            if finished {
                prop_assert!(!ok);
            }
            finished |= incident.is_terminal();
        }
    }

    #[test]
    fn cooldown_measures_from_latest_anchor(
        attempt in prop::option::of(0i64..10_000),
        analysis in prop::option::of(0i64..10_000),
        now in 0i64..20_000,
        cooldown_secs in 0i64..5_000,
    ) {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut incident = incident();
        incident.last_attempt = attempt.map(|s| base + Duration::seconds(s));
        incident.last_analysis = analysis.map(|s| base + Duration::seconds(s));

        let latest = attempt.max(analysis);
        let expected = latest.map_or(true, |l| now - l >= cooldown_secs);
        prop_assert_eq!(
            incident.cooldown_elapsed(base + Duration::seconds(now), Duration::seconds(cooldown_secs)),
            expected
        );
    }

    #[test]
    fn audit_chain_detects_any_single_edit(
        resources in prop::collection::vec("[a-z]{1,8}", 1..12),
        victim in any::<prop::sample::Index>(),
    ) {
        let log = AuditLog::new();
        let at = Utc::now();
        for (i, resource) in resources.iter().enumerate() {
            log.record(AuditAction::Transition, resource.clone(), json!({ "n": i }), at).unwrap();
        }
        prop_assert!(log.verify_integrity().is_ok());

        let mut entries = log.entries();
        let i = victim.index(entries.len());
        entries[i].details = json!({ "n": "edited" });
        prop_assert!(mend_core::verify_chain(&entries).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn attempts_never_exceed_the_limit(waits in prop::collection::vec(0u8..3, 1..14)) {
        tokio_test::block_on(async {
            let config = test_config();
            let h = Harness::new(config.clone(), Arc::new(FixedClassifier::session(0.95)));
            h.target.set_fail_updates(true);
            h.fail(CHAT, session_error());

            for wait in waits {
                h.orchestrator.tick().await.unwrap();
                // 0: no wait, 1: half the cooldown, 2: a full cooldown
                match wait {
                    0 => {}
                    1 => h.advance(config.safety.cooldown() / 2),
                    _ => h.advance(cooldown(&config)),
                }
                for incident in h.orchestrator.active_incidents().await {
                    assert!(incident.attempts <= config.safety.max_attempts);
                }
            }
            let escalated: Vec<_> = h.orchestrator.history();
            assert!(escalated.len() <= 1);
            for incident in escalated {
                assert_eq!(incident.attempts, config.safety.max_attempts);
            }
        });
    }
}
