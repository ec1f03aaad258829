//! Property tests for classification

use mend_classifier::{Classifier, ErrorContext, RuleClassifier};
use mend_model::{ErrorCategory, TargetId};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("ECONNREFUSED: Connection refused".to_string()),
        Just("401 Unauthorized".to_string()),
        Just("Cannot read property 'id' of undefined".to_string()),
        Just("Session ID is required but not provided".to_string()),
        Just("HTTP 503 Service Unavailable".to_string()),
        Just("TypeError: x is not a function".to_string()),
        "[a-zA-Z0-9 :']{0,60}",
    ]
}

fn arb_step_type() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("n8n-nodes-base.httpRequest".to_string())),
        Just(Some("n8n-nodes-base.code".to_string())),
        Just(Some("@n8n/n8n-nodes-langchain.memoryBufferWindow".to_string())),
    ]
}

proptest! {
    #[test]
    fn classification_is_deterministic_and_bounded(
        text in arb_text(),
        step_type in arb_step_type(),
    ) {
        let ctx = ErrorContext::new(TargetId::from("wf"), text).with_step("Step", step_type);

        // separate instances so the cache cannot mask nondeterminism
        let first = RuleClassifier::with_defaults().unwrap();
        let second = RuleClassifier::with_defaults().unwrap();
        let (a, b) = runtime().block_on(async {
            (first.classify(&ctx).await, second.classify(&ctx).await)
        });

        prop_assert_eq!(a.category, b.category);
        prop_assert_eq!(a.confidence, b.confidence);
        prop_assert!((0.0..=1.0).contains(&a.confidence));
        prop_assert!(!a.strategies.is_empty());
        prop_assert_eq!(a.auto_apply, b.auto_apply);
        if a.category == ErrorCategory::Unknown {
            prop_assert!(!a.auto_apply);
        }
    }

    #[test]
    fn auto_apply_primary_never_exceeds_confidence_without_history(
        text in arb_text(),
        step_type in arb_step_type(),
    ) {
        let classifier = RuleClassifier::with_defaults().unwrap();
        let ctx = ErrorContext::new(TargetId::from("wf"), text).with_step("Step", step_type);
        let (category, confidence) = classifier.score(&ctx);
        let (strategies, auto) = classifier.rank(category, confidence, &ctx);
        if auto {
            prop_assert!(strategies[0].confidence_threshold <= confidence + 1e-9);
        } else {
            prop_assert!(strategies.iter().all(|s| s.confidence_threshold > confidence));
        }
    }
}

#[tokio::test]
async fn outcome_feedback_invalidates_cached_ranking() {
    let classifier = RuleClassifier::with_defaults().unwrap();
    let ctx = ErrorContext::new(TargetId::from("wf"), "HTTP 503 rate limit exceeded")
        .with_step("Call API", Some("n8n-nodes-base.httpRequest".into()));

    let before = classifier.classify(&ctx).await;
    assert_eq!(before.category, ErrorCategory::ExternalApi);

    for _ in 0..20 {
        classifier.record_outcome(mend_repair::StrategyKind::AddRetry, true);
    }
    let after = classifier.classify(&ctx).await;
    assert_eq!(after.category, before.category);
    assert_eq!(classifier.statistics().total_analyses, 2);
}
