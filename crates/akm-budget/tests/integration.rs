//! Integration tests for the akm-budget crate: the public surface as the
//! proxy uses it — check before forwarding, record after a response.

use akm_budget::{BudgetError, BudgetTracker};

#[tokio::test]
async fn check_record_cycle_over_a_day() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = BudgetTracker::open(dir.path().join("budget.json")).unwrap();
    tracker.set_config("openai", 5, 0).unwrap();

    // Five requests pass, the sixth is rejected with usage figures.
    for _ in 0..5 {
        tracker.check("openai").unwrap();
        tracker.record("openai");
    }

    let err = tracker.check("openai").unwrap_err();
    match err {
        BudgetError::Exceeded { used, limit, .. } => {
            assert_eq!(used, 5);
            assert_eq!(limit, 5);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Other providers are unaffected.
    tracker.check("anthropic").unwrap();
}

#[tokio::test]
async fn stats_reflect_recorded_usage() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = BudgetTracker::open(dir.path().join("budget.json")).unwrap();
    tracker.set_config("anthropic", 100, 1000).unwrap();

    tracker.record("anthropic");
    tracker.record("anthropic");

    let stats = tracker.all_stats();
    let s = stats.iter().find(|s| s.provider == "anthropic").unwrap();
    assert_eq!(s.daily_count, 2);
    assert_eq!(s.monthly_count, 2);
    assert_eq!(s.daily_limit, 100);
}
