//! 检查点与指标的并发 / 续跑性质

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use scriptorium::storage::{CheckpointTracker, Library, MetricUpdate, MetricsStore, StageState};
use serde_json::json;

#[test]
fn test_concurrent_disjoint_marks_bill_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(CheckpointTracker::open(dir.path().join(".checkpoint"), "book", "ocr"));
    let threads = 8u32;
    let per_thread = 25u32;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for unit in (t * per_thread + 1)..=((t + 1) * per_thread) {
                    tracker.mark_completed(unit, 0.01).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total = threads * per_thread;
    assert_eq!(tracker.completed_units().len(), total as usize);
    assert!((tracker.cumulative_cost() - 0.01 * total as f64).abs() < 1e-9);

    // 重新打开读到相同状态
    let reopened = CheckpointTracker::open(dir.path().join(".checkpoint"), "book", "ocr");
    assert_eq!(reopened.completed_units().len(), total as usize);
    assert!((reopened.cumulative_cost() - 0.01 * total as f64).abs() < 1e-9);
}

#[test]
fn test_concurrent_overlapping_marks_bill_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(CheckpointTracker::open(dir.path().join(".checkpoint"), "book", "ocr"));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut first = 0;
                for unit in 1..=40 {
                    if tracker.mark_completed(unit, 0.01).unwrap() {
                        first += 1;
                    }
                }
                first
            })
        })
        .collect();
    let first_marks: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(first_marks, 40);
    assert!((tracker.cumulative_cost() - 0.40).abs() < 1e-9);
}

#[test]
fn test_concurrent_metric_accumulation() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MetricsStore::open(dir.path().join("metrics.json")));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..25 {
                    store
                        .record("stage_run", MetricUpdate::new(0.001, 0.5).with_tokens(10), true)
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let record = store.get("stage_run").unwrap();
    assert!((record.cost_usd - 0.1).abs() < 1e-9);
    assert_eq!(record.tokens, 1000);

    let reopened = MetricsStore::open(dir.path().join("metrics.json"));
    assert_eq!(reopened.total_tokens(), 1000);
}

#[test]
fn test_resume_after_restart_returns_unfinished_units() {
    let dir = tempfile::tempdir().unwrap();
    {
        let lib = Library::open(dir.path()).unwrap();
        let stage = lib.stage("book", "ocr").unwrap();
        stage.checkpoint().get_remaining_units(5, true).unwrap();
        for unit in 1..=3 {
            stage.save_page(unit, &json!({"text": unit})).unwrap();
            stage.checkpoint().mark_completed(unit, 0.01).unwrap();
        }
    }

    let lib = Library::open(dir.path()).unwrap();
    let stage = lib.stage("book", "ocr").unwrap();
    assert_eq!(stage.checkpoint().get_remaining_units(5, true).unwrap(), vec![4, 5]);
    assert_eq!(stage.checkpoint().get_status().status, StageState::InProgress);

    // 产物被删除的单元会重新出现在待处理列表中
    std::fs::remove_file(stage.page_path(2)).unwrap();
    assert_eq!(stage.checkpoint().get_remaining_units(5, true).unwrap(), vec![2, 4, 5]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_resume_is_idempotent(total in 1u32..40, picks in proptest::collection::vec(1u32..40, 0..40)) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = CheckpointTracker::open(dir.path().join(".checkpoint"), "book", "ocr");
        let done: BTreeSet<u32> = picks.into_iter().filter(|u| *u <= total).collect();
        for unit in &done {
            tracker.mark_completed(*unit, 0.01).unwrap();
        }

        let first = tracker.get_remaining_units(total, true).unwrap();
        let second = tracker.get_remaining_units(total, true).unwrap();
        prop_assert_eq!(&first, &second);

        let expected: Vec<u32> = (1..=total).filter(|u| !done.contains(u)).collect();
        prop_assert_eq!(first, expected);
        prop_assert!((tracker.cumulative_cost() - 0.01 * done.len() as f64).abs() < 1e-9);
    }
}
