mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use adforge_backend_core::db::{StepTracer, StoreError, WorkItemStore};
use adforge_backend_core::ports::Provider;
use adforge_backend_core::work_item::fragments::AngleHeadlines;
use adforge_backend_core::work_item::{
    Fragment, InputSnapshot, NewStepTraceEntry, StepOutcome, WorkItemStatus,
};

use common::Harness;

fn trace_entry(step: &str) -> NewStepTraceEntry {
    NewStepTraceEntry {
        step_name: step.to_string(),
        angle_index: None,
        provider: Provider::Copy,
        request_summary: String::from("{}"),
        response_summary: String::from("{}"),
        outcome: StepOutcome::Completed,
        fatal: false,
        error: None,
        output: Vec::new(),
        started_at: String::from("2026-01-01T00:00:00.000Z"),
        ended_at: String::from("2026-01-01T00:00:01.000Z"),
    }
}

#[test]
fn concurrent_checkpoints_never_lose_fragments() {
    let h = Harness::new();
    let item = h.chair_test();
    h.store.begin_run(item.id.as_str()).expect("claim");

    let handles: Vec<_> = (0..6usize)
        .map(|angle_index| {
            let store = Arc::clone(&h.store);
            let id = item.id.clone();
            std::thread::spawn(move || {
                let patch = [Fragment::Headlines(AngleHeadlines {
                    angle_index,
                    headlines: vec![format!("headline {angle_index}")],
                })];
                store
                    .checkpoint(id.as_str(), &patch, None, None)
                    .expect("checkpoint should succeed");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let stored = h.store.get(item.id.as_str()).expect("item should load");
    assert_eq!(stored.result_fragments.len(), 6);
    for angle_index in 0..6 {
        assert!(stored.result_fragments.headlines(angle_index).is_some());
    }
}

#[test]
fn concurrent_trace_appends_get_distinct_sequence_numbers() {
    let h = Harness::new();
    let item = h.chair_test();

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let store = Arc::clone(&h.store);
            let id = item.id.clone();
            std::thread::spawn(move || {
                store
                    .append(id.as_str(), &trace_entry(format!("step_{n}").as_str()))
                    .expect("append should succeed")
            })
        })
        .collect();
    let seqs: BTreeSet<i64> = handles
        .into_iter()
        .map(|handle| handle.join().expect("append thread"))
        .collect();
    assert_eq!(seqs, (1..=8).collect::<BTreeSet<i64>>());

    let listed = StepTracer::list(h.store.as_ref(), item.id.as_str()).expect("trace");
    let listed_seqs: Vec<i64> = listed.iter().map(|e| e.seq).collect();
    assert_eq!(listed_seqs, (1..=8).collect::<Vec<i64>>());
}

#[test]
fn input_edits_are_refused_while_running() {
    let h = Harness::new();
    let item = h.chair_test();
    let edited = InputSnapshot::from_json(json!({"title": "Desk chair"})).expect("snapshot");

    let updated = h
        .store
        .update_input(item.id.as_str(), edited.clone())
        .expect("queued item accepts edits");
    assert_eq!(updated.input_snapshot.title, "Desk chair");

    h.store.begin_run(item.id.as_str()).expect("claim");
    let err = h
        .store
        .update_input(item.id.as_str(), edited)
        .expect_err("running item refuses edits");
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[test]
fn completed_items_cannot_move_back_to_running() {
    let h = Harness::new();
    let item = h.chair_test();
    h.engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish");

    let err = h
        .store
        .checkpoint(item.id.as_str(), &[], Some(WorkItemStatus::Running), None)
        .expect_err("completed is terminal");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}
