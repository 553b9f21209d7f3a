mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use adforge_backend_core::db::{StepTracer, WorkItemStore};
use adforge_backend_core::pipeline::ads_automation::{
    ANALYZE_LANDING, GENERATE_ANGLE_IMAGES, GENERATE_COPIES, GENERATE_HEADLINES, RESOLVE_ANGLES,
};
use adforge_backend_core::ports::{PortError, Provider};
use adforge_backend_core::work_item::fragments::{AngleSource, LandingAnalysisResult};
use adforge_backend_core::work_item::trace::replay_fragments;
use adforge_backend_core::work_item::{StepOutcome, StepTraceEntry, WorkItemKind, WorkItemStatus};

use common::{angle, Harness};

fn trace(h: &Harness, id: &str) -> Vec<StepTraceEntry> {
    StepTracer::list(h.store.as_ref(), id).expect("trace should list")
}

fn analysis_with_two_angles() -> LandingAnalysisResult {
    LandingAnalysisResult {
        url: String::from("https://shop.example.com/chair"),
        summary: String::from("Ergonomic office chair"),
        angles: vec![angle("posture"), angle("focus")],
    }
}

#[test]
fn analysis_angles_drive_per_angle_steps() {
    let h = Harness::new();
    let item = h.create(
        WorkItemKind::Flow,
        json!({"title": "Chair", "landing_url": "https://shop.example.com/chair"}),
    );
    h.ports.push_analysis(Ok(analysis_with_two_angles()));

    let report = h
        .engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish")
        .expect("queued item should start");
    assert_eq!(report.status, WorkItemStatus::Completed);
    assert_eq!(report.steps_run, 8);
    assert_eq!(h.ports.call_count("angles"), 0);

    let stored = h.store.get(item.id.as_str()).expect("item should load");
    let angles = stored.result_fragments.angles().expect("angles resolved");
    assert_eq!(angles.source, AngleSource::Analysis);
    assert_eq!(angles.angles.len(), 2);
    for index in 0..2 {
        let headlines = stored
            .result_fragments
            .headlines(index)
            .expect("headlines per angle");
        assert_eq!(headlines.headlines.len(), 5);
        let copies = stored.result_fragments.copies(index).expect("copies per angle");
        assert_eq!(copies.copies.len(), 3);
        assert!(stored.result_fragments.angle_images(index).is_some());
    }

    let entries = trace(&h, item.id.as_str());
    let steps: Vec<(&str, Option<usize>)> = entries
        .iter()
        .map(|e| (e.entry.step_name.as_str(), e.entry.angle_index))
        .collect();
    assert_eq!(
        steps,
        vec![
            (ANALYZE_LANDING, None),
            (RESOLVE_ANGLES, None),
            (GENERATE_HEADLINES, Some(0)),
            (GENERATE_COPIES, Some(0)),
            (GENERATE_ANGLE_IMAGES, Some(0)),
            (GENERATE_HEADLINES, Some(1)),
            (GENERATE_COPIES, Some(1)),
            (GENERATE_ANGLE_IMAGES, Some(1)),
        ]
    );
    assert_eq!(entries[1].entry.provider, Provider::Internal);
    assert_eq!(replay_fragments(&entries), stored.result_fragments);
}

#[test]
fn analysis_angles_are_capped_by_requested_count() {
    let h = Harness::new();
    let item = h.create(
        WorkItemKind::Flow,
        json!({
            "title": "Chair",
            "landing_url": "https://shop.example.com/chair",
            "angle_count": 1
        }),
    );
    h.ports.push_analysis(Ok(analysis_with_two_angles()));
    h.engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish");

    let stored = h.store.get(item.id.as_str()).expect("item should load");
    let angles = stored.result_fragments.angles().expect("angles resolved");
    assert_eq!(angles.angles.len(), 1);
    assert!(stored.result_fragments.headlines(1).is_none());
}

#[test]
fn missing_landing_url_skips_analysis_and_generates_angles() {
    let h = Harness::new();
    let item = h.create(WorkItemKind::Flow, json!({"title": "Chair"}));

    let report = h
        .engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish")
        .expect("queued item should start");
    assert_eq!(report.status, WorkItemStatus::Completed);

    let entries = trace(&h, item.id.as_str());
    assert_eq!(entries.len(), 2 + 3 * 3);
    assert_eq!(entries[0].entry.outcome, StepOutcome::Skipped);
    assert!(entries[0].entry.response_summary.contains("no landing URL"));
    assert_eq!(entries[1].entry.provider, Provider::Copy);
    assert_eq!(h.ports.call_count("analyze"), 0);
    assert_eq!(h.ports.call_count("angles"), 1);

    let stored = h.store.get(item.id.as_str()).expect("item should load");
    assert!(stored.result_fragments.analysis().is_none());
    assert_eq!(
        stored.result_fragments.angles().map(|a| a.source),
        Some(AngleSource::Generated)
    );
}

#[test]
fn failed_analysis_falls_back_to_generated_angles() {
    let h = Harness::new();
    let item = h.create(
        WorkItemKind::Flow,
        json!({"title": "Chair", "landing_url": "https://shop.example.com/chair"}),
    );
    h.ports.push_analysis(Err(PortError::transient(
        Provider::LandingAnalysis,
        "landing page returned 503",
    )));

    let report = h
        .engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish")
        .expect("queued item should start");
    assert_eq!(report.status, WorkItemStatus::Completed);
    assert_eq!(report.failed_steps, vec![ANALYZE_LANDING.to_string()]);
    assert_eq!(h.ports.call_count("angles"), 1);

    let entries = trace(&h, item.id.as_str());
    assert_eq!(entries[0].entry.outcome, StepOutcome::Failed);
    assert!(!entries[0].entry.fatal);
}

#[test]
fn per_angle_failure_does_not_stop_other_angles() {
    let h = Harness::new();
    let item = h.create(WorkItemKind::Flow, json!({"title": "Chair", "angle_count": 2}));
    h.ports.push_angles(Ok(vec![angle("posture"), angle("focus")]));
    h.ports.push_headlines(Err(PortError::permanent(
        Provider::Copy,
        "model refused the prompt",
    )));

    let report = h
        .engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish")
        .expect("queued item should start");
    assert_eq!(report.status, WorkItemStatus::Completed);
    assert_eq!(report.failed_steps, vec![format!("{GENERATE_HEADLINES}[0]")]);

    let stored = h.store.get(item.id.as_str()).expect("item should load");
    assert!(stored.result_fragments.headlines(0).is_none());
    assert!(stored.result_fragments.copies(0).is_some());
    assert!(stored.result_fragments.headlines(1).is_some());
    assert_eq!(h.ports.call_count("copies"), 2);
}

#[test]
fn angle_resolution_failure_is_fatal() {
    let h = Harness::new();
    let item = h.create(WorkItemKind::Flow, json!({"title": "Chair"}));
    h.ports.push_angles(Ok(Vec::new()));

    let report = h
        .engine
        .claim_and_run(item.id.as_str())
        .expect("run should finish")
        .expect("queued item should start");
    assert_eq!(report.status, WorkItemStatus::Failed);

    let stored = h.store.get(item.id.as_str()).expect("item should load");
    assert!(stored
        .last_error
        .as_deref()
        .unwrap_or_default()
        .starts_with("resolve_angles:"));
    let entries = trace(&h, item.id.as_str());
    let outcomes: Vec<StepOutcome> = entries.iter().map(|e| e.entry.outcome).collect();
    assert_eq!(outcomes, vec![StepOutcome::Skipped, StepOutcome::Failed]);
    assert!(entries[1].entry.fatal);
    assert_eq!(h.ports.call_count("headlines"), 0);
}
