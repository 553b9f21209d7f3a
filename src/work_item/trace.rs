use serde::{Deserialize, Serialize};

use crate::ports::Provider;
use crate::work_item::fragments::{Fragment, ResultFragments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
    Skipped,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// A trace entry as produced by the engine, before the tracer assigns `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStepTraceEntry {
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle_index: Option<usize>,
    pub provider: Provider,
    pub request_summary: String,
    pub response_summary: String,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Vec<Fragment>,
    pub started_at: String,
    pub ended_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTraceEntry {
    pub seq: i64,
    #[serde(flatten)]
    pub entry: NewStepTraceEntry,
}

/// Rebuilds the fragment map by merging the output of every completed entry
/// in trace order.
pub fn replay_fragments(entries: &[StepTraceEntry]) -> ResultFragments {
    merge_outputs(entries, StepOutcome::Completed)
}

/// Partial results carried by failed entries, e.g. a product that was
/// created before its page failed. They never reach `result_fragments`.
pub fn salvaged_fragments(entries: &[StepTraceEntry]) -> ResultFragments {
    merge_outputs(entries, StepOutcome::Failed)
}

fn merge_outputs(entries: &[StepTraceEntry], outcome: StepOutcome) -> ResultFragments {
    let mut out = ResultFragments::new();
    for entry in entries.iter().filter(|e| e.entry.outcome == outcome) {
        out.merge(entry.entry.output.iter().cloned());
    }
    out
}
