//! Pipeline definitions and the sequential step runner.
//!
//! A pipeline is a fixed list of stages. Each stage is either one step or a
//! group of steps repeated for every resolved ad angle. Steps are plain data:
//! a `derive` function that turns the input snapshot plus accumulated
//! fragments into a port request, and a `merge` function that turns the port
//! response back into fragments.

pub mod ads_automation;
pub mod dispatcher;
pub mod engine;
pub mod summary;

use thiserror::Error;

use crate::config::AppConfig;
use crate::ports::{PortRequest, PortResponse, ProductBrief, Provider};
use crate::work_item::fragments::AdAngle;
use crate::work_item::{Fragment, InputSnapshot, ResultFragments, WorkItemKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DerivationError(pub String);

impl DerivationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn unexpected_response(step: &str, response: &PortResponse) -> Self {
        let op = serde_json::to_value(response)
            .ok()
            .and_then(|v| v.get("op").and_then(|op| op.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from("unknown"));
        Self(format!("{step} received an unexpected '{op}' response"))
    }
}

/// What a step decided to do for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPlan {
    Call(PortRequest),
    Skip { reason: String },
    /// Fragments derived without calling a port.
    Resolved(Vec<Fragment>),
}

/// Run-wide knobs the step derivations read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub launch_campaigns: bool,
    pub campaign_objective: String,
    pub daily_budget_cents: u64,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            launch_campaigns: config.campaign.launch_enabled,
            campaign_objective: config.campaign.objective.clone(),
            daily_budget_cents: config.meta.daily_budget_cents,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            launch_campaigns: false,
            campaign_objective: String::from("OUTCOME_TRAFFIC"),
            daily_budget_cents: 2_000,
        }
    }
}

/// Everything a step may read when deriving its request.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub work_item_id: &'a str,
    pub snapshot: &'a InputSnapshot,
    /// Fragments produced so far in this run.
    pub fragments: &'a ResultFragments,
    /// Partial results that failed attempts on this item left in the trace.
    pub salvaged: &'a ResultFragments,
    pub angle: Option<(usize, &'a AdAngle)>,
    pub settings: &'a PipelineSettings,
}

impl StepInput<'_> {
    pub fn brief(&self) -> ProductBrief {
        ProductBrief::from_snapshot(self.snapshot)
    }

    pub fn require_angle(&self) -> Result<(usize, &AdAngle), DerivationError> {
        self.angle
            .ok_or_else(|| DerivationError::new("per-angle step run without an angle"))
    }
}

pub type DeriveFn = fn(&StepInput<'_>) -> Result<StepPlan, DerivationError>;
pub type MergeFn = fn(&StepInput<'_>, PortResponse) -> Result<Vec<Fragment>, DerivationError>;

#[derive(Clone, Copy)]
pub struct StepSpec {
    pub name: &'static str,
    pub provider: Provider,
    pub fatal_on_error: bool,
    pub derive: DeriveFn,
    pub merge: MergeFn,
}

impl std::fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("fatal_on_error", &self.fatal_on_error)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum PipelineStage {
    Single(StepSpec),
    ForEachAngle(Vec<StepSpec>),
}

#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: &'static str,
    pub stages: Vec<PipelineStage>,
}

impl PipelineDefinition {
    pub fn for_kind(kind: WorkItemKind) -> Self {
        match kind {
            WorkItemKind::Test => product_test::definition(),
            WorkItemKind::Flow => ads_automation::definition(),
        }
    }

    /// Step names in declaration order, with per-angle groups listed once.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .flat_map(|stage| match stage {
                PipelineStage::Single(spec) => vec![spec.name],
                PipelineStage::ForEachAngle(specs) => specs.iter().map(|s| s.name).collect(),
            })
            .collect()
    }
}

/// Image prompt shared by both pipelines: the override wins, otherwise the
/// product title and angle hook.
pub(crate) fn image_prompt(snapshot: &InputSnapshot, angle: Option<&AdAngle>) -> String {
    if let Some(custom) = snapshot
        .prompt_overrides
        .images
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return custom.to_string();
    }
    let mut prompt = format!(
        "Ad creative photo of {}, clean studio lighting, no text overlay",
        snapshot.title.trim()
    );
    if let Some(angle) = angle {
        prompt.push_str(format!(", conveying: {}", angle.hook).as_str());
    }
    prompt
}
