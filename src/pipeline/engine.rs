use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::work_items::now_iso;
use crate::db::{BeginRun, SharedStepTracer, SharedWorkItemStore, StoreError};
use crate::pipeline::product_test::page_body_html;
use crate::pipeline::summary::{summarize, summarize_text};
use crate::pipeline::{
    PipelineDefinition, PipelineSettings, PipelineStage, StepInput, StepPlan, StepSpec,
};
use crate::ports::{
    CapabilityPorts, PortError, PortRequest, PortResponse, Provider, StorefrontPageUpdate,
};
use crate::work_item::fragments::AdAngle;
use crate::work_item::trace::salvaged_fragments;
use crate::work_item::{
    Fragment, NewStepTraceEntry, ResultFragments, StepOutcome, WorkItem, WorkItemStatus,
};

pub const UPDATE_STOREFRONT_PAGE: &str = "update_storefront_page";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("work item '{id}' is {status}, expected running")]
    NotRunning { id: String, status: &'static str },

    #[error("work item '{0}' has an active run")]
    RunActive(String),

    #[error("work item '{0}' has no published page")]
    NothingToRepublish(String),

    #[error(transparent)]
    Port(#[from] PortError),
}

/// In-memory state of one run: fragments produced by this run so far and
/// what earlier failed attempts salvaged.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub fragments: ResultFragments,
    pub salvaged: ResultFragments,
    steps_run: usize,
    failed_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub work_item_id: String,
    pub status: WorkItemStatus,
    pub steps_run: usize,
    pub failed_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepFlow {
    Continue,
    Abort,
}

enum Attempt {
    Completed {
        provider: Provider,
        request_summary: String,
        output: Vec<Fragment>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        provider: Provider,
        request_summary: String,
        error: String,
        /// Side effects the port reported before failing.
        salvaged: Vec<Fragment>,
    },
}

/// Sequential step runner. Holds no per-run state, so one engine serves any
/// number of concurrent runs on different work items.
#[derive(Clone)]
pub struct PipelineEngine {
    store: SharedWorkItemStore,
    tracer: SharedStepTracer,
    ports: CapabilityPorts,
    settings: PipelineSettings,
}

impl PipelineEngine {
    pub fn new(
        store: SharedWorkItemStore,
        tracer: SharedStepTracer,
        ports: CapabilityPorts,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            tracer,
            ports,
            settings,
        }
    }

    pub fn store(&self) -> &SharedWorkItemStore {
        &self.store
    }

    /// Claims the item and runs it on the calling thread. Returns `None`
    /// when the item is already running or completed.
    pub fn claim_and_run(&self, work_item_id: &str) -> Result<Option<RunReport>, EngineError> {
        match self.store.begin_run(work_item_id)? {
            BeginRun::Started(_) => self.run_or_mark_failed(work_item_id).map(Some),
            BeginRun::Unchanged(status) => {
                info!(
                    work_item_id,
                    status = status.as_str(),
                    "run not started, item already claimed"
                );
                Ok(None)
            }
        }
    }

    /// [`run`](Self::run), but a store or tracer error also moves the item to
    /// `failed` so it can be launched again. Every run entry point goes
    /// through here.
    pub fn run_or_mark_failed(&self, work_item_id: &str) -> Result<RunReport, EngineError> {
        let err = match self.run(work_item_id) {
            Ok(report) => return Ok(report),
            Err(err @ EngineError::NotRunning { .. }) => return Err(err),
            Err(err) => err,
        };
        error!(work_item_id, error = %err, "run aborted by infrastructure error");
        let message = summarize_text(format!("run aborted: {err}").as_str());
        if let Err(mark_err) = self.store.mark_failed(work_item_id, message.as_str()) {
            warn!(
                work_item_id,
                error = %mark_err,
                "could not mark work item failed"
            );
        }
        Err(err)
    }

    /// Runs the pipeline for an item that has already been moved to
    /// `running`. Step failures are recorded in the trace; only store and
    /// tracer failures surface as `Err`.
    pub fn run(&self, work_item_id: &str) -> Result<RunReport, EngineError> {
        let item = self.store.get(work_item_id)?;
        if item.status != WorkItemStatus::Running {
            return Err(EngineError::NotRunning {
                id: item.id,
                status: item.status.as_str(),
            });
        }
        let definition = PipelineDefinition::for_kind(item.kind);
        info!(
            work_item_id,
            pipeline = definition.name,
            "pipeline run started"
        );

        let mut ctx = RunContext {
            salvaged: salvaged_fragments(&self.tracer.list(work_item_id)?),
            ..RunContext::default()
        };
        for stage in definition.stages.iter() {
            let flow = match stage {
                PipelineStage::Single(spec) => self.run_step(&item, spec, None, &mut ctx)?,
                PipelineStage::ForEachAngle(specs) => self.run_angle_group(&item, specs, &mut ctx)?,
            };
            if flow == StepFlow::Abort {
                let failed = self.store.get(work_item_id)?;
                return Ok(report(&failed, &ctx));
            }
        }

        let done = self
            .store
            .checkpoint(work_item_id, &[], Some(WorkItemStatus::Completed), None)?;
        info!(
            work_item_id,
            steps = ctx.steps_run,
            failed_steps = ctx.failed_steps.len(),
            "pipeline run completed"
        );
        Ok(report(&done, &ctx))
    }

    fn run_angle_group(
        &self,
        item: &WorkItem,
        specs: &[StepSpec],
        ctx: &mut RunContext,
    ) -> Result<StepFlow, EngineError> {
        let angles: Vec<AdAngle> = ctx
            .fragments
            .angles()
            .map(|a| a.angles.clone())
            .unwrap_or_default();
        for (index, angle) in angles.iter().enumerate() {
            for spec in specs {
                if self.run_step(item, spec, Some((index, angle)), ctx)? == StepFlow::Abort {
                    return Ok(StepFlow::Abort);
                }
            }
        }
        Ok(StepFlow::Continue)
    }

    fn run_step(
        &self,
        item: &WorkItem,
        spec: &StepSpec,
        angle: Option<(usize, &AdAngle)>,
        ctx: &mut RunContext,
    ) -> Result<StepFlow, EngineError> {
        let started_at = now_iso();
        let attempt = {
            let input = StepInput {
                work_item_id: item.id.as_str(),
                snapshot: &item.input_snapshot,
                fragments: &ctx.fragments,
                salvaged: &ctx.salvaged,
                angle,
                settings: &self.settings,
            };
            self.attempt(spec, &input)
        };
        let angle_index = angle.map(|(index, _)| index);
        ctx.steps_run += 1;

        let mut entry = NewStepTraceEntry {
            step_name: spec.name.to_string(),
            angle_index,
            provider: Provider::Internal,
            request_summary: String::new(),
            response_summary: String::new(),
            outcome: StepOutcome::Completed,
            fatal: false,
            error: None,
            output: Vec::new(),
            started_at,
            ended_at: String::new(),
        };

        match attempt {
            Attempt::Completed {
                provider,
                request_summary,
                output,
            } => {
                entry.provider = provider;
                entry.request_summary = request_summary;
                entry.response_summary = summarize(&output);
                entry.output = output;
                entry.ended_at = now_iso();
                self.tracer.append(item.id.as_str(), &entry)?;
                self.store
                    .checkpoint(item.id.as_str(), entry.output.as_slice(), None, None)?;
                ctx.fragments.merge(entry.output.iter().cloned());
                info!(
                    work_item_id = item.id.as_str(),
                    step = spec.name,
                    angle_index = ?angle_index,
                    provider = provider.as_str(),
                    "step completed"
                );
                Ok(StepFlow::Continue)
            }
            Attempt::Skipped { reason } => {
                entry.outcome = StepOutcome::Skipped;
                entry.response_summary = summarize_text(reason.as_str());
                entry.ended_at = now_iso();
                self.tracer.append(item.id.as_str(), &entry)?;
                info!(
                    work_item_id = item.id.as_str(),
                    step = spec.name,
                    reason = reason.as_str(),
                    "step skipped"
                );
                Ok(StepFlow::Continue)
            }
            Attempt::Failed {
                provider,
                request_summary,
                error,
                salvaged,
            } => {
                let error = summarize_text(error.as_str());
                entry.provider = provider;
                entry.request_summary = request_summary;
                entry.response_summary = error.clone();
                entry.outcome = StepOutcome::Failed;
                entry.fatal = spec.fatal_on_error;
                entry.error = Some(error.clone());
                entry.output = salvaged;
                entry.ended_at = now_iso();
                self.tracer.append(item.id.as_str(), &entry)?;
                ctx.salvaged.merge(entry.output.iter().cloned());
                ctx.failed_steps.push(match angle_index {
                    Some(index) => format!("{}[{index}]", spec.name),
                    None => spec.name.to_string(),
                });

                if spec.fatal_on_error {
                    let last_error = format!("{}: {error}", spec.name);
                    self.store.checkpoint(
                        item.id.as_str(),
                        &[],
                        Some(WorkItemStatus::Failed),
                        Some(last_error.as_str()),
                    )?;
                    warn!(
                        work_item_id = item.id.as_str(),
                        step = spec.name,
                        error = error.as_str(),
                        "fatal step failed, run aborted"
                    );
                    return Ok(StepFlow::Abort);
                }
                warn!(
                    work_item_id = item.id.as_str(),
                    step = spec.name,
                    angle_index = ?angle_index,
                    error = error.as_str(),
                    "step failed, continuing"
                );
                Ok(StepFlow::Continue)
            }
        }
    }

    fn attempt(&self, spec: &StepSpec, input: &StepInput<'_>) -> Attempt {
        let plan = match (spec.derive)(input) {
            Ok(plan) => plan,
            Err(error) => {
                return Attempt::Failed {
                    provider: Provider::Internal,
                    request_summary: String::new(),
                    error: format!("could not derive request: {error}"),
                    salvaged: Vec::new(),
                }
            }
        };
        match plan {
            StepPlan::Skip { reason } => Attempt::Skipped { reason },
            StepPlan::Resolved(output) => Attempt::Completed {
                provider: Provider::Internal,
                request_summary: String::from("resolved without a port call"),
                output,
            },
            StepPlan::Call(request) => {
                let provider = request.provider();
                let request_summary = summarize(&request);
                match self.call_port(&request) {
                    Ok(response) => match (spec.merge)(input, response) {
                        Ok(output) => Attempt::Completed {
                            provider,
                            request_summary,
                            output,
                        },
                        Err(error) => Attempt::Failed {
                            provider,
                            request_summary,
                            error: format!("unusable response: {error}"),
                            salvaged: Vec::new(),
                        },
                    },
                    Err(error) => Attempt::Failed {
                        provider,
                        request_summary,
                        error: describe_port_error(&error),
                        salvaged: error.partial,
                    },
                }
            }
        }
    }

    fn call_port(&self, request: &PortRequest) -> Result<PortResponse, PortError> {
        self.ports.call(request)
    }

    /// Pushes the latest landing copy to an already published page. Adds an
    /// `update_storefront_page` trace entry; the item's status is unchanged.
    pub fn republish_page(&self, work_item_id: &str) -> Result<WorkItem, EngineError> {
        let item = self.store.get(work_item_id)?;
        if item.status == WorkItemStatus::Running {
            return Err(EngineError::RunActive(item.id));
        }
        let current = item
            .result_fragments
            .page()
            .cloned()
            .ok_or_else(|| EngineError::NothingToRepublish(item.id.clone()))?;
        let landing = item.result_fragments.landing_copy();
        let request = PortRequest::UpdateStorefrontPage(StorefrontPageUpdate {
            current,
            page_title: landing
                .map(|l| l.headline.clone())
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| item.input_snapshot.title.trim().to_string()),
            page_body_html: page_body_html(&item.input_snapshot, landing),
        });

        let mut entry = NewStepTraceEntry {
            step_name: String::from(UPDATE_STOREFRONT_PAGE),
            angle_index: None,
            provider: request.provider(),
            request_summary: summarize(&request),
            response_summary: String::new(),
            outcome: StepOutcome::Completed,
            fatal: false,
            error: None,
            output: Vec::new(),
            started_at: now_iso(),
            ended_at: String::new(),
        };

        match self.call_port(&request) {
            Ok(PortResponse::Storefront(page)) => {
                entry.output = vec![Fragment::Page(page)];
                entry.response_summary = summarize(&entry.output);
                entry.ended_at = now_iso();
                self.tracer.append(work_item_id, &entry)?;
                let updated =
                    self.store
                        .checkpoint(work_item_id, entry.output.as_slice(), None, None)?;
                info!(work_item_id, "storefront page republished");
                Ok(updated)
            }
            Ok(other) => {
                let error = PortError::permanent(
                    Provider::Storefront,
                    format!("unexpected response {}", summarize(&other)),
                );
                self.record_republish_failure(work_item_id, entry, &error)?;
                Err(EngineError::Port(error))
            }
            Err(error) => {
                self.record_republish_failure(work_item_id, entry, &error)?;
                Err(EngineError::Port(error))
            }
        }
    }

    fn record_republish_failure(
        &self,
        work_item_id: &str,
        mut entry: NewStepTraceEntry,
        error: &PortError,
    ) -> Result<(), EngineError> {
        let message = summarize_text(describe_port_error(error).as_str());
        entry.outcome = StepOutcome::Failed;
        entry.response_summary = message.clone();
        entry.error = Some(message);
        entry.ended_at = now_iso();
        self.tracer.append(work_item_id, &entry)?;
        warn!(work_item_id, error = %error, "storefront page republish failed");
        Ok(())
    }
}

fn describe_port_error(error: &PortError) -> String {
    let kind = if error.is_transient() {
        "transient"
    } else {
        "permanent"
    };
    format!("{} {kind} error: {}", error.provider.as_str(), error.message)
}

fn report(item: &WorkItem, ctx: &RunContext) -> RunReport {
    RunReport {
        work_item_id: item.id.clone(),
        status: item.status,
        steps_run: ctx.steps_run,
        failed_steps: ctx.failed_steps.clone(),
        last_error: item.last_error.clone(),
    }
}
