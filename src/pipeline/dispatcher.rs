//! Background execution of pipeline runs.
//!
//! `launch` claims the work item (draft/queued/failed -> running) in one
//! store transaction and only then hands the id to an executor, so at most
//! one run per item is ever in flight.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{BeginRun, SharedStepTracer, SharedWorkItemStore, StoreError};
use crate::pipeline::engine::PipelineEngine;
use crate::work_item::{ResultFragments, StepTraceEntry, WorkItemKind, WorkItemStatus};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run queue is full, work item '{0}' was not enqueued")]
    QueueFull(String),

    #[error("executor is shut down")]
    ExecutorClosed,

    #[error("failed to spawn run thread: {0}")]
    Spawn(String),

    #[error("timed out waiting for work item '{0}'")]
    Timeout(String),
}

pub trait Executor: Send + Sync + 'static {
    /// Starts the engine for an item that is already `running`. Must not
    /// block on the run itself.
    fn submit(&self, work_item_id: String) -> Result<(), DispatchError>;
}

pub type SharedExecutor = Arc<dyn Executor>;

/// Entry point both executors call. Infrastructure errors are already
/// logged and the item marked failed by the engine.
pub fn execute_run(engine: &PipelineEngine, work_item_id: &str) {
    if let Ok(report) = engine.run_or_mark_failed(work_item_id) {
        info!(
            work_item_id,
            status = report.status.as_str(),
            steps = report.steps_run,
            "run finished"
        );
    }
}

/// One OS thread per run.
pub struct InlineThreadExecutor {
    engine: Arc<PipelineEngine>,
}

impl InlineThreadExecutor {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self { engine }
    }
}

impl Executor for InlineThreadExecutor {
    fn submit(&self, work_item_id: String) -> Result<(), DispatchError> {
        let engine = self.engine.clone();
        let thread_name = format!("adforge-run-{}", short_id(work_item_id.as_str()));
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || execute_run(&engine, work_item_id.as_str()))
            .map(|_| ())
            .map_err(|e| DispatchError::Spawn(e.to_string()))
    }
}

/// Bounded queue drained by a fixed number of tokio workers; each run goes
/// to the blocking pool because ports use blocking HTTP.
pub struct TaskQueueExecutor {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueueExecutor {
    /// Must be called from inside a tokio runtime.
    pub fn start(engine: Arc<PipelineEngine>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<String>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(work_item_id) = next else {
                            break;
                        };
                        let engine = engine.clone();
                        let id = work_item_id.clone();
                        let joined = tokio::task::spawn_blocking(move || {
                            execute_run(&engine, id.as_str())
                        })
                        .await;
                        if let Err(join_err) = joined {
                            error!(
                                worker,
                                work_item_id = work_item_id.as_str(),
                                error = %join_err,
                                "run task panicked"
                            );
                        }
                    }
                })
            })
            .collect();
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Stops accepting runs and waits for queued ones to drain.
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Executor for TaskQueueExecutor {
    fn submit(&self, work_item_id: String) -> Result<(), DispatchError> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| DispatchError::ExecutorClosed)?;
        let sender = guard.as_ref().ok_or(DispatchError::ExecutorClosed)?;
        sender.try_send(work_item_id).map_err(|err| match err {
            mpsc::error::TrySendError::Full(id) => DispatchError::QueueFull(id),
            mpsc::error::TrySendError::Closed(_) => DispatchError::ExecutorClosed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchOutcome {
    pub work_item_id: String,
    pub status: WorkItemStatus,
    /// False when the item was already running or completed.
    pub started: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub work_item_id: String,
    pub kind: WorkItemKind,
    pub status: WorkItemStatus,
    pub result_fragments: ResultFragments,
    pub last_error: Option<String>,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<StepTraceEntry>>,
}

#[derive(Clone)]
pub struct RunDispatcher {
    store: SharedWorkItemStore,
    tracer: SharedStepTracer,
    executor: SharedExecutor,
}

impl RunDispatcher {
    pub fn new(
        store: SharedWorkItemStore,
        tracer: SharedStepTracer,
        executor: SharedExecutor,
    ) -> Self {
        Self {
            store,
            tracer,
            executor,
        }
    }

    pub fn launch(&self, work_item_id: &str) -> Result<LaunchOutcome, DispatchError> {
        match self.store.begin_run(work_item_id)? {
            BeginRun::Unchanged(status) => {
                info!(
                    work_item_id,
                    status = status.as_str(),
                    "launch ignored, run already active or finished"
                );
                Ok(LaunchOutcome {
                    work_item_id: work_item_id.to_string(),
                    status,
                    started: false,
                })
            }
            BeginRun::Started(item) => {
                if let Err(err) = self.executor.submit(item.id.clone()) {
                    error!(work_item_id, error = %err, "could not hand run to executor");
                    let message = format!("dispatch failed: {err}");
                    if let Err(mark_err) = self.store.mark_failed(work_item_id, message.as_str())
                    {
                        warn!(work_item_id, error = %mark_err, "could not mark work item failed");
                    }
                    return Err(err);
                }
                info!(work_item_id, kind = item.kind.as_str(), "run launched");
                Ok(LaunchOutcome {
                    work_item_id: item.id,
                    status: WorkItemStatus::Running,
                    started: true,
                })
            }
        }
    }

    pub fn get_status(
        &self,
        work_item_id: &str,
        include_trace: bool,
    ) -> Result<StatusView, DispatchError> {
        let item = self.store.get(work_item_id)?;
        let trace = if include_trace {
            Some(self.tracer.list(work_item_id)?)
        } else {
            None
        };
        Ok(StatusView {
            work_item_id: item.id,
            kind: item.kind,
            status: item.status,
            result_fragments: item.result_fragments,
            last_error: item.last_error,
            updated_at: item.updated_at,
            trace,
        })
    }

    /// Polls until the item leaves `running` (or was never launched).
    pub fn wait_for_terminal(
        &self,
        work_item_id: &str,
        poll_interval: Duration,
        timeout: Duration,
        include_trace: bool,
    ) -> Result<StatusView, DispatchError> {
        let deadline = Instant::now() + timeout;
        loop {
            let view = self.get_status(work_item_id, include_trace)?;
            if view.status != WorkItemStatus::Running {
                return Ok(view);
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::Timeout(work_item_id.to_string()));
            }
            std::thread::sleep(poll_interval);
        }
    }
}

fn short_id(value: &str) -> String {
    value.chars().take(8).collect()
}
