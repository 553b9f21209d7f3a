pub mod work_items;

use std::sync::Arc;

use thiserror::Error;

use crate::work_item::{
    Fragment, InputSnapshot, NewStepTraceEntry, StepTraceEntry, WorkItem, WorkItemKind,
    WorkItemStatus,
};

pub use work_items::SqliteStore;

pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("work item '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("json error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    /// Generated when absent.
    pub id: Option<String>,
    pub kind: WorkItemKind,
    pub input_snapshot: InputSnapshot,
    pub status: WorkItemStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkItemFilter {
    pub status: Option<WorkItemStatus>,
    pub kind: Option<WorkItemKind>,
}

/// Result of trying to claim a work item for a new run.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginRun {
    /// The item moved to `running`; the caller owns the run.
    Started(WorkItem),
    /// Another run is active or the item already completed.
    Unchanged(WorkItemStatus),
}

pub trait WorkItemStore: Send + Sync + 'static {
    fn create(&self, input: NewWorkItem) -> Result<WorkItem, StoreError>;
    fn get(&self, id: &str) -> Result<WorkItem, StoreError>;
    fn list(&self, filter: &WorkItemFilter, limit: usize) -> Result<Vec<WorkItem>, StoreError>;

    /// Merges `patch` into the stored fragments per key and optionally moves
    /// the status. Keys are never removed.
    fn checkpoint(
        &self,
        id: &str,
        patch: &[Fragment],
        status: Option<WorkItemStatus>,
        last_error: Option<&str>,
    ) -> Result<WorkItem, StoreError>;

    fn begin_run(&self, id: &str) -> Result<BeginRun, StoreError>;
    fn update_input(&self, id: &str, snapshot: InputSnapshot) -> Result<WorkItem, StoreError>;
    fn mark_failed(&self, id: &str, message: &str) -> Result<WorkItem, StoreError>;
}

/// Append-only per-item step log.
pub trait StepTracer: Send + Sync + 'static {
    fn append(&self, work_item_id: &str, entry: &NewStepTraceEntry) -> Result<i64, StoreError>;
    fn list(&self, work_item_id: &str) -> Result<Vec<StepTraceEntry>, StoreError>;
}

pub type SharedWorkItemStore = Arc<dyn WorkItemStore>;
pub type SharedStepTracer = Arc<dyn StepTracer>;

pub fn clamp_list_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIST_LIMIT)
}
