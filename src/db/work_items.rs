mod step_traces;

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{
    clamp_list_limit, BeginRun, NewWorkItem, StoreError, WorkItemFilter, WorkItemStore,
};
use crate::work_item::{
    Fragment, InputSnapshot, ResultFragments, WorkItem, WorkItemKind, WorkItemStatus,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed work item store and step tracer. Every operation opens its
/// own connection, so one value can be shared across run threads.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.with_connection(|_| Ok(()))
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        Ok(conn)
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.open()?;
        func(&conn)
    }

    fn with_connection_mut<T, F>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.open()?;
        func(&mut conn)
    }
}

impl WorkItemStore for SqliteStore {
    fn create(&self, input: NewWorkItem) -> Result<WorkItem, StoreError> {
        if !matches!(input.status, WorkItemStatus::Queued | WorkItemStatus::Draft) {
            return Err(StoreError::Validation(format!(
                "new work items must be queued or draft, got '{}'",
                input.status.as_str()
            )));
        }
        input
            .input_snapshot
            .validate()
            .map_err(StoreError::Validation)?;
        let id = match input.id {
            Some(raw) => normalize_id(raw.as_str()).ok_or_else(|| {
                StoreError::Validation(format!("work item id '{raw}' is not valid"))
            })?,
            None => Uuid::new_v4().to_string(),
        };
        let input_json = serde_json::to_string(&input.input_snapshot)?;

        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if fetch_work_item(&tx, id.as_str())?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "work item '{id}' already exists"
                )));
            }
            let now = now_iso();
            tx.execute(
                "
                INSERT INTO work_items
                  (id, kind, status, input_json, fragments_json, last_error, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, '{}', NULL, ?5, ?5)
                ",
                params![
                    id,
                    input.kind.as_str(),
                    input.status.as_str(),
                    input_json,
                    now
                ],
            )?;
            let created = require_work_item(&tx, id.as_str())?;
            tx.commit()?;
            debug!(work_item_id = id.as_str(), kind = input.kind.as_str(), "work item created");
            Ok(created)
        })
    }

    fn get(&self, id: &str) -> Result<WorkItem, StoreError> {
        self.with_connection(|conn| require_work_item(conn, id))
    }

    fn list(&self, filter: &WorkItemFilter, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        self.with_connection(|conn| {
            let status = filter.status.map(WorkItemStatus::as_str);
            let kind = filter.kind.map(WorkItemKind::as_str);
            let mut stmt = conn.prepare(
                "
                SELECT id, kind, status, input_json, fragments_json, last_error, created_at, updated_at
                FROM work_items
                WHERE (?1 IS NULL OR status = ?1)
                  AND (?2 IS NULL OR kind = ?2)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?3
                ",
            )?;
            let mut rows = stmt.query(params![status, kind, clamp_list_limit(limit) as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(WorkItemRow::from_row(row)?.into_work_item()?);
            }
            Ok(out)
        })
    }

    fn checkpoint(
        &self,
        id: &str,
        patch: &[Fragment],
        status: Option<WorkItemStatus>,
        last_error: Option<&str>,
    ) -> Result<WorkItem, StoreError> {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = require_work_item(&tx, id)?;

            let next_status = match status {
                Some(next) if next != current.status => {
                    if !current.status.can_transition_to(next) {
                        return Err(StoreError::InvalidTransition {
                            from: current.status.as_str(),
                            to: next.as_str(),
                        });
                    }
                    next
                }
                _ => current.status,
            };
            let next_error = if next_status == WorkItemStatus::Failed {
                last_error
                    .map(str::to_string)
                    .or_else(|| current.last_error.clone())
            } else {
                None
            };

            let mut fragments = current.result_fragments;
            fragments.merge(patch.iter().cloned());
            let fragments_json = serde_json::to_string(&fragments)?;

            tx.execute(
                "
                UPDATE work_items
                SET fragments_json = ?2, status = ?3, last_error = ?4, updated_at = ?5
                WHERE id = ?1
                ",
                params![
                    id,
                    fragments_json,
                    next_status.as_str(),
                    next_error,
                    now_iso()
                ],
            )?;
            let updated = require_work_item(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
    }

    fn begin_run(&self, id: &str) -> Result<BeginRun, StoreError> {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "
                UPDATE work_items
                SET status = 'running', last_error = NULL, updated_at = ?2
                WHERE id = ?1 AND status IN ('draft', 'queued', 'failed')
                ",
                params![id, now_iso()],
            )?;
            let item = require_work_item(&tx, id)?;
            tx.commit()?;
            if changed == 1 {
                Ok(BeginRun::Started(item))
            } else {
                Ok(BeginRun::Unchanged(item.status))
            }
        })
    }

    fn update_input(&self, id: &str, snapshot: InputSnapshot) -> Result<WorkItem, StoreError> {
        snapshot.validate().map_err(StoreError::Validation)?;
        let input_json = serde_json::to_string(&snapshot)?;
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = require_work_item(&tx, id)?;
            if !current.status.accepts_input_edits() {
                return Err(StoreError::Conflict(format!(
                    "input of work item '{id}' cannot change while {}",
                    current.status.as_str()
                )));
            }
            tx.execute(
                "UPDATE work_items SET input_json = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, input_json, now_iso()],
            )?;
            let updated = require_work_item(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
    }

    fn mark_failed(&self, id: &str, message: &str) -> Result<WorkItem, StoreError> {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = require_work_item(&tx, id)?;
            if current.status != WorkItemStatus::Running {
                return Err(StoreError::InvalidTransition {
                    from: current.status.as_str(),
                    to: WorkItemStatus::Failed.as_str(),
                });
            }
            tx.execute(
                "
                UPDATE work_items
                SET status = 'failed', last_error = ?2, updated_at = ?3
                WHERE id = ?1
                ",
                params![id, message, now_iso()],
            )?;
            let updated = require_work_item(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
    }
}

struct WorkItemRow {
    id: String,
    kind: String,
    status: String,
    input_json: String,
    fragments_json: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            status: row.get("status")?,
            input_json: row.get("input_json")?,
            fragments_json: row.get("fragments_json")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_work_item(self) -> Result<WorkItem, StoreError> {
        let kind = WorkItemKind::parse(self.kind.as_str()).ok_or_else(|| {
            StoreError::Validation(format!("unknown work item kind '{}'", self.kind))
        })?;
        let status = WorkItemStatus::parse(self.status.as_str()).ok_or_else(|| {
            StoreError::Validation(format!("unknown work item status '{}'", self.status))
        })?;
        let input_snapshot: InputSnapshot = serde_json::from_str(self.input_json.as_str())?;
        let result_fragments: ResultFragments =
            serde_json::from_str(self.fragments_json.as_str())?;
        Ok(WorkItem {
            id: self.id,
            kind,
            status,
            input_snapshot,
            result_fragments,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS work_items (
          id TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          status TEXT NOT NULL,
          input_json TEXT NOT NULL,
          fragments_json TEXT NOT NULL DEFAULT '{}',
          last_error TEXT,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
        CREATE INDEX IF NOT EXISTS idx_work_items_created ON work_items(created_at);

        CREATE TABLE IF NOT EXISTS step_traces (
          work_item_id TEXT NOT NULL,
          seq INTEGER NOT NULL,
          step_name TEXT NOT NULL,
          angle_index INTEGER,
          provider TEXT NOT NULL,
          request_summary TEXT NOT NULL DEFAULT '',
          response_summary TEXT NOT NULL DEFAULT '',
          outcome TEXT NOT NULL,
          fatal INTEGER NOT NULL DEFAULT 0,
          error TEXT,
          output_json TEXT NOT NULL DEFAULT '[]',
          started_at TEXT NOT NULL,
          ended_at TEXT NOT NULL,
          PRIMARY KEY(work_item_id, seq),
          FOREIGN KEY(work_item_id) REFERENCES work_items(id) ON DELETE CASCADE
        );
    ",
    )?;
    Ok(())
}

fn fetch_work_item(conn: &Connection, id: &str) -> Result<Option<WorkItem>, StoreError> {
    let row = conn
        .query_row(
            "
            SELECT id, kind, status, input_json, fragments_json, last_error, created_at, updated_at
            FROM work_items
            WHERE id = ?1
            ",
            [id],
            WorkItemRow::from_row,
        )
        .optional()?;
    row.map(WorkItemRow::into_work_item).transpose()
}

fn require_work_item(conn: &Connection, id: &str) -> Result<WorkItem, StoreError> {
    fetch_work_item(conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return None;
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return None;
    }
    Some(trimmed.to_string())
}

pub(crate) fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::fragments::{AdAngle, AngleSource, AnglesResult, CampaignResult};
    use pretty_assertions::assert_eq;

    fn temp_store() -> SqliteStore {
        let root = std::env::temp_dir().join(format!("adforge_store_test_{}", Uuid::new_v4()));
        SqliteStore::new(root.join("var/backend/adforge.db"))
    }

    fn snapshot(title: &str) -> InputSnapshot {
        InputSnapshot {
            title: title.to_string(),
            benefits: vec![String::from("comfort")],
            ..InputSnapshot::default()
        }
    }

    fn new_item(id: &str, kind: WorkItemKind) -> NewWorkItem {
        NewWorkItem {
            id: Some(id.to_string()),
            kind,
            input_snapshot: snapshot("Chair"),
            status: WorkItemStatus::Queued,
        }
    }

    fn angles_fragment(names: &[&str]) -> Fragment {
        Fragment::Angles(AnglesResult {
            angles: names
                .iter()
                .map(|n| AdAngle {
                    name: (*n).to_string(),
                    hook: String::from("hook"),
                    audience: None,
                })
                .collect(),
            source: AngleSource::Generated,
        })
    }

    #[test]
    fn create_then_get_round_trips_snapshot() {
        let store = temp_store();
        let created = store
            .create(new_item("wi-1", WorkItemKind::Test))
            .expect("item should be created");
        assert_eq!(created.status, WorkItemStatus::Queued);
        assert!(created.result_fragments.is_empty());

        let loaded = store.get("wi-1").expect("item should load");
        assert_eq!(loaded.input_snapshot, snapshot("Chair"));
        assert_eq!(loaded.kind, WorkItemKind::Test);
    }

    #[test]
    fn duplicate_id_is_a_conflict() {
        let store = temp_store();
        store
            .create(new_item("wi-dup", WorkItemKind::Test))
            .expect("first create should succeed");
        let err = store
            .create(new_item("wi-dup", WorkItemKind::Flow))
            .expect_err("second create should fail");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn create_generates_id_and_rejects_running_status() {
        let store = temp_store();
        let created = store
            .create(NewWorkItem {
                id: None,
                ..new_item("ignored", WorkItemKind::Flow)
            })
            .expect("item should be created");
        assert!(Uuid::parse_str(created.id.as_str()).is_ok());

        let err = store
            .create(NewWorkItem {
                status: WorkItemStatus::Running,
                ..new_item("wi-running", WorkItemKind::Test)
            })
            .expect_err("running is not a valid initial status");
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn checkpoint_merges_without_dropping_keys() {
        let store = temp_store();
        store
            .create(new_item("wi-merge", WorkItemKind::Test))
            .expect("item should be created");
        store.begin_run("wi-merge").expect("run should begin");

        store
            .checkpoint("wi-merge", &[angles_fragment(&["comfort"])], None, None)
            .expect("first checkpoint");
        let after = store
            .checkpoint(
                "wi-merge",
                &[Fragment::Campaign(CampaignResult::skipped("placeholder"))],
                None,
                None,
            )
            .expect("second checkpoint");
        assert_eq!(
            after.result_fragments.keys().collect::<Vec<_>>(),
            vec!["angles", "campaign"]
        );

        let replaced = store
            .checkpoint("wi-merge", &[angles_fragment(&["price", "style"])], None, None)
            .expect("replacement checkpoint");
        assert_eq!(replaced.result_fragments.len(), 2);
        assert_eq!(
            replaced.result_fragments.angles().map(|a| a.angles.len()),
            Some(2)
        );
    }

    #[test]
    fn failed_checkpoint_is_idempotent_and_records_error() {
        let store = temp_store();
        store
            .create(new_item("wi-fail", WorkItemKind::Test))
            .expect("item should be created");
        store.begin_run("wi-fail").expect("run should begin");

        let first = store
            .checkpoint("wi-fail", &[], Some(WorkItemStatus::Failed), Some("boom"))
            .expect("failed checkpoint");
        let second = store
            .checkpoint("wi-fail", &[], Some(WorkItemStatus::Failed), Some("boom"))
            .expect("repeat checkpoint");
        assert_eq!(first.status, WorkItemStatus::Failed);
        assert_eq!(second.last_error.as_deref(), Some("boom"));
        assert_eq!(first.result_fragments, second.result_fragments);
    }

    #[test]
    fn checkpoint_rejects_illegal_transition() {
        let store = temp_store();
        store
            .create(new_item("wi-illegal", WorkItemKind::Test))
            .expect("item should be created");
        let err = store
            .checkpoint("wi-illegal", &[], Some(WorkItemStatus::Completed), None)
            .expect_err("queued cannot complete");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn begin_run_claims_once_and_clears_last_error() {
        let store = temp_store();
        store
            .create(new_item("wi-begin", WorkItemKind::Test))
            .expect("item should be created");

        assert!(matches!(
            store.begin_run("wi-begin").expect("first begin"),
            BeginRun::Started(_)
        ));
        assert_eq!(
            store.begin_run("wi-begin").expect("second begin"),
            BeginRun::Unchanged(WorkItemStatus::Running)
        );

        store
            .mark_failed("wi-begin", "store offline")
            .expect("mark failed");
        match store.begin_run("wi-begin").expect("relaunch") {
            BeginRun::Started(item) => assert_eq!(item.last_error, None),
            other => panic!("expected relaunch to start, got {other:?}"),
        }
    }

    #[test]
    fn begin_run_on_unknown_id_is_not_found() {
        let store = temp_store();
        let err = store.begin_run("missing").expect_err("unknown id");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn update_input_only_outside_active_runs() {
        let store = temp_store();
        store
            .create(new_item("wi-input", WorkItemKind::Test))
            .expect("item should be created");
        let updated = store
            .update_input("wi-input", snapshot("Lamp"))
            .expect("queued input is editable");
        assert_eq!(updated.input_snapshot.title, "Lamp");

        store.begin_run("wi-input").expect("run should begin");
        let err = store
            .update_input("wi-input", snapshot("Desk"))
            .expect_err("running input is frozen");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let store = temp_store();
        for (id, kind) in [
            ("wi-a", WorkItemKind::Test),
            ("wi-b", WorkItemKind::Flow),
            ("wi-c", WorkItemKind::Test),
        ] {
            store.create(new_item(id, kind)).expect("item should be created");
        }
        let tests = store
            .list(
                &WorkItemFilter {
                    status: None,
                    kind: Some(WorkItemKind::Test),
                },
                10,
            )
            .expect("list should succeed");
        assert_eq!(
            tests.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["wi-c", "wi-a"]
        );

        let limited = store
            .list(&WorkItemFilter::default(), 0)
            .expect("limit should clamp to 1");
        assert_eq!(limited.len(), 1);
    }
}
