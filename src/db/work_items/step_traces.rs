use rusqlite::{params, TransactionBehavior};

use super::SqliteStore;
use crate::db::{StepTracer, StoreError};
use crate::ports::Provider;
use crate::work_item::{Fragment, NewStepTraceEntry, StepOutcome, StepTraceEntry};

impl StepTracer for SqliteStore {
    fn append(&self, work_item_id: &str, entry: &NewStepTraceEntry) -> Result<i64, StoreError> {
        let output_json = serde_json::to_string(&entry.output)?;
        self.with_connection_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM step_traces WHERE work_item_id = ?1",
                [work_item_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "
                INSERT INTO step_traces
                  (work_item_id, seq, step_name, angle_index, provider, request_summary,
                   response_summary, outcome, fatal, error, output_json, started_at, ended_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
                params![
                    work_item_id,
                    seq,
                    entry.step_name,
                    entry.angle_index.map(|v| v as i64),
                    entry.provider.as_str(),
                    entry.request_summary,
                    entry.response_summary,
                    entry.outcome.as_str(),
                    entry.fatal,
                    entry.error,
                    output_json,
                    entry.started_at,
                    entry.ended_at
                ],
            )?;
            tx.commit()?;
            Ok(seq)
        })
    }

    fn list(&self, work_item_id: &str) -> Result<Vec<StepTraceEntry>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT seq, step_name, angle_index, provider, request_summary, response_summary,
                       outcome, fatal, error, output_json, started_at, ended_at
                FROM step_traces
                WHERE work_item_id = ?1
                ORDER BY seq ASC
                ",
            )?;
            let mut rows = stmt.query([work_item_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let provider_raw: String = row.get("provider")?;
                let outcome_raw: String = row.get("outcome")?;
                let output_json: String = row.get("output_json")?;
                let angle_index: Option<i64> = row.get("angle_index")?;
                let output: Vec<Fragment> = serde_json::from_str(output_json.as_str())?;
                out.push(StepTraceEntry {
                    seq: row.get("seq")?,
                    entry: NewStepTraceEntry {
                        step_name: row.get("step_name")?,
                        angle_index: angle_index.map(|v| v.max(0) as usize),
                        provider: parse_provider(provider_raw.as_str())?,
                        request_summary: row.get("request_summary")?,
                        response_summary: row.get("response_summary")?,
                        outcome: StepOutcome::parse(outcome_raw.as_str()).ok_or_else(|| {
                            StoreError::Validation(format!("unknown step outcome '{outcome_raw}'"))
                        })?,
                        fatal: row.get("fatal")?,
                        error: row.get("error")?,
                        output,
                        started_at: row.get("started_at")?,
                        ended_at: row.get("ended_at")?,
                    },
                });
            }
            Ok(out)
        })
    }
}

fn parse_provider(value: &str) -> Result<Provider, StoreError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| StoreError::Validation(format!("unknown provider '{value}'")))
}
