//! Durable, concurrency-safe billing receipt index (§4.5).
//!
//! Ports `receipt.py`'s `SCHEMA_SQL` / `ReceiptDB` onto `rusqlite`. WAL
//! journal mode lets the auditor and the orchestrator share one database
//! file without blocking each other's reads. Invariant enforced here (§3):
//! at most one receipt per `response_id` and at most one per `batch_id`.

use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    project TEXT NOT NULL,
    model TEXT NOT NULL,
    mode TEXT NOT NULL,
    flow_type TEXT NOT NULL,
    response_id TEXT,
    batch_id TEXT,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    tool_cost REAL NOT NULL,
    storage_cost REAL NOT NULL,
    total_cost REAL NOT NULL,
    pricing_verified INTEGER NOT NULL,
    notes TEXT NOT NULL DEFAULT '',
    log_paths_json TEXT NOT NULL DEFAULT '[]',
    usage_json TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_receipts_created_at ON receipts(created_at);
CREATE INDEX IF NOT EXISTS idx_receipts_project ON receipts(project);
CREATE INDEX IF NOT EXISTS idx_receipts_run_id ON receipts(run_id);
CREATE INDEX IF NOT EXISTS idx_receipts_response_id ON receipts(response_id);
CREATE INDEX IF NOT EXISTS idx_receipts_batch_id ON receipts(batch_id);
";

/// One billing receipt (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub project: String,
    pub model: String,
    pub mode: String,
    pub flow_type: String,
    pub response_id: Option<String>,
    pub batch_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_cost: f64,
    pub storage_cost: f64,
    pub total_cost: f64,
    pub pricing_verified: bool,
    pub notes: String,
    pub log_paths: Vec<String>,
    pub usage: serde_json::Value,
}

fn row_to_receipt(row: &rusqlite::Row) -> rusqlite::Result<Receipt> {
    let log_paths_json: String = row.get("log_paths_json")?;
    let usage_json: String = row.get("usage_json")?;
    let created_at: String = row.get("created_at")?;

    Ok(Receipt {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        project: row.get("project")?,
        model: row.get("model")?,
        mode: row.get("mode")?,
        flow_type: row.get("flow_type")?,
        response_id: row.get("response_id")?,
        batch_id: row.get("batch_id")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        tool_cost: row.get("tool_cost")?,
        storage_cost: row.get("storage_cost")?,
        total_cost: row.get("total_cost")?,
        pricing_verified: row.get::<_, i64>("pricing_verified")? != 0,
        notes: row.get("notes")?,
        log_paths: serde_json::from_str(&log_paths_json).unwrap_or_default(),
        usage: serde_json::from_str(&usage_json).unwrap_or(serde_json::Value::Null),
    })
}

/// Index structures used before inserting, to avoid ever double-counting a
/// response or batch (mirrors `ReceiptDB.existing_index`). The `*_cost` maps
/// carry `(row id, total_cost)` so a caller can decide whether an existing
/// row needs updating without a second query.
#[derive(Debug, Default)]
pub struct ExistingIndex {
    pub response_ids: HashSet<String>,
    pub batch_ids: HashSet<String>,
    pub run_ids: HashSet<String>,
    pub response_cost: std::collections::HashMap<String, (i64, f64)>,
    pub batch_cost: std::collections::HashMap<String, (i64, f64)>,
}

/// A `rusqlite` connection to the receipt database, opened in WAL mode.
pub struct ReceiptDb {
    conn: Connection,
}

impl ReceiptDb {
    pub fn open(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening receipt db {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Insert a new receipt, rejecting a duplicate `response_id`/`batch_id`
    /// the caller should have already checked via [`Self::existing_index`].
    pub fn insert(&self, receipt: &Receipt) -> Result<i64> {
        let log_paths_json = serde_json::to_string(&receipt.log_paths)?;
        let usage_json = serde_json::to_string(&receipt.usage)?;

        self.conn.execute(
            "INSERT INTO receipts (
                run_id, created_at, project, model, mode, flow_type,
                response_id, batch_id, input_tokens, output_tokens,
                tool_cost, storage_cost, total_cost, pricing_verified,
                notes, log_paths_json, usage_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                receipt.run_id,
                receipt.created_at.to_rfc3339(),
                receipt.project,
                receipt.model,
                receipt.mode,
                receipt.flow_type,
                receipt.response_id,
                receipt.batch_id,
                receipt.input_tokens,
                receipt.output_tokens,
                receipt.tool_cost,
                receipt.storage_cost,
                receipt.total_cost,
                receipt.pricing_verified as i64,
                receipt.notes,
                log_paths_json,
                usage_json,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent receipts first, capped at 1000 rows.
    pub fn query(&self) -> Result<Vec<Receipt>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM receipts ORDER BY created_at DESC LIMIT 1000",
        )?;
        let rows = stmt.query_map([], row_to_receipt)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Build dedup lookup structures for response/batch/run ids already
    /// present, so a caller can skip reconstructing a receipt that exists.
    pub fn existing_index(&self) -> Result<ExistingIndex> {
        let mut index = ExistingIndex::default();
        let mut stmt =
            self.conn.prepare("SELECT id, run_id, response_id, batch_id, total_cost FROM receipts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        for row in rows {
            let (id, run_id, response_id, batch_id, total_cost) = row?;
            index.run_ids.insert(run_id);
            if let Some(r) = response_id {
                index.response_ids.insert(r.clone());
                index.response_cost.insert(r, (id, total_cost));
            }
            if let Some(b) = batch_id {
                index.batch_ids.insert(b.clone());
                index.batch_cost.insert(b, (id, total_cost));
            }
        }
        Ok(index)
    }

    pub fn update_row(&self, id: i64, notes: &str) -> Result<()> {
        self.conn.execute("UPDATE receipts SET notes = ?1 WHERE id = ?2", params![notes, id])?;
        Ok(())
    }

    /// Overwrite every mutable field of an existing row with a freshly built
    /// receipt, keeping its `id`. Used when a reconciliation pass observes a
    /// materially different cost or usage for a `response_id`/`batch_id`
    /// already on file.
    pub fn update_receipt(&self, id: i64, receipt: &Receipt) -> Result<()> {
        let log_paths_json = serde_json::to_string(&receipt.log_paths)?;
        let usage_json = serde_json::to_string(&receipt.usage)?;
        self.conn.execute(
            "UPDATE receipts SET
                model = ?1, mode = ?2, flow_type = ?3,
                input_tokens = ?4, output_tokens = ?5,
                tool_cost = ?6, storage_cost = ?7, total_cost = ?8,
                pricing_verified = ?9, notes = ?10,
                log_paths_json = ?11, usage_json = ?12
            WHERE id = ?13",
            params![
                receipt.model,
                receipt.mode,
                receipt.flow_type,
                receipt.input_tokens,
                receipt.output_tokens,
                receipt.tool_cost,
                receipt.storage_cost,
                receipt.total_cost,
                receipt.pricing_verified as i64,
                receipt.notes,
                log_paths_json,
                usage_json,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_ids(&self, ids: &[i64]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            deleted += self.conn.execute("DELETE FROM receipts WHERE id = ?1", params![id])?;
        }
        Ok(deleted)
    }

    pub fn export_rows(&self) -> Result<Vec<Receipt>> {
        self.query()
    }

    pub fn find_by_response_id(&self, response_id: &str) -> Result<Option<Receipt>> {
        self.conn
            .query_row(
                "SELECT * FROM receipts WHERE response_id = ?1 LIMIT 1",
                params![response_id],
                row_to_receipt,
            )
            .optional()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_receipt(response_id: &str) -> Receipt {
        Receipt {
            id: None,
            run_id: "RUN_270720261030_AB12".to_string(),
            created_at: Utc::now(),
            project: "demo".to_string(),
            model: "gpt-4o".to_string(),
            mode: "GENERATE".to_string(),
            flow_type: "A".to_string(),
            response_id: Some(response_id.to_string()),
            batch_id: None,
            input_tokens: 100,
            output_tokens: 50,
            tool_cost: 0.0,
            storage_cost: 0.0,
            total_cost: 0.001,
            pricing_verified: true,
            notes: String::new(),
            log_paths: vec!["responses/resp-1.json".to_string()],
            usage: serde_json::json!({"input_tokens": 100, "output_tokens": 50}),
        }
    }

    #[test]
    fn insert_and_query_round_trips() {
        let db = ReceiptDb::in_memory().unwrap();
        db.insert(&sample_receipt("resp-1")).unwrap();
        let rows = db.query().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].response_id.as_deref(), Some("resp-1"));
    }

    #[test]
    fn existing_index_tracks_response_and_run_ids() {
        let db = ReceiptDb::in_memory().unwrap();
        db.insert(&sample_receipt("resp-1")).unwrap();
        let index = db.existing_index().unwrap();
        assert!(index.response_ids.contains("resp-1"));
        assert!(index.run_ids.contains("RUN_270720261030_AB12"));
    }

    #[test]
    fn find_by_response_id_returns_none_when_absent() {
        let db = ReceiptDb::in_memory().unwrap();
        assert!(db.find_by_response_id("missing").unwrap().is_none());
    }

    #[test]
    fn delete_ids_removes_rows() {
        let db = ReceiptDb::in_memory().unwrap();
        let id = db.insert(&sample_receipt("resp-1")).unwrap();
        assert_eq!(db.delete_ids(&[id]).unwrap(), 1);
        assert!(db.query().unwrap().is_empty());
    }

    #[test]
    fn open_creates_wal_backed_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("receipts.db")).unwrap();
        let db = ReceiptDb::open(&path).unwrap();
        db.insert(&sample_receipt("resp-1")).unwrap();
        assert_eq!(db.query().unwrap().len(), 1);
    }
}
