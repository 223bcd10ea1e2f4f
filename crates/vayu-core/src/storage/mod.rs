mod migrations;

use crate::error::VayuError;
use crate::metrics::Percentiles;
use crate::model::{ErrorCode, MetricPoint, ResultRecord, RunStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pagination cursor for the `list_*` streaming accessors.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: 100 }
    }
}

#[derive(Debug, Clone)]
pub struct ResultsPage {
    pub records: Vec<ResultRecord>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsPage {
    pub points: Vec<MetricPoint>,
    pub total: u64,
}

/// Summary row for `list_runs` — the metadata admin/recovery callers need,
/// not a full config snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummaryRow {
    pub id: Uuid,
    pub run_type: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RunsPage {
    pub runs: Vec<RunSummaryRow>,
    pub total: u64,
}

/// Thin pass-through records for the collection/request/environment CRUD
/// surface — the engine applies no validation or transformation beyond
/// read/write; request-builder semantics belong to the (out-of-scope)
/// desktop shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub variables: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub name: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub active: bool,
}

fn parse_uuid_col(raw: &str, col: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_timestamp_col(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

const BUSY_TIMEOUT_MS: u64 = 5_000;
const BUSY_RETRY_ATTEMPTS: u32 = 5;

/// Embedded relational store, one per engine instance. Wraps a single
/// `rusqlite::Connection` behind a blocking mutex; every operation runs
/// inside `spawn_blocking` so callers on the async runtime never stall on
/// SQLite's synchronous API.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl Storage {
    pub fn open(data_dir: &Path) -> Result<Self, VayuError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("vayu.db");
        let conn = Connection::open(db_path)?;
        Self::configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, VayuError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> Result<(), VayuError> {
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA mmap_size = 268435456;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Runs `f` against the connection on a blocking-pool thread, retrying a
    /// bounded number of times on `SQLITE_BUSY` within the busy timeout.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, VayuError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("storage mutex poisoned");
            let mut attempt = 0;
            loop {
                match f(&guard) {
                    Ok(v) => return Ok(v),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < BUSY_RETRY_ATTEMPTS =>
                    {
                        attempt += 1;
                        std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|e| VayuError::Internal(format!("storage task panicked: {e}")))?
        .map_err(VayuError::from)
    }

    // -- runs -----------------------------------------------------------

    pub async fn create_run(&self, run_id: Uuid, run_type: &str, config_snapshot: serde_json::Value) -> Result<(), VayuError> {
        let snapshot = config_snapshot.to_string();
        let run_type = run_type.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (id, type, status, start_time, end_time, config_snapshot_json, request_id, environment_id)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, NULL)",
                params![run_id.to_string(), run_type, RunStatus::Pending.to_string(), now, snapshot],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn update_run_status(&self, run_id: Uuid, status: RunStatus, end_time: Option<DateTime<Utc>>) -> Result<(), VayuError> {
        let end = end_time.map(|t| t.to_rfc3339());
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE runs SET status = ?1, end_time = ?2 WHERE id = ?3",
                params![status.to_string(), end, run_id.to_string()],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> Result<Option<String>, VayuError> {
        self.with_conn(move |conn| {
            conn.query_row("SELECT status FROM runs WHERE id = ?1", params![run_id.to_string()], |row| row.get(0))
                .optional()
        })
        .await
    }

    /// Paginated run listing, most recent first.
    pub async fn list_runs(&self, pagination: Pagination) -> Result<RunsPage, VayuError> {
        self.with_conn(move |conn| {
            let total: u64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
            let mut stmt = conn.prepare(
                "SELECT id, type, status, start_time, end_time FROM runs ORDER BY start_time DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![pagination.limit, pagination.offset], row_to_run_summary)?;
            let runs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(RunsPage { runs, total })
        })
        .await
    }

    /// Startup recovery: any run still marked `running`/`pending`/`stopping`
    /// was orphaned by a prior crash (nothing can be driving its worker task
    /// anymore) and is reconciled to `failed`. Returns the number reconciled.
    pub async fn reconcile_stale_runs(&self) -> Result<u64, VayuError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE runs SET status = ?1, end_time = ?2 WHERE status IN ('pending', 'running', 'stopping')",
                params![RunStatus::Failed.to_string(), now],
            )
            .map(|n| n as u64)
        })
        .await
    }

    // -- results ----------------------------------------------------------

    /// Appends a batch of result records in a single transaction, as the
    /// flush step does exactly once per run.
    pub async fn append_results_batch(&self, run_id: Uuid, records: Vec<ResultRecord>) -> Result<(), VayuError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            insert_results(&tx, run_id, &records)?;
            tx.commit()
        })
        .await?;
        Ok(())
    }

    /// Single-transaction terminal flush: the results batch (errors +
    /// sampled successes) and the run's status-code/percentile histogram
    /// row, committed together.
    pub async fn flush_run_results(
        &self,
        run_id: Uuid,
        records: Vec<ResultRecord>,
        status_codes: HashMap<u16, u64>,
        percentiles: Percentiles,
    ) -> Result<(), VayuError> {
        let status_codes_json = serde_json::to_string(&status_codes)?;
        let percentiles_json = serde_json::to_string(&percentiles)?;
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            insert_results(&tx, run_id, &records)?;
            tx.execute(
                "INSERT INTO histograms (run_id, status_codes_json, percentiles_json, recorded_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET status_codes_json = excluded.status_codes_json, percentiles_json = excluded.percentiles_json, recorded_at = excluded.recorded_at",
                params![run_id.to_string(), status_codes_json, percentiles_json, now],
            )?;
            tx.commit()
        })
        .await?;
        Ok(())
    }

    pub async fn list_results(&self, run_id: Uuid, pagination: Pagination) -> Result<ResultsPage, VayuError> {
        self.with_conn(move |conn| {
            let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM results WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT timestamp, status_code, latency_ms, error_code, error_message, trace_json
                 FROM results WHERE run_id = ?1 ORDER BY seq ASC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![run_id.to_string(), pagination.limit, pagination.offset], |row| {
                let timestamp: String = row.get(0)?;
                let error_code: Option<String> = row.get(3)?;
                let trace: Option<String> = row.get(5)?;
                Ok(ResultRecord {
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    status_code: row.get(1)?,
                    latency_ms: row.get(2)?,
                    error_code: error_code.and_then(|c| serde_json::from_str::<ErrorCode>(&format!("\"{c}\"")).ok()),
                    error_message: row.get(4)?,
                    trace: trace.and_then(|t| serde_json::from_str(&t).ok()),
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ResultsPage { records, total })
        })
        .await
    }

    // -- metrics ------------------------------------------------------------

    pub async fn append_metric_point(&self, point: MetricPoint) -> Result<(), VayuError> {
        self.with_conn(move |conn| {
            let name = serde_json::to_value(point.name).unwrap().as_str().unwrap().to_string();
            let labels = point.labels.as_ref().map(|l| l.to_string());
            conn.execute(
                "INSERT INTO metrics (run_id, timestamp, name, value, labels_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![point.run_id.to_string(), point.timestamp.to_rfc3339(), name, point.value, labels],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn list_metric_points(&self, run_id: Uuid, pagination: Pagination) -> Result<MetricsPage, VayuError> {
        self.with_conn(move |conn| {
            let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM metrics WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT timestamp, name, value, labels_json FROM metrics WHERE run_id = ?1
                 ORDER BY timestamp ASC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![run_id.to_string(), pagination.limit, pagination.offset], |row| {
                let timestamp: String = row.get(0)?;
                let name: String = row.get(1)?;
                let labels: Option<String> = row.get(3)?;
                Ok(MetricPoint {
                    run_id,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    name: serde_json::from_str(&format!("\"{name}\"")).unwrap_or(crate::model::MetricName::Throughput),
                    value: row.get(2)?,
                    labels: labels.and_then(|l| serde_json::from_str(&l).ok()),
                })
            })?;
            let points = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(MetricsPage { points, total })
        })
        .await
    }

    // -- config -------------------------------------------------------------

    pub async fn config_set(&self, key: String, value: String, type_tag: String) -> Result<(), VayuError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO config (key, value, type) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, type = excluded.type",
                params![key, value, type_tag],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String, String)>, VayuError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value, type FROM config ORDER BY key")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    // -- collections / requests / environments — thin pass-through ----------

    pub async fn create_collection(&self, name: String, parent_id: Option<Uuid>, variables: serde_json::Value) -> Result<CollectionRecord, VayuError> {
        let id = Uuid::new_v4();
        let updated_at = Utc::now();
        let record = CollectionRecord { id, name, parent_id, variables, updated_at };
        let insert = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO collections (id, name, parent_id, variables_json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    insert.id.to_string(),
                    insert.name,
                    insert.parent_id.map(|p| p.to_string()),
                    insert.variables.to_string(),
                    insert.updated_at.to_rfc3339(),
                ],
            )
        })
        .await?;
        Ok(record)
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionRecord>, VayuError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, parent_id, variables_json, updated_at FROM collections ORDER BY updated_at DESC")?;
            let rows = stmt.query_map([], row_to_collection)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_collection(&self, id: Uuid) -> Result<Option<CollectionRecord>, VayuError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, parent_id, variables_json, updated_at FROM collections WHERE id = ?1",
                params![id.to_string()],
                row_to_collection,
            )
            .optional()
        })
        .await
    }

    pub async fn delete_collection(&self, id: Uuid) -> Result<(), VayuError> {
        self.with_conn(move |conn| conn.execute("DELETE FROM collections WHERE id = ?1", params![id.to_string()]))
            .await?;
        Ok(())
    }

    pub async fn create_request(&self, input: RequestRecord) -> Result<RequestRecord, VayuError> {
        let insert = input.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO requests (id, collection_id, name, method, url, headers_json, body_json, auth_json, scripts_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    insert.id.to_string(),
                    insert.collection_id.to_string(),
                    insert.name,
                    insert.method,
                    insert.url,
                    insert.headers.to_string(),
                    insert.body.as_ref().map(|b| b.to_string()),
                    insert.auth.as_ref().map(|a| a.to_string()),
                    insert.scripts.as_ref().map(|s| s.to_string()),
                    insert.created_at.to_rfc3339(),
                ],
            )
        })
        .await?;
        Ok(input)
    }

    pub async fn list_requests(&self, collection_id: Option<Uuid>) -> Result<Vec<RequestRecord>, VayuError> {
        self.with_conn(move |conn| match collection_id {
            Some(collection_id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, collection_id, name, method, url, headers_json, body_json, auth_json, scripts_json, created_at
                     FROM requests WHERE collection_id = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![collection_id.to_string()], row_to_request)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, collection_id, name, method, url, headers_json, body_json, auth_json, scripts_json, created_at
                     FROM requests ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], row_to_request)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
        })
        .await
    }

    pub async fn get_request(&self, id: Uuid) -> Result<Option<RequestRecord>, VayuError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, collection_id, name, method, url, headers_json, body_json, auth_json, scripts_json, created_at
                 FROM requests WHERE id = ?1",
                params![id.to_string()],
                row_to_request,
            )
            .optional()
        })
        .await
    }

    pub async fn delete_request(&self, id: Uuid) -> Result<(), VayuError> {
        self.with_conn(move |conn| conn.execute("DELETE FROM requests WHERE id = ?1", params![id.to_string()]))
            .await?;
        Ok(())
    }

    pub async fn create_environment(&self, name: String, variables: serde_json::Value, active: bool) -> Result<EnvironmentRecord, VayuError> {
        let id = Uuid::new_v4();
        let record = EnvironmentRecord { id, name, variables, active };
        let insert = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO environments (id, name, variables_json, active_bool) VALUES (?1, ?2, ?3, ?4)",
                params![insert.id.to_string(), insert.name, insert.variables.to_string(), insert.active],
            )
        })
        .await?;
        Ok(record)
    }

    pub async fn list_environments(&self) -> Result<Vec<EnvironmentRecord>, VayuError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, variables_json, active_bool FROM environments ORDER BY name")?;
            let rows = stmt.query_map([], row_to_environment)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_environment(&self, id: Uuid) -> Result<Option<EnvironmentRecord>, VayuError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, variables_json, active_bool FROM environments WHERE id = ?1",
                params![id.to_string()],
                row_to_environment,
            )
            .optional()
        })
        .await
    }

    pub async fn delete_environment(&self, id: Uuid) -> Result<(), VayuError> {
        self.with_conn(move |conn| conn.execute("DELETE FROM environments WHERE id = ?1", params![id.to_string()]))
            .await?;
        Ok(())
    }

    /// Flat key/value store backing `pm.globals` — scoped to the whole
    /// engine, unlike environment variables which are scoped per-environment.
    pub async fn list_globals(&self) -> Result<Vec<(String, String)>, VayuError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM globals ORDER BY key")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn set_global(&self, key: String, value: String) -> Result<(), VayuError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO globals (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn delete_global(&self, key: String) -> Result<(), VayuError> {
        self.with_conn(move |conn| conn.execute("DELETE FROM globals WHERE key = ?1", params![key]))
            .await?;
        Ok(())
    }
}

/// Shared by `append_results_batch` and `flush_run_results` so both insert
/// sequential rows the same way.
fn insert_results(tx: &rusqlite::Transaction, run_id: Uuid, records: &[ResultRecord]) -> rusqlite::Result<()> {
    let start_seq: i64 = tx.query_row("SELECT COALESCE(MAX(seq), -1) FROM results WHERE run_id = ?1", params![run_id.to_string()], |row| row.get(0))?;
    let mut stmt = tx.prepare(
        "INSERT INTO results (run_id, seq, timestamp, status_code, latency_ms, error_code, error_message, trace_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (i, record) in records.iter().enumerate() {
        let seq = start_seq + 1 + i as i64;
        let error_code = record.error_code.map(|c| c.to_string());
        let trace = record.trace.as_ref().map(|t| t.to_string());
        stmt.execute(params![
            run_id.to_string(),
            seq,
            record.timestamp.to_rfc3339(),
            record.status_code,
            record.latency_ms,
            error_code,
            record.error_message,
            trace,
        ])?;
    }
    Ok(())
}

fn row_to_run_summary(row: &Row) -> rusqlite::Result<RunSummaryRow> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let start_time: String = row.get(3)?;
    let end_time: Option<String> = row.get(4)?;
    Ok(RunSummaryRow {
        id: parse_uuid_col(&id, 0)?,
        run_type: row.get(1)?,
        status: serde_json::from_str(&format!("\"{status}\"")).unwrap_or(RunStatus::Failed),
        start_time: parse_timestamp_col(&start_time),
        end_time: end_time.as_deref().map(parse_timestamp_col),
    })
}

fn row_to_collection(row: &Row) -> rusqlite::Result<CollectionRecord> {
    let id: String = row.get(0)?;
    let parent_id: Option<String> = row.get(2)?;
    let variables_json: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(CollectionRecord {
        id: parse_uuid_col(&id, 0)?,
        name: row.get(1)?,
        parent_id: parent_id.map(|p| parse_uuid_col(&p, 2)).transpose()?,
        variables: serde_json::from_str(&variables_json).unwrap_or(serde_json::Value::Null),
        updated_at: parse_timestamp_col(&updated_at),
    })
}

fn row_to_request(row: &Row) -> rusqlite::Result<RequestRecord> {
    let id: String = row.get(0)?;
    let collection_id: String = row.get(1)?;
    let headers_json: String = row.get(5)?;
    let body_json: Option<String> = row.get(6)?;
    let auth_json: Option<String> = row.get(7)?;
    let scripts_json: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(RequestRecord {
        id: parse_uuid_col(&id, 0)?,
        collection_id: parse_uuid_col(&collection_id, 1)?,
        name: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        headers: serde_json::from_str(&headers_json).unwrap_or(serde_json::Value::Null),
        body: body_json.and_then(|b| serde_json::from_str(&b).ok()),
        auth: auth_json.and_then(|a| serde_json::from_str(&a).ok()),
        scripts: scripts_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_timestamp_col(&created_at),
    })
}

fn row_to_environment(row: &Row) -> rusqlite::Result<EnvironmentRecord> {
    let id: String = row.get(0)?;
    Ok(EnvironmentRecord {
        id: parse_uuid_col(&id, 0)?,
        name: row.get(1)?,
        variables: {
            let json: String = row.get(2)?;
            serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
        },
        active: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricName;

    #[tokio::test]
    async fn create_and_get_run_status() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage.create_run(run_id, "constant_rps", serde_json::json!({"a": 1})).await.unwrap();
        let status = storage.get_run_status(run_id).await.unwrap();
        assert_eq!(status.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn update_run_status_transitions_and_sets_end_time() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage.create_run(run_id, "iterations", serde_json::json!({})).await.unwrap();
        storage.update_run_status(run_id, RunStatus::Completed, Some(Utc::now())).await.unwrap();
        let status = storage.get_run_status(run_id).await.unwrap();
        assert_eq!(status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn append_and_list_results_batch() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage.create_run(run_id, "iterations", serde_json::json!({})).await.unwrap();

        let records = vec![
            ResultRecord {
                timestamp: Utc::now(),
                status_code: Some(200),
                latency_ms: 12.5,
                error_code: None,
                error_message: None,
                trace: None,
            },
            ResultRecord {
                timestamp: Utc::now(),
                status_code: None,
                latency_ms: 1000.0,
                error_code: Some(ErrorCode::Timeout),
                error_message: Some("deadline exceeded".to_string()),
                trace: None,
            },
        ];
        storage.append_results_batch(run_id, records).await.unwrap();

        let page = storage.list_results(run_id, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].status_code, Some(200));
        assert_eq!(page.records[1].error_code, Some(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn append_results_batch_appends_not_overwrites() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage.create_run(run_id, "iterations", serde_json::json!({})).await.unwrap();

        let make = || ResultRecord {
            timestamp: Utc::now(),
            status_code: Some(200),
            latency_ms: 1.0,
            error_code: None,
            error_message: None,
            trace: None,
        };
        storage.append_results_batch(run_id, vec![make()]).await.unwrap();
        storage.append_results_batch(run_id, vec![make(), make()]).await.unwrap();

        let page = storage.list_results(run_id, Pagination { offset: 0, limit: 100 }).await.unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn metric_points_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage
            .append_metric_point(MetricPoint {
                run_id,
                timestamp: Utc::now(),
                name: MetricName::CurrentRps,
                value: 512.0,
                labels: None,
            })
            .await
            .unwrap();

        let page = storage.list_metric_points(run_id, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.points[0].value, 512.0);
        assert_eq!(page.points[0].name, MetricName::CurrentRps);
    }

    #[tokio::test]
    async fn config_set_is_upsert() {
        let storage = Storage::open_in_memory().unwrap();
        storage.config_set("max_rps".into(), "1000".into(), "int".into()).await.unwrap();
        storage.config_set("max_rps".into(), "2000".into(), "int".into()).await.unwrap();

        let entries = storage.config_list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, "2000");
    }

    #[tokio::test]
    async fn pagination_limits_and_offsets() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage.create_run(run_id, "iterations", serde_json::json!({})).await.unwrap();
        let records: Vec<_> = (0..10)
            .map(|i| ResultRecord {
                timestamp: Utc::now(),
                status_code: Some(200),
                latency_ms: i as f64,
                error_code: None,
                error_message: None,
                trace: None,
            })
            .collect();
        storage.append_results_batch(run_id, records).await.unwrap();

        let page = storage.list_results(run_id, Pagination { offset: 5, limit: 3 }).await.unwrap();
        assert_eq!(page.total, 10);
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.records[0].latency_ms, 5.0);
    }

    #[tokio::test]
    async fn list_runs_orders_most_recent_first_and_paginates() {
        let storage = Storage::open_in_memory().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        storage.create_run(first, "iterations", serde_json::json!({})).await.unwrap();
        storage.create_run(second, "constant_rps", serde_json::json!({})).await.unwrap();

        let page = storage.list_runs(Pagination { offset: 0, limit: 1 }).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.runs.len(), 1);
        assert_eq!(page.runs[0].id, second);
    }

    #[tokio::test]
    async fn reconcile_stale_runs_marks_running_and_pending_as_failed() {
        let storage = Storage::open_in_memory().unwrap();
        let stale = Uuid::new_v4();
        let terminal = Uuid::new_v4();
        storage.create_run(stale, "iterations", serde_json::json!({})).await.unwrap();
        storage.update_run_status(stale, RunStatus::Running, None).await.unwrap();
        storage.create_run(terminal, "iterations", serde_json::json!({})).await.unwrap();
        storage.update_run_status(terminal, RunStatus::Completed, Some(Utc::now())).await.unwrap();

        let reconciled = storage.reconcile_stale_runs().await.unwrap();
        assert_eq!(reconciled, 1);
        assert_eq!(storage.get_run_status(stale).await.unwrap().as_deref(), Some("failed"));
        assert_eq!(storage.get_run_status(terminal).await.unwrap().as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn flush_run_results_writes_results_and_histogram_in_one_transaction() {
        let storage = Storage::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        storage.create_run(run_id, "iterations", serde_json::json!({})).await.unwrap();

        let records = vec![ResultRecord {
            timestamp: Utc::now(),
            status_code: Some(200),
            latency_ms: 3.0,
            error_code: None,
            error_message: None,
            trace: None,
        }];
        let mut status_codes = HashMap::new();
        status_codes.insert(200u16, 1u64);
        let percentiles = Percentiles { min: 3.0, p50: 3.0, p75: 3.0, p90: 3.0, p95: 3.0, p99: 3.0, p999: 3.0, max: 3.0 };

        storage.flush_run_results(run_id, records, status_codes, percentiles).await.unwrap();

        let page = storage.list_results(run_id, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);

        let histogram_exists: bool = storage
            .with_conn(move |conn| conn.query_row("SELECT COUNT(*) > 0 FROM histograms WHERE run_id = ?1", params![run_id.to_string()], |row| row.get(0)))
            .await
            .unwrap();
        assert!(histogram_exists);
    }

    #[tokio::test]
    async fn collection_crud_round_trips() {
        let storage = Storage::open_in_memory().unwrap();
        let created = storage.create_collection("suite".to_string(), None, serde_json::json!({"base": "x"})).await.unwrap();

        let fetched = storage.get_collection(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "suite");

        let listed = storage.list_collections().await.unwrap();
        assert_eq!(listed.len(), 1);

        storage.delete_collection(created.id).await.unwrap();
        assert!(storage.get_collection(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn request_crud_round_trips_and_filters_by_collection() {
        let storage = Storage::open_in_memory().unwrap();
        let collection = storage.create_collection("suite".to_string(), None, serde_json::json!({})).await.unwrap();

        let record = RequestRecord {
            id: Uuid::new_v4(),
            collection_id: collection.id,
            name: "get widget".to_string(),
            method: "GET".to_string(),
            url: "https://example.com/widget".to_string(),
            headers: serde_json::json!({}),
            body: None,
            auth: None,
            scripts: None,
            created_at: Utc::now(),
        };
        let created = storage.create_request(record).await.unwrap();

        let fetched = storage.get_request(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.url, "https://example.com/widget");

        let scoped = storage.list_requests(Some(collection.id)).await.unwrap();
        assert_eq!(scoped.len(), 1);
        let other_collection = Uuid::new_v4();
        assert!(storage.list_requests(Some(other_collection)).await.unwrap().is_empty());

        storage.delete_request(created.id).await.unwrap();
        assert!(storage.get_request(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn environment_crud_round_trips() {
        let storage = Storage::open_in_memory().unwrap();
        let created = storage.create_environment("staging".to_string(), serde_json::json!({"host": "stg"}), true).await.unwrap();

        let fetched = storage.get_environment(created.id).await.unwrap().unwrap();
        assert!(fetched.active);
        assert_eq!(fetched.variables, serde_json::json!({"host": "stg"}));

        storage.delete_environment(created.id).await.unwrap();
        assert!(storage.get_environment(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn globals_set_list_and_unset_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        storage.set_global("api_key".to_string(), "abc123".to_string()).await.unwrap();
        storage.set_global("base_url".to_string(), "http://localhost".to_string()).await.unwrap();

        let listed = storage.list_globals().await.unwrap();
        assert_eq!(listed, vec![("api_key".to_string(), "abc123".to_string()), ("base_url".to_string(), "http://localhost".to_string())]);

        storage.set_global("api_key".to_string(), "xyz789".to_string()).await.unwrap();
        let listed = storage.list_globals().await.unwrap();
        assert_eq!(listed[0], ("api_key".to_string(), "xyz789".to_string()));

        storage.delete_global("base_url".to_string()).await.unwrap();
        let listed = storage.list_globals().await.unwrap();
        assert_eq!(listed, vec![("api_key".to_string(), "xyz789".to_string())]);
    }
}
