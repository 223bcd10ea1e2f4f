use rusqlite::Connection;

/// Ordered, monotonic schema migrations. Each entry is applied exactly once,
/// in order, tracked via `metadata.schema_version`.
const MIGRATIONS: &[&str] = &[
    // v1: base schema
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS collections (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        parent_id TEXT,
        variables_json TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS requests (
        id TEXT PRIMARY KEY,
        collection_id TEXT NOT NULL,
        name TEXT NOT NULL,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        headers_json TEXT NOT NULL DEFAULT '{}',
        body_json TEXT,
        auth_json TEXT,
        scripts_json TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS environments (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        variables_json TEXT NOT NULL DEFAULT '{}',
        active_bool INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        config_snapshot_json TEXT NOT NULL,
        request_id TEXT,
        environment_id TEXT
    );

    CREATE TABLE IF NOT EXISTS results (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        status_code INTEGER,
        latency_ms REAL NOT NULL,
        error_code TEXT,
        error_message TEXT,
        trace_json TEXT,
        PRIMARY KEY (run_id, seq)
    );

    CREATE TABLE IF NOT EXISTS metrics (
        run_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        name TEXT NOT NULL,
        value REAL NOT NULL,
        labels_json TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_metrics_run ON metrics(run_id, timestamp);

    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        type TEXT NOT NULL,
        description TEXT,
        constraints TEXT
    );
    "#,
    // v2: per-run status-code/percentile histogram, written alongside the
    // results batch in the same flush transaction.
    r#"
    CREATE TABLE IF NOT EXISTS histograms (
        run_id TEXT PRIMARY KEY,
        status_codes_json TEXT NOT NULL,
        percentiles_json TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );
    "#,
    // v3: flat key/value store backing `pm.globals`, scoped to the whole
    // engine rather than one collection or environment.
    r#"
    CREATE TABLE IF NOT EXISTS globals (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
];

pub fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE((SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'), 0)",
        [],
        |row| row.get(0),
    )
    .or_else(|_| Ok(0))
}

/// Applies every migration past the connection's current schema version.
pub fn run(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    let version = current_version(conn)? as usize;
    for (idx, migration) in MIGRATIONS.iter().enumerate().skip(version) {
        conn.execute_batch(migration)?;
        conn.execute(
            "INSERT INTO metadata(key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![(idx + 1).to_string()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_starts_at_version_zero() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);")
            .unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn run_creates_all_tables_and_bumps_version() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), MIGRATIONS.len() as i64);

        for table in ["collections", "requests", "environments", "runs", "results", "metrics", "config", "histograms", "globals"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    rusqlite::params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "expected table `{table}` to exist");
        }
    }

    #[test]
    fn run_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), MIGRATIONS.len() as i64);
    }
}
