use rusqlite::{Connection, Result};

/// Initialize the sync engine schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_schema(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Create the complete schema (version 1)
fn create_schema(conn: &Connection) -> Result<()> {
    // Table: observations (one row per locally tracked observation)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS observations (
            uuid TEXT PRIMARY KEY,
            remote_id INTEGER,
            outcome TEXT NOT NULL CHECK(outcome IN ('draft', 'waiting', 'beingProcessed', 'success', 'userError', 'systemError')),
            action_type TEXT NOT NULL CHECK(action_type IN ('create', 'update', 'delete')),
            schema_version INTEGER NOT NULL,
            record TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_outcome ON observations(outcome)",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_observations_timestamp
         AFTER UPDATE ON observations
         BEGIN
            UPDATE observations SET updated_at = CURRENT_TIMESTAMP WHERE uuid = NEW.uuid;
         END",
        [],
    )?;

    // Table: sync_meta_store (migration markers, remote snapshot, pending tasks)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_meta_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Table: request_queue (both queues, ordered by position)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL UNIQUE,
            queue TEXT NOT NULL CHECK(queue IN ('parent', 'dependent')),
            position INTEGER NOT NULL,
            obs_uuid TEXT NOT NULL,
            parent_action TEXT NOT NULL CHECK(parent_action IN ('create', 'update', 'delete')),
            remote_parent_id INTEGER,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            ignored INTEGER NOT NULL DEFAULT 0 CHECK(ignored IN (0,1)),
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_queue_order ON request_queue(queue, position)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_queue_obs ON request_queue(obs_uuid)",
        [],
    )?;

    // Table: dependent_bundles (children waiting for their parent)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dependent_bundles (
            obs_uuid TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    Ok(())
}
