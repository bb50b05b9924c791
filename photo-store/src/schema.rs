use rusqlite::{Connection, Result};

/// Initialize photo store database schema
pub fn init_photo_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS photo_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM photo_schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_photo_schema_v1(conn)?;
        conn.execute("INSERT INTO photo_schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Create photo store schema version 1
fn create_photo_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS photo_blobs (
            id TEXT PRIMARY KEY,
            bytes BLOB NOT NULL,
            mime TEXT NOT NULL,
            variant TEXT NOT NULL DEFAULT 'original' CHECK(variant IN ('original', 'thumbnail')),
            checksum TEXT NOT NULL,
            byte_len INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photo_blobs_variant ON photo_blobs(variant)",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_photo_blobs_timestamp
         AFTER UPDATE ON photo_blobs
         BEGIN
            UPDATE photo_blobs SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
         END",
        [],
    )?;

    Ok(())
}
