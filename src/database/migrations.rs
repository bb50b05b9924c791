//! One-way data migrations over stored observation records.
//!
//! Each migration has a stable key. After it runs, a marker is written to the
//! meta store and the migration is never run again for this database.

use crate::error::AppError;
use crate::models::{ObservationRecord, PhotoBlobRef, CURRENT_SCHEMA_VERSION};
use crate::services::meta_store;
use crate::services::record_store::RecordStore;
use rusqlite::Connection;

type MigrationFn = fn(&Connection, &RecordStore) -> Result<usize, AppError>;

pub struct Migration {
    pub key: &'static str,
    run: MigrationFn,
}

/// All migrations, oldest first. Keys must never change once shipped.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            key: "backfill_outcome_timestamps",
            run: backfill_outcome_timestamps,
        },
        Migration {
            key: "split_inline_photos",
            run: split_inline_photos,
        },
    ]
}

/// Runs every migration that has no marker yet. Returns the keys that ran.
pub fn run_migrations(
    conn: &Connection,
    store: &RecordStore,
) -> Result<Vec<&'static str>, AppError> {
    let mut applied = Vec::new();

    for migration in migrations() {
        let marker = meta_store::migration_marker_key(migration.key);
        if meta_store::contains(conn, &marker)? {
            continue;
        }

        let touched = (migration.run)(conn, store)?;
        meta_store::set_json(conn, &marker, &chrono::Utc::now())?;
        log::info!("Migration '{}' applied to {} records", migration.key, touched);
        applied.push(migration.key);
    }

    Ok(applied)
}

fn is_outdated(record: &ObservationRecord) -> bool {
    record.meta.schema_version < CURRENT_SCHEMA_VERSION
}

fn backfill_outcome_timestamps(conn: &Connection, store: &RecordStore) -> Result<usize, AppError> {
    let mut touched = 0;
    store.for_each(conn, |mut record| {
        let missing = record.meta.last_outcome_change_at.is_none();
        if missing {
            record.meta.last_outcome_change_at = Some(record.meta.last_updated_at);
        }
        if missing || is_outdated(&record) {
            store.put(conn, record)?;
            touched += 1;
        }
        Ok(())
    })?;
    Ok(touched)
}

fn split_inline_photos(conn: &Connection, store: &RecordStore) -> Result<usize, AppError> {
    let mut touched = 0;
    store.for_each(conn, |record| {
        let has_inline = record
            .meta
            .pending_photo_adds
            .iter()
            .chain(
                record
                    .meta
                    .blocked_action
                    .iter()
                    .flat_map(|b| b.pending_photo_adds.iter()),
            )
            .any(|add| matches!(add.blob, Some(PhotoBlobRef::Inline { .. })));

        if has_inline || is_outdated(&record) {
            store.put(conn, record)?;
            touched += 1;
        }
        Ok(())
    })?;
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::{
        ActionType, ObservationBody, Outcome, PendingPhotoAdd, PhotoRole, SyncMeta,
    };
    use photo_store::{PhotoBlob, PhotoStoreConfig};
    use rusqlite::params;
    use uuid::Uuid;

    /// Writes a record the way an older build would have: inline bytes and
    /// an old schema version, bypassing the record store.
    fn insert_legacy(conn: &Connection) -> Uuid {
        let mut meta = SyncMeta::new(ActionType::Create, Outcome::Waiting);
        meta.schema_version = 1;
        meta.last_outcome_change_at = None;
        meta.pending_photo_adds.push(PendingPhotoAdd::new(
            "legacy-photo",
            PhotoBlob::new(vec![1, 2, 3], "image/jpeg"),
            PhotoRole::Primary,
        ));
        let record = ObservationRecord::new(Uuid::new_v4(), ObservationBody::default(), meta);
        conn.execute(
            "INSERT INTO observations (uuid, outcome, action_type, schema_version, record)
             VALUES (?1, 'waiting', 'create', 1, ?2)",
            params![
                record.uuid.to_string(),
                serde_json::to_string(&record).unwrap()
            ],
        )
        .unwrap();
        record.uuid
    }

    #[test]
    fn test_migrations_upgrade_legacy_records() {
        let db = Database::open_in_memory().unwrap();
        let store = RecordStore::new(PhotoStoreConfig::default());

        db.with_conn(|conn| {
            let uuid = insert_legacy(conn);

            let applied = run_migrations(conn, &store)?;
            assert_eq!(applied, vec!["backfill_outcome_timestamps", "split_inline_photos"]);

            let record = store.load(conn, &uuid)?.unwrap();
            assert_eq!(record.meta.schema_version, CURRENT_SCHEMA_VERSION);
            assert!(record.meta.last_outcome_change_at.is_some());
            assert_eq!(
                record.meta.pending_photo_adds[0].blob,
                Some(PhotoBlobRef::Stored)
            );
            assert!(store
                .photo_store()
                .get_photo(conn, "legacy-photo")?
                .is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_migrations_run_only_once() {
        let db = Database::open_in_memory().unwrap();
        let store = RecordStore::new(PhotoStoreConfig::default());

        db.with_conn(|conn| {
            assert_eq!(run_migrations(conn, &store)?.len(), 2);

            insert_legacy(conn);
            assert!(run_migrations(conn, &store)?.is_empty());
            assert!(meta_store::contains(
                conn,
                &meta_store::migration_marker_key("split_inline_photos")
            )?);
            Ok(())
        })
        .unwrap();
    }
}
