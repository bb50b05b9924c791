//! Local Record Store: observation records plus their photo blobs.
//!
//! `put` is the only place where photo bytes leave the record body. Records
//! are stored as JSON next to a few indexed columns used for queue scans.

use crate::database::in_transaction;
use crate::error::AppError;
use crate::models::{
    ActionType, ObservationRecord, Outcome, PendingPhotoAdd, PhotoBlobRef,
    CURRENT_SCHEMA_VERSION,
};
use chrono::Utc;
use photo_store::{PhotoRecord, PhotoStore, PhotoStoreConfig, PhotoVariant};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub struct RecordStore {
    photos: PhotoStore,
}

impl RecordStore {
    pub fn new(config: PhotoStoreConfig) -> Self {
        Self {
            photos: PhotoStore::new(config),
        }
    }

    pub fn photo_store(&self) -> &PhotoStore {
        &self.photos
    }

    /// Writes a record, moving inline photo blobs into the photo store first.
    ///
    /// Photo writes and the record row share one transaction: a failing photo
    /// write aborts the whole put. Returns the record as stored.
    pub fn put(
        &self,
        conn: &Connection,
        mut record: ObservationRecord,
    ) -> Result<ObservationRecord, AppError> {
        if record.uuid.is_nil() {
            return Err(AppError::MissingKey);
        }

        record.meta.schema_version = CURRENT_SCHEMA_VERSION;
        record.meta.last_updated_at = Utc::now();

        in_transaction(conn, |tx| {
            self.split_photos(tx, &mut record.meta.pending_photo_adds)?;
            if let Some(blocked) = record.meta.blocked_action.as_mut() {
                self.split_photos(tx, &mut blocked.pending_photo_adds)?;
            }

            let json = serde_json::to_string(&record)?;
            tx.execute(
                "INSERT INTO observations (uuid, remote_id, outcome, action_type, schema_version, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(uuid) DO UPDATE SET
                    remote_id = excluded.remote_id,
                    outcome = excluded.outcome,
                    action_type = excluded.action_type,
                    schema_version = excluded.schema_version,
                    record = excluded.record",
                params![
                    record.uuid.to_string(),
                    record.remote_id,
                    record.meta.outcome.as_str(),
                    record.meta.action_type.as_str(),
                    record.meta.schema_version,
                    json
                ],
            )?;
            Ok(())
        })?;

        log::debug!(
            "Stored observation {} ({} / {})",
            record.uuid,
            record.meta.action_type.as_str(),
            record.meta.outcome
        );

        Ok(record)
    }

    fn split_photos(
        &self,
        conn: &Connection,
        adds: &mut [PendingPhotoAdd],
    ) -> Result<(), AppError> {
        for add in adds.iter_mut() {
            if let Some(PhotoBlobRef::Inline { blob }) = &add.blob {
                self.photos.put_photo(conn, &add.local_id, blob)?;
                add.blob = Some(PhotoBlobRef::Stored);
            }
        }
        Ok(())
    }

    /// Loads a record without touching the photo store
    pub fn load(
        &self,
        conn: &Connection,
        uuid: &Uuid,
    ) -> Result<Option<ObservationRecord>, AppError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT record FROM observations WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Loads a record with full-size photo bytes re-attached
    pub fn get(
        &self,
        conn: &Connection,
        uuid: &Uuid,
    ) -> Result<Option<ObservationRecord>, AppError> {
        let Some(mut record) = self.load(conn, uuid)? else {
            return Ok(None);
        };

        self.hydrate(conn, &mut record.meta.pending_photo_adds)?;
        if let Some(blocked) = record.meta.blocked_action.as_mut() {
            self.hydrate(conn, &mut blocked.pending_photo_adds)?;
        }

        Ok(Some(record))
    }

    fn hydrate(&self, conn: &Connection, adds: &mut [PendingPhotoAdd]) -> Result<(), AppError> {
        for add in adds.iter_mut() {
            if add.blob != Some(PhotoBlobRef::Stored) {
                continue;
            }
            match self.photos.get_photo(conn, &add.local_id)? {
                Some(PhotoRecord {
                    blob,
                    variant: PhotoVariant::Original,
                    ..
                }) => add.blob = Some(PhotoBlobRef::Inline { blob }),
                Some(_) => add.blob = Some(PhotoBlobRef::Thumbnail),
                None => {
                    log::warn!("Photo {} referenced but missing from store", add.local_id);
                }
            }
        }
        Ok(())
    }

    /// Deletes a record and every photo it keeps locally, blocked action
    /// included. Returns whether the record existed.
    pub fn delete(&self, conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
        let Some(record) = self.load(conn, uuid)? else {
            return Ok(false);
        };

        in_transaction(conn, |tx| {
            for photo_id in record.local_photo_ids() {
                self.photos.delete_photo(tx, &photo_id)?;
            }
            tx.execute(
                "DELETE FROM observations WHERE uuid = ?1",
                params![uuid.to_string()],
            )?;
            Ok(())
        })?;

        log::debug!("Deleted observation {} and its photos", uuid);
        Ok(true)
    }

    /// Visits every record (photos not hydrated) in creation order
    pub fn for_each(
        &self,
        conn: &Connection,
        mut visitor: impl FnMut(ObservationRecord) -> Result<(), AppError>,
    ) -> Result<(), AppError> {
        let mut stmt = conn.prepare("SELECT record FROM observations ORDER BY created_at, rowid")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for raw in rows {
            visitor(serde_json::from_str(&raw)?)?;
        }
        Ok(())
    }

    /// All records currently in `outcome`
    pub fn list_by_outcome(
        &self,
        conn: &Connection,
        outcome: Outcome,
    ) -> Result<Vec<ObservationRecord>, AppError> {
        let mut stmt = conn.prepare(
            "SELECT record FROM observations WHERE outcome = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![outcome.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(AppError::from))
            .collect()
    }

    /// Failed records, optionally restricted to one action type
    pub fn list_failed(
        &self,
        conn: &Connection,
        action: Option<ActionType>,
    ) -> Result<Vec<ObservationRecord>, AppError> {
        Ok(self
            .list_by_outcome(conn, Outcome::SystemError)?
            .into_iter()
            .filter(|r| action.is_none_or(|a| r.meta.action_type == a))
            .collect())
    }

    /// Applies `f` to a stored record and writes it back
    pub fn update(
        &self,
        conn: &Connection,
        uuid: &Uuid,
        f: impl FnOnce(&mut ObservationRecord) -> Result<(), AppError>,
    ) -> Result<ObservationRecord, AppError> {
        let mut record = self
            .load(conn, uuid)?
            .ok_or_else(|| AppError::NotFound(format!("Observation {}", uuid)))?;
        f(&mut record)?;
        self.put(conn, record)
    }

    pub fn set_outcome(
        &self,
        conn: &Connection,
        uuid: &Uuid,
        outcome: Outcome,
    ) -> Result<ObservationRecord, AppError> {
        self.update(conn, uuid, |record| record.meta.set_outcome(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::{
        BlockedAction, ObservationBody, ObservationPatch, PhotoRef, PhotoRole, SyncMeta,
    };
    use photo_store::PhotoBlob;

    fn setup() -> (Database, RecordStore) {
        (
            Database::open_in_memory().unwrap(),
            RecordStore::new(PhotoStoreConfig::default()),
        )
    }

    fn record_with_photo(photo_id: &str, bytes: Vec<u8>) -> ObservationRecord {
        let mut meta = SyncMeta::new(ActionType::Create, Outcome::Waiting);
        meta.pending_photo_adds.push(PendingPhotoAdd::new(
            photo_id,
            PhotoBlob::new(bytes, "image/jpeg"),
            PhotoRole::Primary,
        ));
        ObservationRecord::new(Uuid::new_v4(), ObservationBody::default(), meta)
    }

    #[test]
    fn test_put_without_uuid_fails() {
        let (db, store) = setup();
        let mut record = record_with_photo("p1", vec![1]);
        record.uuid = Uuid::nil();

        let result = db.with_conn(|conn| store.put(conn, record));
        assert!(matches!(result, Err(AppError::MissingKey)));
    }

    #[test]
    fn test_put_splits_photos_and_get_restores_them() {
        let (db, store) = setup();
        let bytes = vec![0xFF, 0xD8, 0x01, 0x02, 0x03];
        let record = record_with_photo("p1", bytes.clone());
        let uuid = record.uuid;

        db.with_conn(|conn| {
            let stored = store.put(conn, record)?;
            assert_eq!(
                stored.meta.pending_photo_adds[0].blob,
                Some(PhotoBlobRef::Stored)
            );

            let raw: String = conn.query_row(
                "SELECT record FROM observations WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| row.get(0),
            )?;
            assert!(!raw.contains("\"bytes\""));

            let loaded = store.get(conn, &uuid)?.unwrap();
            match &loaded.meta.pending_photo_adds[0].blob {
                Some(PhotoBlobRef::Inline { blob }) => assert_eq!(blob.bytes, bytes),
                other => panic!("expected inline blob, got {:?}", other),
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_put_stamps_schema_version() {
        let (db, store) = setup();
        let mut record = record_with_photo("p1", vec![1]);
        record.meta.schema_version = 0;

        let stored = db.with_conn(|conn| store.put(conn, record)).unwrap();
        assert_eq!(stored.meta.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_thumbnail_reference_passes_through() {
        let (db, store) = setup();
        let mut record = record_with_photo("p1", vec![1]);
        record.meta.pending_photo_adds[0].blob = Some(PhotoBlobRef::Thumbnail);
        record.meta.pending_photo_adds.push(PendingPhotoAdd {
            local_id: "p2".into(),
            blob: None,
            role: PhotoRole::Detail,
        });

        db.with_conn(|conn| {
            store.put(conn, record.clone())?;
            let again = store.put(conn, store.load(conn, &record.uuid)?.unwrap())?;
            assert_eq!(
                again.meta.pending_photo_adds[0].blob,
                Some(PhotoBlobRef::Thumbnail)
            );
            assert_eq!(again.meta.pending_photo_adds[1].blob, None);
            assert!(store.photo_store().list_ids(conn)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_storing_thumbnailed_record_twice_does_not_shrink() {
        let (db, store) = setup();
        let record = record_with_photo("p1", vec![9, 9, 9]);
        let uuid = record.uuid;

        db.with_conn(|conn| {
            store.put(conn, record)?;
            let thumb = PhotoBlob::new(vec![7, 7], "image/jpeg");
            store.photo_store().put_thumbnail(conn, "p1", &thumb)?;

            for _ in 0..2 {
                let loaded = store.get(conn, &uuid)?.unwrap();
                assert_eq!(
                    loaded.meta.pending_photo_adds[0].blob,
                    Some(PhotoBlobRef::Thumbnail)
                );
                store.put(conn, loaded)?;
            }

            let photo = store.photo_store().get_photo(conn, "p1")?.unwrap();
            assert_eq!(photo.blob, thumb);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_cascades_to_all_photos() {
        let (db, store) = setup();
        let mut record = record_with_photo("p1", vec![1]);
        record.photos.push(PhotoRef {
            local_id: Some("p0".into()),
            remote_id: Some(10),
            role: PhotoRole::Primary,
        });
        record.meta.blocked_action = Some(BlockedAction {
            action_type: ActionType::Update,
            outcome: Outcome::Waiting,
            patch: ObservationPatch::default(),
            pending_photo_adds: vec![PendingPhotoAdd::new(
                "p2",
                PhotoBlob::new(vec![2], "image/jpeg"),
                PhotoRole::Detail,
            )],
            pending_photo_deletes: Vec::new(),
            pending_field_deletes: Vec::new(),
            last_updated_at: Utc::now(),
        });
        let uuid = record.uuid;

        db.with_conn(|conn| {
            store
                .photo_store()
                .put_thumbnail(conn, "p0", &PhotoBlob::new(vec![0], "image/jpeg"))?;
            store.put(conn, record)?;
            assert_eq!(store.photo_store().list_ids(conn)?.len(), 3);

            assert!(store.delete(conn, &uuid)?);
            assert!(store.photo_store().list_ids(conn)?.is_empty());
            assert!(store.load(conn, &uuid)?.is_none());
            assert!(!store.delete(conn, &uuid)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_by_outcome_and_for_each() {
        let (db, store) = setup();
        db.with_conn(|conn| {
            let a = record_with_photo("a", vec![1]);
            let mut b = record_with_photo("b", vec![2]);
            b.meta.outcome = Outcome::SystemError;
            store.put(conn, a)?;
            store.put(conn, b)?;

            assert_eq!(store.list_by_outcome(conn, Outcome::Waiting)?.len(), 1);
            assert_eq!(store.list_failed(conn, Some(ActionType::Create))?.len(), 1);
            assert!(store.list_failed(conn, Some(ActionType::Delete))?.is_empty());

            let mut seen = 0;
            store.for_each(conn, |_| {
                seen += 1;
                Ok(())
            })?;
            assert_eq!(seen, 2);
            Ok(())
        })
        .unwrap();
    }
}
