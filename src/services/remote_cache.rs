//! Read cache of observations as the remote service last reported them.

use crate::error::AppError;
use crate::models::ObservationBody;
use crate::services::meta_store::{self, REMOTE_SNAPSHOT_KEY};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObservation {
    pub id: i64,
    pub body: ObservationBody,
    pub fetched_at: DateTime<Utc>,
}

impl RemoteObservation {
    /// Builds a snapshot entry from a remote response body. Needs a numeric `id`.
    pub fn from_echo(echo: &serde_json::Value) -> Option<Self> {
        let id = echo.get("id")?.as_i64()?;
        let body = serde_json::from_value::<ObservationBody>(echo.clone()).unwrap_or_default();
        Some(Self {
            id,
            body,
            fetched_at: Utc::now(),
        })
    }
}

type Snapshot = BTreeMap<Uuid, RemoteObservation>;

fn load(conn: &Connection) -> Result<Snapshot, AppError> {
    Ok(meta_store::get_json(conn, REMOTE_SNAPSHOT_KEY)?.unwrap_or_default())
}

pub fn get(conn: &Connection, uuid: &Uuid) -> Result<Option<RemoteObservation>, AppError> {
    Ok(load(conn)?.remove(uuid))
}

pub fn contains(conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
    Ok(load(conn)?.contains_key(uuid))
}

pub fn upsert(conn: &Connection, uuid: Uuid, remote: RemoteObservation) -> Result<(), AppError> {
    let mut snapshot = load(conn)?;
    snapshot.insert(uuid, remote);
    meta_store::set_json(conn, REMOTE_SNAPSHOT_KEY, &snapshot)
}

pub fn remove(conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
    let mut snapshot = load(conn)?;
    let removed = snapshot.remove(uuid).is_some();
    if removed {
        meta_store::set_json(conn, REMOTE_SNAPSHOT_KEY, &snapshot)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    #[test]
    fn test_from_echo_reads_id_and_fields() {
        let echo = json!({"id": 42, "caption": "kingfisher", "extra": true});
        let remote = RemoteObservation::from_echo(&echo).unwrap();
        assert_eq!(remote.id, 42);
        assert_eq!(remote.body.caption.as_deref(), Some("kingfisher"));

        assert!(RemoteObservation::from_echo(&json!({"caption": "x"})).is_none());
    }

    #[test]
    fn test_upsert_and_remove() {
        let db = Database::open_in_memory().unwrap();
        let uuid = Uuid::new_v4();

        db.with_conn(|conn| {
            let remote = RemoteObservation::from_echo(&json!({"id": 7})).unwrap();
            upsert(conn, uuid, remote)?;
            assert!(contains(conn, &uuid)?);
            assert_eq!(get(conn, &uuid)?.unwrap().id, 7);

            assert!(remove(conn, &uuid)?);
            assert!(!remove(conn, &uuid)?);
            assert!(get(conn, &uuid)?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
