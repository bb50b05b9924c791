use crate::models::{PhotoBlob, PhotoRecord, PhotoStoreConfig, PhotoVariant};
use crate::thumbnail::{create_thumbnail, ThumbnailError, THUMBNAIL_MIME};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// Error type for photo store operations
#[derive(Debug)]
pub enum PhotoStoreError {
    DatabaseError(rusqlite::Error),
    ThumbnailError(ThumbnailError),
    NotFound(String),
    Other(String),
}

impl std::fmt::Display for PhotoStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhotoStoreError::DatabaseError(e) => write!(f, "Database error: {}", e),
            PhotoStoreError::ThumbnailError(e) => write!(f, "Thumbnail error: {}", e),
            PhotoStoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
            PhotoStoreError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PhotoStoreError {}

impl From<rusqlite::Error> for PhotoStoreError {
    fn from(err: rusqlite::Error) -> Self {
        PhotoStoreError::DatabaseError(err)
    }
}

impl From<ThumbnailError> for PhotoStoreError {
    fn from(err: ThumbnailError) -> Self {
        PhotoStoreError::ThumbnailError(err)
    }
}

/// Hex encoded SHA-256 of a blob
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Photo Store Service
pub struct PhotoStore {
    config: PhotoStoreConfig,
}

impl PhotoStore {
    pub fn new(config: PhotoStoreConfig) -> Self {
        Self { config }
    }

    pub fn thumbnail_size(&self) -> u32 {
        self.config.thumbnail_size
    }

    /// Stores a full-size photo under `id`, replacing any previous row
    pub fn put_photo(
        &self,
        conn: &Connection,
        id: &str,
        blob: &PhotoBlob,
    ) -> Result<PhotoRecord, PhotoStoreError> {
        self.write_photo(conn, id, blob, PhotoVariant::Original)
    }

    /// Stores bytes that are already a thumbnail; they are never shrunk again
    pub fn put_thumbnail(
        &self,
        conn: &Connection,
        id: &str,
        blob: &PhotoBlob,
    ) -> Result<PhotoRecord, PhotoStoreError> {
        self.write_photo(conn, id, blob, PhotoVariant::Thumbnail)
    }

    fn write_photo(
        &self,
        conn: &Connection,
        id: &str,
        blob: &PhotoBlob,
        variant: PhotoVariant,
    ) -> Result<PhotoRecord, PhotoStoreError> {
        if id.is_empty() {
            return Err(PhotoStoreError::Other("Photo id must not be empty".into()));
        }

        let sum = checksum(&blob.bytes);
        conn.execute(
            "INSERT INTO photo_blobs (id, bytes, mime, variant, checksum, byte_len)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                bytes = excluded.bytes,
                mime = excluded.mime,
                variant = excluded.variant,
                checksum = excluded.checksum,
                byte_len = excluded.byte_len",
            params![
                id,
                &blob.bytes,
                &blob.mime,
                variant.as_str(),
                &sum,
                blob.bytes.len() as i64
            ],
        )?;

        log::debug!(
            "Stored photo {} ({} bytes, {})",
            id,
            blob.bytes.len(),
            variant.as_str()
        );

        Ok(PhotoRecord {
            id: id.to_string(),
            blob: blob.clone(),
            variant,
            checksum: sum,
            created_at: None,
        })
    }

    /// Loads a photo by id
    pub fn get_photo(
        &self,
        conn: &Connection,
        id: &str,
    ) -> Result<Option<PhotoRecord>, PhotoStoreError> {
        let row = conn
            .query_row(
                "SELECT id, bytes, mime, variant, checksum, created_at FROM photo_blobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, bytes, mime, variant, checksum, created_at)) = row else {
            return Ok(None);
        };

        let variant = PhotoVariant::parse(&variant)
            .ok_or_else(|| PhotoStoreError::Other(format!("Unknown photo variant: {}", variant)))?;

        Ok(Some(PhotoRecord {
            id,
            blob: PhotoBlob { bytes, mime },
            variant,
            checksum,
            created_at,
        }))
    }

    /// Deletes a photo. Returns whether a row was removed.
    pub fn delete_photo(&self, conn: &Connection, id: &str) -> Result<bool, PhotoStoreError> {
        let rows = conn.execute("DELETE FROM photo_blobs WHERE id = ?1", params![id])?;
        if rows > 0 {
            log::debug!("Deleted photo {}", id);
        }
        Ok(rows > 0)
    }

    /// Replaces the full-size bytes of a photo with a thumbnail.
    ///
    /// A photo that is already a thumbnail is returned unchanged.
    pub fn replace_with_thumbnail(
        &self,
        conn: &Connection,
        id: &str,
    ) -> Result<PhotoRecord, PhotoStoreError> {
        let photo = self
            .get_photo(conn, id)?
            .ok_or_else(|| PhotoStoreError::NotFound(format!("Photo {}", id)))?;

        if photo.variant == PhotoVariant::Thumbnail {
            return Ok(photo);
        }

        let thumb = create_thumbnail(&photo.blob.bytes, self.config.thumbnail_size)?;
        log::info!(
            "Replacing photo {} with thumbnail ({} -> {} bytes)",
            id,
            photo.blob.bytes.len(),
            thumb.len()
        );

        self.put_thumbnail(conn, id, &PhotoBlob::new(thumb, THUMBNAIL_MIME))
    }

    /// Lists all stored photo ids
    pub fn list_ids(&self, conn: &Connection) -> Result<Vec<String>, PhotoStoreError> {
        let mut stmt = conn.prepare("SELECT id FROM photo_blobs ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
