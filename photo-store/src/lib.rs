//! # Photo Store
//!
//! SQLite-backed photo blob storage used by the observation sync engine.
//!
//! Photos are kept in their own table so the primary observation records stay
//! small and cheap to scan. This crate provides:
//! - Keyed blob storage (`put_photo`, `get_photo`, `delete_photo`)
//! - SHA-256 checksums for every stored blob
//! - Post-upload thumbnail substitution (JPEG), applied at most once per photo
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use photo_store::{PhotoBlob, PhotoStore, PhotoStoreConfig};
//!
//! let store = PhotoStore::new(PhotoStoreConfig::default());
//! photo_store::init_photo_schema(&conn)?;
//! store.put_photo(&conn, "local-1", &PhotoBlob::new(bytes, "image/jpeg"))?;
//! ```

pub mod models;
pub mod schema;
pub mod service;
pub mod thumbnail;

pub use models::{PhotoBlob, PhotoRecord, PhotoStoreConfig, PhotoVariant};
pub use schema::init_photo_schema;
pub use service::{PhotoStore, PhotoStoreError};
pub use thumbnail::{create_thumbnail, ThumbnailError};
