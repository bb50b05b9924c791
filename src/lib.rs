//! Local-first synchronization engine for offline nature observations.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod services;

pub use config::SyncConfig;
pub use database::Database;
pub use error::AppError;
pub use services::{EditRequest, SyncEngine, SyncEvent};
