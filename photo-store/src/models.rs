use serde::{Deserialize, Serialize};

/// Raw photo bytes plus their MIME type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoBlob {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl PhotoBlob {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }
}

/// Which version of the image a stored row holds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhotoVariant {
    /// Full-size bytes as supplied by the user
    Original,
    /// Reduced copy kept after the original is no longer needed locally
    Thumbnail,
}

impl PhotoVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoVariant::Original => "original",
            PhotoVariant::Thumbnail => "thumbnail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "original" => Some(PhotoVariant::Original),
            "thumbnail" => Some(PhotoVariant::Thumbnail),
            _ => None,
        }
    }
}

/// A stored photo row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoRecord {
    /// Local id assigned before upload; stays the row key afterwards
    pub id: String,
    pub blob: PhotoBlob,
    pub variant: PhotoVariant,
    /// Hex encoded SHA-256 of `blob.bytes`
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Configuration for the photo store
#[derive(Debug, Clone)]
pub struct PhotoStoreConfig {
    /// Longest edge of generated thumbnails in pixels
    pub thumbnail_size: u32,
}

impl Default for PhotoStoreConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 256,
        }
    }
}
