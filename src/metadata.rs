//! Versioned file metadata.
//!
//! Metadata is serialized as a JSON object carrying an explicit `version`
//! field. Decoding reads the version first and dispatches to the schema for
//! that version; unknown versions are rejected instead of guessed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CURRENT_VERSION: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Video,
    Other,
}

impl FileType {
    pub fn from_name(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "heic" | "heif" | "webp" | "bmp" | "tif" | "tiff"
            | "avif" | "dng" | "raw" | "cr2" | "nef" | "arw" => FileType::Image,
            "mp4" | "mov" | "m4v" | "avi" | "mkv" | "webm" | "3gp" | "wmv" => FileType::Video,
            _ => FileType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataV1 {
    pub title: String,
    pub creation_time: i64,
    pub modification_time: i64,
    pub file_type: FileType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataV2 {
    pub title: String,
    pub creation_time: i64,
    pub modification_time: i64,
    pub file_type: FileType,
    /// Hex SHA-256 of the plaintext.
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMetadata {
    V1(MetadataV1),
    V2(MetadataV2),
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata is not a json object")]
    NotAnObject,
    #[error("metadata has no version")]
    MissingVersion,
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u64),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl FileMetadata {
    pub fn version(&self) -> u64 {
        match self {
            FileMetadata::V1(_) => 1,
            FileMetadata::V2(_) => 2,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            FileMetadata::V1(m) => &m.title,
            FileMetadata::V2(m) => &m.title,
        }
    }

    pub fn modification_time(&self) -> i64 {
        match self {
            FileMetadata::V1(m) => m.modification_time,
            FileMetadata::V2(m) => m.modification_time,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, MetadataError> {
        let mut value = match self {
            FileMetadata::V1(m) => serde_json::to_value(m)?,
            FileMetadata::V2(m) => serde_json::to_value(m)?,
        };
        let obj = value.as_object_mut().ok_or(MetadataError::NotAnObject)?;
        obj.insert("version".to_string(), Value::from(self.version()));
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, MetadataError> {
        let mut value: Value = serde_json::from_slice(raw)?;
        let obj = value.as_object_mut().ok_or(MetadataError::NotAnObject)?;
        let version = obj
            .remove("version")
            .and_then(|v| v.as_u64())
            .ok_or(MetadataError::MissingVersion)?;
        match version {
            1 => Ok(FileMetadata::V1(serde_json::from_value(value)?)),
            2 => Ok(FileMetadata::V2(serde_json::from_value(value)?)),
            v => Err(MetadataError::UnsupportedVersion(v)),
        }
    }
}
