use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::UploadError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where the bytes of a [`LocalFileHandle`] come from.
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
    /// A one-shot stream; it can be opened exactly once.
    Stream(Mutex<Option<BoxedReader>>),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            FileSource::Memory(b) => f.debug_tuple("Memory").field(&b.len()).finish(),
            FileSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Identity used to detect files that were already uploaded to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub name: String,
    pub size: u64,
    pub modification_time: i64,
}

/// Opaque reference to the bytes of a file waiting to be uploaded.
#[derive(Debug)]
pub struct LocalFileHandle {
    name: String,
    size: u64,
    last_modified: i64,
    source: FileSource,
}

impl LocalFileHandle {
    pub fn from_path(path: &Path) -> Result<Self, UploadError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let meta = std::fs::metadata(path).map_err(|e| UploadError::read(&name, e))?;
        if !meta.is_file() {
            return Err(UploadError::read(&name, "not a regular file"));
        }
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Self {
            name,
            size: meta.len(),
            last_modified,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>, last_modified: i64) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            last_modified,
            source: FileSource::Memory(data),
        }
    }

    /// Wraps a stream whose total length is known up front.
    pub fn from_reader(
        name: impl Into<String>,
        size: u64,
        last_modified: i64,
        reader: BoxedReader,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            last_modified,
            source: FileSource::Stream(Mutex::new(Some(reader))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            name: self.name.clone(),
            size: self.size,
            modification_time: self.last_modified,
        }
    }

    /// Opens a fresh reader positioned at offset 0.
    pub async fn open(&self) -> Result<BoxedReader, UploadError> {
        match &self.source {
            FileSource::Path(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| UploadError::read(&self.name, e))?;
                Ok(Box::new(file))
            }
            FileSource::Memory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
            FileSource::Stream(slot) => {
                let taken = slot.lock().ok().and_then(|mut g| g.take());
                taken.ok_or_else(|| UploadError::read(&self.name, "stream source already consumed"))
            }
        }
    }
}
