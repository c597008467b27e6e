use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunk::{ChunkReader, DEFAULT_CHUNK_SIZE, DEFAULT_READ_AHEAD};
use crate::crypto::{
    ciphertext_len, seal_chunk, seal_metadata, wrap_file_key, CollectionKey, EncryptionHeader,
    FileKey, SealedBox, MAC_BYTES,
};
use crate::error::UploadError;
use crate::metadata::{FileMetadata, FileType, MetadataV2};
use crate::pool::{CryptoWorkerPool, WorkerHandle};
use crate::source::LocalFileHandle;

/// Ciphertext at or below this size stays in memory (32 MiB).
pub const DEFAULT_SPOOL_THRESHOLD: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EncryptorOptions {
    pub chunk_size: u32,
    pub read_ahead: usize,
    pub spool_threshold: u64,
    pub spool_dir: Option<PathBuf>,
}

impl Default for EncryptorOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_ahead: DEFAULT_READ_AHEAD,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            spool_dir: None,
        }
    }
}

/// Ciphertext of one file, held until every part is uploaded.
#[derive(Debug)]
pub enum Spool {
    Memory(Bytes),
    File { file: NamedTempFile, len: u64 },
}

impl Spool {
    pub fn len(&self) -> u64 {
        match self {
            Spool::Memory(b) => b.len() as u64,
            Spool::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        match self {
            Spool::Memory(b) => {
                let start = offset as usize;
                let end = start + len as usize;
                if end > b.len() {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                Ok(b.slice(start..end))
            }
            Spool::File { file, .. } => {
                let mut f = tokio::fs::File::open(file.path()).await?;
                f.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                f.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

enum SpoolWriter {
    Memory(Vec<u8>),
    File {
        tmp: NamedTempFile,
        out: tokio::fs::File,
        written: u64,
    },
}

impl SpoolWriter {
    fn create(expected: u64, options: &EncryptorOptions) -> std::io::Result<Self> {
        if expected <= options.spool_threshold {
            return Ok(SpoolWriter::Memory(Vec::with_capacity(expected as usize)));
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("vault-upload-").suffix(".enc");
        let tmp = match &options.spool_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };
        let out = tokio::fs::File::from_std(tmp.reopen()?);
        Ok(SpoolWriter::File {
            tmp,
            out,
            written: 0,
        })
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            SpoolWriter::Memory(buf) => buf.extend_from_slice(data),
            SpoolWriter::File { out, written, .. } => {
                out.write_all(data).await?;
                *written += data.len() as u64;
            }
        }
        Ok(())
    }

    async fn finish(self) -> std::io::Result<Spool> {
        match self {
            SpoolWriter::Memory(buf) => Ok(Spool::Memory(Bytes::from(buf))),
            SpoolWriter::File {
                tmp,
                mut out,
                written,
            } => {
                out.flush().await?;
                out.sync_data().await?;
                Ok(Spool::File {
                    file: tmp,
                    len: written,
                })
            }
        }
    }
}

/// Result of the encryption stage; contains no plaintext key material.
#[derive(Debug)]
pub struct EncryptedFile {
    pub name: String,
    pub plaintext_size: u64,
    pub payload: Spool,
    pub header: EncryptionHeader,
    pub wrapped_key: SealedBox,
    pub encrypted_metadata: SealedBox,
    /// Hex SHA-256 of the plaintext.
    pub integrity_tag: String,
}

pub struct FileEncryptor {
    pool: CryptoWorkerPool,
    options: EncryptorOptions,
}

fn encryption_err(e: impl std::fmt::Display) -> UploadError {
    UploadError::Encryption(e.to_string())
}

impl FileEncryptor {
    pub fn new(pool: CryptoWorkerPool, options: EncryptorOptions) -> Self {
        Self { pool, options }
    }

    pub fn options(&self) -> &EncryptorOptions {
        &self.options
    }

    /// Acquires a pooled worker, encrypts `file`, and releases the worker
    /// before returning either outcome.
    pub async fn encrypt(
        &self,
        file: &LocalFileHandle,
        collection_key: &CollectionKey,
        cancel: &CancellationToken,
    ) -> Result<EncryptedFile, UploadError> {
        let worker = self.pool.acquire(cancel).await?;
        let result = self.encrypt_with(&worker, file, collection_key, cancel).await;
        self.pool.release(worker);
        result
    }

    /// Encrypts `file` on a worker the caller already holds.
    pub async fn encrypt_with(
        &self,
        worker: &WorkerHandle,
        file: &LocalFileHandle,
        collection_key: &CollectionKey,
        cancel: &CancellationToken,
    ) -> Result<EncryptedFile, UploadError> {
        let chunk_size = self.options.chunk_size;
        let key = FileKey::generate();
        let header = EncryptionHeader::generate(chunk_size);
        let cipher = Arc::new(key.cipher());
        let expected = ciphertext_len(file.size(), chunk_size);

        let reader = ChunkReader::open(file, chunk_size).await?;
        let mut chunks = reader.spawn(self.options.read_ahead, cancel.clone());
        let mut spool = SpoolWriter::create(expected, &self.options).map_err(encryption_err)?;
        let mut hasher = Sha256::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                item = chunks.recv() => item,
            };
            let Some(item) = next else {
                break;
            };
            let (desc, plain) = item?;
            hasher.update(&plain);

            let nonce = header.chunk_nonce(desc.index, desc.is_last);
            let cipher = cipher.clone();
            let plain_len = plain.len();
            let sealed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                res = worker.run(move || seal_chunk(&cipher, &nonce, desc.index, &plain)) => res,
            }
            .map_err(encryption_err)?
            .map_err(encryption_err)?;
            if sealed.len() != plain_len + MAC_BYTES {
                return Err(UploadError::Encryption(format!(
                    "chunk {} sealed to unexpected length {}",
                    desc.index,
                    sealed.len()
                )));
            }
            spool.write(&sealed).await.map_err(encryption_err)?;
        }

        let payload = spool.finish().await.map_err(encryption_err)?;
        if payload.len() != expected {
            return Err(UploadError::Encryption(format!(
                "ciphertext length {} != expected {expected}",
                payload.len()
            )));
        }

        let integrity_tag = hex::encode(hasher.finalize());
        let metadata = FileMetadata::V2(MetadataV2 {
            title: file.name().to_string(),
            creation_time: file.last_modified(),
            modification_time: file.last_modified(),
            file_type: FileType::from_name(file.name()),
            hash: integrity_tag.clone(),
            size: file.size(),
        });
        let metadata_json = metadata.to_json().map_err(encryption_err)?;
        let encrypted_metadata = seal_metadata(&key, &metadata_json).map_err(encryption_err)?;
        let wrapped_key = wrap_file_key(&key, collection_key).map_err(encryption_err)?;
        drop(key);

        debug!(
            file = file.name(),
            worker = worker.index(),
            plaintext = file.size(),
            ciphertext = expected,
            "file encrypted"
        );

        Ok(EncryptedFile {
            name: file.name().to_string(),
            plaintext_size: file.size(),
            payload,
            header,
            wrapped_key,
            encrypted_metadata,
            integrity_tag,
        })
    }
}
