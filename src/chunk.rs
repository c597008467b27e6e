use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;
use crate::source::{BoxedReader, LocalFileHandle};

/// Plaintext chunk size used for streaming encryption (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

/// Chunks buffered ahead of the consumer by [`ChunkReader::spawn`].
pub const DEFAULT_READ_AHEAD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u32,
    pub is_last: bool,
}

pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// Deterministic chunk layout for a file of `size` bytes.
pub fn chunk_plan(size: u64, chunk_size: u32) -> impl Iterator<Item = ChunkDescriptor> {
    let count = chunk_count(size, chunk_size);
    (0..count).map(move |i| {
        let offset = i * chunk_size as u64;
        let length = (size - offset).min(chunk_size as u64) as u32;
        ChunkDescriptor {
            index: i as u32,
            offset,
            length,
            is_last: i + 1 == count,
        }
    })
}

pub type Chunk = (ChunkDescriptor, Vec<u8>);

/// Forward-only reader producing the chunks of one file in index order.
pub struct ChunkReader {
    name: String,
    reader: BoxedReader,
    plan: Box<dyn Iterator<Item = ChunkDescriptor> + Send>,
}

impl ChunkReader {
    pub async fn open(file: &LocalFileHandle, chunk_size: u32) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::read(file.name(), "chunk size must be positive"));
        }
        let reader = file.open().await?;
        Ok(Self {
            name: file.name().to_string(),
            reader,
            plan: Box::new(chunk_plan(file.size(), chunk_size)),
        })
    }

    /// Reads the next chunk. Returns `None` once the whole file was produced.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, UploadError> {
        let Some(desc) = self.plan.next() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; desc.length as usize];
        self.reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                UploadError::read(&self.name, "source truncated while reading")
            } else {
                UploadError::read(&self.name, e)
            }
        })?;
        if desc.is_last {
            self.ensure_exhausted().await?;
        }
        Ok(Some((desc, buf)))
    }

    async fn ensure_exhausted(&mut self) -> Result<(), UploadError> {
        let mut extra = [0u8; 1];
        let n = self
            .reader
            .read(&mut extra)
            .await
            .map_err(|e| UploadError::read(&self.name, e))?;
        if n != 0 {
            return Err(UploadError::read(&self.name, "source grew while reading"));
        }
        Ok(())
    }

    /// Moves reading onto a task that stays at most `read_ahead` chunks in
    /// front of the consumer.
    pub fn spawn(
        mut self,
        read_ahead: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Chunk, UploadError>> {
        let (tx, rx) = mpsc::channel(read_ahead.max(1));
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(UploadError::Cancelled),
                    res = self.next_chunk() => res,
                };
                match next {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });
        rx
    }
}
