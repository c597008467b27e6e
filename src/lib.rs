pub mod chunk;
pub mod config;
pub mod crypto;
pub mod encryptor;
pub mod error;
pub mod http;
pub mod logging;
pub mod metadata;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scan;
pub mod source;
pub mod telemetry;
pub mod uploader;

pub use error::{ErrorKind, UploadError};
pub use queue::{BatchReport, QueueOptions, UploadQueue};
pub use source::LocalFileHandle;
