use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::crypto::CollectionKey;
use crate::encryptor::EncryptorOptions;
use crate::pool::default_pool_size;
use crate::queue::{QueueOptions, StaticCollectionKeys, DEFAULT_MAX_CONCURRENT_UPLOADS};
use crate::retry::RetryPolicy;
use crate::uploader::{clamp_part_size, UploaderOptions, DEFAULT_PART_CONCURRENCY, DEFAULT_PART_SIZE};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_url: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Base64 collection keys by collection id.
    #[serde(default)]
    pub collection_keys: BTreeMap<i64, String>,
    /// Part size with optional unit (`20MB`, `8388608`).
    #[serde(default)]
    pub part_size: Option<String>,
    #[serde(default)]
    pub part_concurrency: Option<usize>,
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub max_concurrent_uploads: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-part request timeout (`90s`, `5m`).
    #[serde(default)]
    pub part_timeout: Option<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |k| std::env::var(k).ok())
    }

    /// Like [`Config::load`] with a custom environment lookup.
    pub fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let mut cfg: Config = if is_yaml {
            serde_yaml::from_str(&data).context("parse config yaml")?
        } else {
            serde_json::from_str(&data).context("parse config json")?
        };
        cfg.config_path = Some(path.to_path_buf());
        cfg.apply_env(env);
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("VAULT_PART_SIZE").filter(|v| !v.trim().is_empty()) {
            self.part_size = Some(v);
        }
        if let Some(n) = env("VAULT_POOL_SIZE").and_then(|v| v.trim().parse().ok()) {
            self.pool_size = Some(n);
        }
        if let Some(n) = env("VAULT_MAX_UPLOADS").and_then(|v| v.trim().parse().ok()) {
            self.max_concurrent_uploads = Some(n);
        }
        if let Some(v) = env("VAULT_PART_TIMEOUT").filter(|v| !v.trim().is_empty()) {
            self.part_timeout = Some(v);
        }
    }

    fn normalize(&mut self) -> Result<()> {
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        if self.data_dir.is_relative() {
            if let Ok(abs) = std::fs::canonicalize(&self.data_dir) {
                self.data_dir = abs;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")?;
        for (id, raw) in &self.collection_keys {
            CollectionKey::from_base64(raw).with_context(|| format!("collection_keys.{id}"))?;
        }
        if let Some(raw) = &self.part_size {
            parse_bytes(raw).ok_or_else(|| anyhow::anyhow!("part_size: invalid size {raw:?}"))?;
        }
        if let Some(raw) = &self.part_timeout {
            parse_duration(raw)
                .ok_or_else(|| anyhow::anyhow!("part_timeout: invalid duration {raw:?}"))?;
        }
        for (name, v) in [
            ("pool_size", self.pool_size),
            ("max_concurrent_uploads", self.max_concurrent_uploads),
            ("part_concurrency", self.part_concurrency),
        ] {
            if v == Some(0) {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.max_attempts == Some(0) {
            anyhow::bail!("max_attempts must be positive");
        }
        Ok(())
    }

    /// Configured part size raised to the storage minimum.
    pub fn part_size(&self) -> u64 {
        self.part_size
            .as_deref()
            .and_then(parse_bytes)
            .map(clamp_part_size)
            .unwrap_or(DEFAULT_PART_SIZE)
    }

    pub fn part_timeout(&self) -> Option<Duration> {
        self.part_timeout.as_deref().and_then(parse_duration)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(default_pool_size)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs").join("vault-upload.log"))
    }

    pub fn queue_options(&self) -> QueueOptions {
        let retry = RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(RetryPolicy::default().max_attempts),
            ..RetryPolicy::default()
        };
        QueueOptions {
            max_concurrent_uploads: self
                .max_concurrent_uploads
                .unwrap_or(DEFAULT_MAX_CONCURRENT_UPLOADS),
            encryptor: EncryptorOptions {
                spool_dir: Some(self.spool_dir()),
                ..EncryptorOptions::default()
            },
            uploader: UploaderOptions {
                part_size: self.part_size(),
                part_concurrency: self.part_concurrency.unwrap_or(DEFAULT_PART_CONCURRENCY),
                retry,
            },
            retry,
        }
    }

    pub fn collection_keys(&self) -> Result<StaticCollectionKeys> {
        StaticCollectionKeys::from_base64(&self.collection_keys).context("collection_keys")
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub fn parse_duration(s: &str) -> Option<Duration> {
    // <int><unit> where unit is ms|s|m|h.
    let s = s.trim().to_lowercase();
    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map(|i| s.split_at(i))?;
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(n.checked_mul(3600)?)),
        _ => None,
    }
}

pub fn parse_bytes(s: &str) -> Option<u64> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    let upper = raw.to_uppercase();
    let (num, mult) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024_u64 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024_u64 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024_u64)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1_u64)
    } else {
        (upper.as_str(), 1_u64)
    };
    let n: u64 = num.trim().parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(n.saturating_mul(mult))
}
