use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::ETAG;
use reqwest::{Client as HttpClient, ClientBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::crypto::SealedBox;
use crate::source::Fingerprint;
use crate::telemetry::TransferStats;

const CONTENT_MD5: &str = "content-md5";

/// Remote side of the pipeline: presigned storage plus the metadata API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Allocates a fresh object and `count` presigned part URLs for it.
    async fn request_upload_urls(&self, count: u32) -> Result<UploadUrls>;

    /// PUTs one part; returns the etag storage assigned to it.
    async fn upload_part(&self, url: &str, body: Bytes, content_md5: &str) -> Result<String>;

    async fn complete_multipart_upload(
        &self,
        object_key: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, object_key: &str) -> Result<()>;

    /// Records the file in its collection; returns the remote file id.
    async fn commit_file_metadata(&self, req: &CommitFileRequest) -> Result<i64>;

    async fn existing_fingerprints(&self, collection_id: i64) -> Result<Vec<Fingerprint>>;
}

#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: HttpClient,
    part_client: HttpClient,
    part_timeout: Option<Duration>,
    stats: Arc<TransferStats>,
}

impl ApiClient {
    pub fn new(
        base: &str,
        auth_token: Option<&str>,
        part_timeout: Option<Duration>,
        stats: Arc<TransferStats>,
    ) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("vault-upload/", env!("CARGO_PKG_VERSION")))
            .no_proxy();

        if let Some(token) = auth_token {
            builder = builder.default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                let value = format!("Bearer {token}");
                h.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&value)?,
                );
                h
            });
        }

        // Presigned URLs carry their own auth; no bearer header here.
        let part_client = ClientBuilder::new()
            .timeout(Duration::from_secs(30 * 60))
            .connect_timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;

        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http: builder.build()?,
            part_client,
            part_timeout,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    pub async fn healthz(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base);
        let resp = self.http.get(url).send().await?;
        map_status(resp, "healthz").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/files{path}", self.base)
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn request_upload_urls(&self, count: u32) -> Result<UploadUrls> {
        let resp = self
            .http
            .post(self.url("/upload-urls"))
            .json(&UploadUrlsRequest { count })
            .send()
            .await?;
        let urls: UploadUrls = map_error(resp, "upload urls").await?;
        if urls.parts.len() != count as usize {
            anyhow::bail!(
                "upload urls: asked for {count} parts, got {}",
                urls.parts.len()
            );
        }
        Ok(urls)
    }

    async fn upload_part(&self, url: &str, body: Bytes, content_md5: &str) -> Result<String> {
        let len = body.len() as u64;
        let mut req = self
            .part_client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_MD5, content_md5)
            .body(body);
        if let Some(d) = self.part_timeout {
            req = req.timeout(d);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(err) => {
                self.stats.set_last_error(&err);
                return Err(err.into());
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("upload part failed: {status} {text}");
            self.stats.set_last_error(&err);
            return Err(err);
        }

        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .filter(|s| !s.is_empty());
        let Some(etag) = etag else {
            let err = anyhow::anyhow!("upload part: {status} without ETag header");
            self.stats.set_last_error(&err);
            return Err(err);
        };
        self.stats.on_part_sent(len);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        object_key: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/multipart/complete"))
            .json(&CompleteMultipartUploadRequest { object_key, parts })
            .send()
            .await?;
        map_status(resp, "multipart complete").await
    }

    async fn abort_multipart_upload(&self, object_key: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/multipart/abort"))
            .json(&AbortMultipartUploadRequest { object_key })
            .send()
            .await?;
        map_status(resp, "multipart abort").await
    }

    async fn commit_file_metadata(&self, req: &CommitFileRequest) -> Result<i64> {
        let resp = self.http.post(self.url("")).json(req).send().await?;
        let out: CommitFileResponse = map_error(resp, "commit file").await?;
        Ok(out.id)
    }

    async fn existing_fingerprints(&self, collection_id: i64) -> Result<Vec<Fingerprint>> {
        let resp = self
            .http
            .get(self.url("/fingerprints"))
            .query(&[("collectionID", collection_id)])
            .send()
            .await?;
        let out: FingerprintsResponse = map_error(resp, "list fingerprints").await?;
        Ok(out.fingerprints)
    }
}

async fn map_error<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        let val = resp.json::<T>().await?;
        return Ok(val);
    }

    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => anyhow::bail!("{op} unauthorized: {text}"),
        StatusCode::FORBIDDEN => anyhow::bail!("{op} forbidden: {text}"),
        StatusCode::NOT_FOUND => anyhow::bail!("{op} not found: {text}"),
        _ => anyhow::bail!("{op} failed: {status} {text}"),
    }
}

async fn map_status(resp: Response, op: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => anyhow::bail!("{op} unauthorized: {text}"),
        StatusCode::FORBIDDEN => anyhow::bail!("{op} forbidden: {text}"),
        StatusCode::NOT_FOUND => anyhow::bail!("{op} not found: {text}"),
        _ => anyhow::bail!("{op} failed: {status} {text}"),
    }
}

#[derive(Debug, Serialize)]
struct UploadUrlsRequest {
    count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrls {
    pub object_key: String,
    pub parts: Vec<PresignedPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPart {
    pub part_number: u32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    #[serde(rename = "partNumber")]
    pub part_number: u32,
    #[serde(rename = "etag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteMultipartUploadRequest<'a> {
    object_key: &'a str,
    parts: &'a [CompletedPart],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AbortMultipartUploadRequest<'a> {
    object_key: &'a str,
}

/// Everything the API needs to add an uploaded object to a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFileRequest {
    #[serde(rename = "collectionID")]
    pub collection_id: i64,
    pub object_key: String,
    pub object_size: u64,
    /// Base64 encryption header of the file content.
    pub decryption_header: String,
    pub encrypted_key: SealedBox,
    pub metadata: SealedBox,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Deserialize)]
struct CommitFileResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct FingerprintsResponse {
    #[serde(default)]
    fingerprints: Vec<Fingerprint>,
}
