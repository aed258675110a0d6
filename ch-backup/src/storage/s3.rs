//! S3-compatible backend.
//!
//! Requests are presigned with `rusty-s3` and sent through a shared `reqwest`
//! client, which carries the per-request timeout, the extra CA bundle and the
//! optional egress proxy.

use super::{CompletedPart, ObjectInfo, ObjectStore, StorageResult};
use crate::config::StorageConfig;
use crate::utils::errors::{BackupError, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use std::time::Duration;
use tracing::{debug, instrument};

const PRESIGN_TTL: Duration = Duration::from_secs(3600);

pub struct S3Store {
    http: reqwest::Client,
    bucket: Bucket,
    credentials: Option<Credentials>,
}

impl S3Store {
    pub fn new(config: &StorageConfig, proxy: Option<String>) -> Result<Self> {
        let creds = &config.credentials;
        let endpoint = creds
            .endpoint_url
            .as_deref()
            .ok_or_else(|| BackupError::Configuration("storage.credentials.endpoint_url is required".to_string()))?;
        let bucket_name = creds
            .bucket
            .clone()
            .ok_or_else(|| BackupError::Configuration("storage.credentials.bucket is required".to_string()))?;

        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| BackupError::Configuration(format!("invalid storage endpoint {endpoint}: {e}")))?;
        let bucket = Bucket::new(endpoint, UrlStyle::Path, bucket_name, creds.region.clone())
            .map_err(|e| BackupError::Configuration(format!("invalid bucket settings: {e}")))?;

        let credentials = match (&creds.access_key_id, &creds.secret_access_key) {
            (Some(key), Some(secret)) => Some(Credentials::new(key.clone(), secret.clone())),
            (None, None) => None,
            _ => {
                return Err(BackupError::Configuration(
                    "access_key_id and secret_access_key must be set together".to_string(),
                ))
            }
        };

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&proxy)?);
        }
        for ca in &config.ca_bundle {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            bucket,
            credentials,
        })
    }

    fn creds(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

/// 404 means missing; throttling, timeouts and 5xx are worth retrying.
fn status_error(key: &str, status: StatusCode, body: &str) -> StorageError {
    let message = format!("{status}: {}", body.chars().take(512).collect::<String>());
    if status == StatusCode::NOT_FOUND {
        StorageError::not_found(key)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StorageError::transient(key, message)
    } else {
        StorageError::permanent(key, message)
    }
}

fn request_error(key: &str, err: reqwest::Error) -> StorageError {
    if err.is_builder() {
        StorageError::permanent(key, err)
    } else {
        StorageError::transient(key, err)
    }
}

async fn check(key: &str, response: std::result::Result<Response, reqwest::Error>) -> StorageResult<Response> {
    let response = response.map_err(|e| request_error(key, e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(key, status, &body))
}

fn parse_s3_time(key: &str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::permanent(key, format!("bad timestamp {value:?}: {e}")))
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let url = self.bucket.put_object(self.creds(), key).sign(PRESIGN_TTL);
        check(key, self.http.put(url).body(data).send().await).await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put_if_absent(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let url = self.bucket.put_object(self.creds(), key).sign(PRESIGN_TTL);
        let response = self
            .http
            .put(url)
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .body(data)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => Ok(false),
            // A concurrent conditional write to the same key is still in flight.
            StatusCode::CONFLICT => Err(StorageError::transient(key, "conditional write conflict")),
            _ => check(key, Ok(response)).await.map(|_| true),
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let url = self.bucket.get_object(self.creds(), key).sign(PRESIGN_TTL);
        let response = check(key, self.http.get(url).send().await).await?;
        response.bytes().await.map_err(|e| request_error(key, e))
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        let url = self.bucket.head_object(self.creds(), key).sign(PRESIGN_TTL);
        let response = match check(key, self.http.head(url).send().await).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let last_modified = match headers.get(reqwest::header::LAST_MODIFIED).and_then(|v| v.to_str().ok()) {
            Some(value) => parse_s3_time(key, value)?,
            None => Utc::now(),
        };

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size,
            last_modified,
        }))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let url = {
                let mut action = self.bucket.list_objects_v2(self.creds());
                action.with_prefix(prefix);
                if let Some(token) = token.as_deref() {
                    action.with_continuation_token(token);
                }
                action.sign(PRESIGN_TTL)
            };

            let response = check(prefix, self.http.get(url).send().await).await?;
            let text = response.text().await.map_err(|e| request_error(prefix, e))?;
            let page = ListObjectsV2::parse_response(&text)
                .map_err(|e| StorageError::permanent(prefix, format!("bad listing: {e}")))?;

            for entry in page.contents {
                let last_modified = parse_s3_time(&entry.key, &entry.last_modified)?;
                objects.push(ObjectInfo {
                    key: entry.key,
                    size: entry.size,
                    last_modified,
                });
            }

            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let url = self.bucket.delete_object(self.creds(), key).sign(PRESIGN_TTL);
        match check(key, self.http.delete(url).send().await).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let url = self.bucket.create_multipart_upload(self.creds(), key).sign(PRESIGN_TTL);
        let response = check(key, self.http.post(url).send().await).await?;
        let text = response.text().await.map_err(|e| request_error(key, e))?;
        let parsed = CreateMultipartUpload::parse_response(&text)
            .map_err(|e| StorageError::permanent(key, format!("bad multipart response: {e}")))?;
        Ok(parsed.upload_id().to_string())
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u16, data: Bytes) -> StorageResult<String> {
        let url = self
            .bucket
            .upload_part(self.creds(), key, part_number, upload_id)
            .sign(PRESIGN_TTL);
        let response = check(key, self.http.put(url).body(data).send().await).await?;
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::transient(key, format!("part {part_number} returned no ETag")))
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> StorageResult<()> {
        let action = self.bucket.complete_multipart_upload(
            self.creds(),
            key,
            upload_id,
            parts.iter().map(|p| p.etag.as_str()),
        );
        // `body` consumes the action, so sign first.
        let url = action.sign(PRESIGN_TTL);
        let body = action.body();

        let response = check(key, self.http.post(url).body(body).send().await).await?;
        // S3 may report a failed commit inside a 200 response.
        let text = response.text().await.map_err(|e| request_error(key, e))?;
        if text.contains("<Error>") {
            if text.contains("NoSuchUpload") {
                return Err(StorageError::not_found(key));
            }
            return Err(StorageError::transient(key, text));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let url = self
            .bucket
            .abort_multipart_upload(self.creds(), key, upload_id)
            .sign(PRESIGN_TTL);
        match check(key, self.http.delete(url).send().await).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
