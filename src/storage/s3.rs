//! AWS S3 storage implementation.
//!
//! Records are read-modify-written with conditional puts:
//! - existing objects are replaced with `If-Match: {etag}`
//! - new objects are created with `If-None-Match: *`
//!
//! A lost race (412) re-reads and re-merges, so concurrent crawl workers
//! on separate hosts never overwrite each other's newer content.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{AppError, Result};
use crate::models::{ChangelogRecord, Identity, RecordPatch, RegistryKind, apply_patch};
use crate::storage::{
    ArtifactStore, ChangeStore, Lease, ScanFilter, ScanOrder, Upserted, paths, select_records,
};

/// Attempts at a conditional write before reporting contention.
const MAX_CONDITIONAL_ATTEMPTS: u32 = 5;

/// Concurrent GETs while scanning records.
const SCAN_CONCURRENCY: usize = 16;

/// Object body plus the ETag it was read at.
struct Versioned {
    bytes: Vec<u8>,
    etag: Option<String>,
}

/// Precondition for a conditional put.
enum WriteCondition<'a> {
    Unconditional,
    /// Object must not exist yet
    Absent,
    /// Object must still carry this ETag
    Matches(&'a str),
}

enum PutOutcome {
    Written,
    PreconditionFailed,
}

/// Bucket and key-prefix addressing shared by the S3 backends.
#[derive(Clone)]
struct S3Objects {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Objects {
    fn key(&self, path: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            path.to_string()
        } else {
            format!("{prefix}/{path}")
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        let key = self.key(path);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| AppError::S3(e.to_string()))?;
                Ok(Some(Versioned {
                    bytes: bytes.into_bytes().to_vec(),
                    etag,
                }))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    debug!("No object at s3://{}/{}", self.bucket, key);
                    Ok(None)
                } else {
                    Err(AppError::S3(service_err.to_string()))
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<(T, Option<String>)>> {
        match self.get(path).await? {
            Some(v) => Ok(Some((serde_json::from_slice(&v.bytes)?, v.etag))),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        condition: WriteCondition<'_>,
    ) -> Result<PutOutcome> {
        let key = self.key(path);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type);
        request = match condition {
            WriteCondition::Unconditional => request,
            WriteCondition::Absent => request.if_none_match("*"),
            WriteCondition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(err) if is_precondition_failure(&err) => {
                debug!("Conditional write lost on s3://{}/{}", self.bucket, key);
                Ok(PutOutcome::PreconditionFailed)
            }
            Err(err) => Err(AppError::S3(err.into_service_error().to_string())),
        }
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
        condition: WriteCondition<'_>,
    ) -> Result<PutOutcome> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put(path, bytes, "application/json", condition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| AppError::S3(e.into_service_error().to_string()))?;
        Ok(())
    }

    /// Paths (relative to the prefix) of every object under `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let key_prefix = format!("{}/", self.key(dir));
        let strip = self.key("");
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&key_prefix)
            .into_paginator()
            .send();

        let mut paths = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| AppError::S3(e.into_service_error().to_string()))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    paths.push(key.strip_prefix(&strip).unwrap_or(key).to_string());
                }
            }
        }
        Ok(paths)
    }
}

fn is_precondition_failure<E>(err: &SdkError<E>) -> bool {
    err.raw_response()
        .map(|r| matches!(r.status().as_u16(), 409 | 412))
        .unwrap_or(false)
}

async fn client_from_env() -> Result<(Client, String, String)> {
    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let client = Client::new(&config);

    let bucket = std::env::var("S3_BUCKET")
        .map_err(|_| AppError::config("S3_BUCKET environment variable is not set"))?;
    let prefix = std::env::var("S3_PREFIX").unwrap_or_default();
    Ok((client, bucket, prefix))
}

/// S3-backed change store with conditional-write upserts.
#[derive(Clone)]
pub struct S3ChangeStore {
    objects: S3Objects,
}

impl S3ChangeStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            objects: S3Objects {
                client,
                bucket: bucket.into(),
                prefix: prefix.into(),
            },
        }
    }

    /// Create the store from `S3_BUCKET` / `S3_PREFIX`, with records under `{prefix}/state`.
    pub async fn from_env() -> Result<Self> {
        let (client, bucket, prefix) = client_from_env().await?;
        let prefix = format!("{}/state", prefix.trim_end_matches('/'))
            .trim_start_matches('/')
            .to_string();
        info!("Using S3 change store at s3://{}/{}", bucket, prefix);
        Ok(Self::new(client, bucket, prefix))
    }
}

#[async_trait]
impl ChangeStore for S3ChangeStore {
    async fn get(&self, identity: &Identity) -> Result<Option<ChangelogRecord>> {
        Ok(self
            .objects
            .get_json(&paths::record(identity))
            .await?
            .map(|(record, _)| record))
    }

    async fn upsert(
        &self,
        identity: &Identity,
        patch: &RecordPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Upserted>> {
        let path = paths::record(identity);

        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            let existing: Option<(ChangelogRecord, Option<String>)> =
                self.objects.get_json(&path).await?;
            let current = existing.as_ref().map(|(r, _)| r);

            let Some((record, outcome)) = apply_patch(identity, current, patch, now) else {
                return Ok(None);
            };
            if current == Some(&record) {
                return Ok(Some(Upserted { record, outcome }));
            }

            let condition = match existing.as_ref() {
                Some((_, Some(etag))) => WriteCondition::Matches(etag),
                Some((_, None)) => WriteCondition::Unconditional,
                None => WriteCondition::Absent,
            };
            match self.objects.put_json(&path, &record, condition).await? {
                PutOutcome::Written => return Ok(Some(Upserted { record, outcome })),
                PutOutcome::PreconditionFailed => {
                    warn!("Upsert race on {} (attempt {}), re-merging", identity, attempt);
                }
            }
        }

        Err(AppError::StoreContention {
            identity: identity.to_string(),
            attempts: MAX_CONDITIONAL_ATTEMPTS,
        })
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChangelogRecord>> {
        let registries: Vec<RegistryKind> = match filter.registry {
            Some(registry) => vec![registry],
            None => RegistryKind::ALL.to_vec(),
        };

        let mut keys = Vec::new();
        for registry in registries {
            keys.extend(self.objects.list(&paths::records_dir(registry)).await?);
        }

        let results: Vec<Result<Option<(ChangelogRecord, Option<String>)>>> =
            stream::iter(keys.iter())
                .map(|key| self.objects.get_json::<ChangelogRecord>(key))
                .buffer_unordered(SCAN_CONCURRENCY)
                .collect()
                .await;

        let mut records = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(Some((record, _))) => records.push(record),
                Ok(None) => {}
                Err(AppError::Json(e)) => warn!("Skipping unreadable record: {}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(select_records(records, filter, order, limit))
    }

    async fn load_cursor(&self, registry: RegistryKind) -> Result<Option<String>> {
        Ok(self
            .objects
            .get_json(&paths::cursor(registry))
            .await?
            .map(|(cursor, _)| cursor))
    }

    async fn save_cursor(&self, registry: RegistryKind, cursor: &str) -> Result<()> {
        self.objects
            .put_json(&paths::cursor(registry), cursor, WriteCondition::Unconditional)
            .await?;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let path = paths::lease(name);
        let existing: Option<(Lease, Option<String>)> = self.objects.get_json(&path).await?;
        if !Lease::available_to(existing.as_ref().map(|(l, _)| l), holder, now) {
            return Ok(false);
        }

        let condition = match existing.as_ref() {
            Some((_, Some(etag))) => WriteCondition::Matches(etag),
            Some((_, None)) => WriteCondition::Unconditional,
            None => WriteCondition::Absent,
        };
        let lease = Lease::new(holder, ttl, now);
        Ok(matches!(
            self.objects.put_json(&path, &lease, condition).await?,
            PutOutcome::Written
        ))
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let path = paths::lease(name);
        let existing: Option<(Lease, Option<String>)> = self.objects.get_json(&path).await?;
        if existing.is_some_and(|(l, _)| l.holder == holder) {
            self.objects.delete(&path).await?;
        }
        Ok(())
    }
}

/// S3-backed public artifact store.
#[derive(Clone)]
pub struct S3ArtifactStore {
    objects: S3Objects,
}

impl S3ArtifactStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            objects: S3Objects {
                client,
                bucket: bucket.into(),
                prefix: prefix.into(),
            },
        }
    }

    /// Create the store from `S3_BUCKET` / `S3_PREFIX`, with artifacts under `{prefix}/public`.
    pub async fn from_env() -> Result<Self> {
        Self::from_env_at("public").await
    }

    /// Same bucket, objects under `{prefix}/{section}`.
    pub async fn from_env_at(section: &str) -> Result<Self> {
        let (client, bucket, prefix) = client_from_env().await?;
        let prefix = format!("{}/{}", prefix.trim_end_matches('/'), section)
            .trim_start_matches('/')
            .to_string();
        info!("Using S3 artifact store at s3://{}/{}", bucket, prefix);
        Ok(Self::new(client, bucket, prefix))
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, path: &str, content: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .put(path, content, content_type, WriteCondition::Unconditional)
            .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.get(path).await?.map(|v| v.bytes))
    }
}
