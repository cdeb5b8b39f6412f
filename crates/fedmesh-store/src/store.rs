// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! S3-style object store at a custom endpoint.
//!
//! Objects are content-addressed: the key is the SHA-256 hex digest of the
//! body, which makes every upload idempotent and lets the short digest stand
//! in for the object on-chain while signed URLs are minted on demand.

use std::path::Path;
use std::time::Duration;

use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{BehaviorVersion, Region},
    error::SdkError,
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use sha2::{Digest, Sha256};

use fedmesh_config::StoreEnv;

use crate::{chunker, error::StoreError, manifest};

/// Default lifetime of presigned GET URLs.
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// Target dataset chunk size: one signed URL per chunk must fit comfortably
/// in an overlay message, and a chunk should be a quick download.
pub const DEFAULT_CHUNK_BYTES: usize = 50 * 1024;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ObjectStore {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl ObjectStore {
    pub fn new(env: &StoreEnv) -> Self {
        let credentials = Credentials::new(
            env.access_key.clone(),
            env.secret_key.clone(),
            None,
            None,
            "fedmesh-env",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            // The region is required by the SDK but ignored by custom
            // endpoints; MinIO-style stores accept anything.
            .region(Region::new("us-east-1"))
            .endpoint_url(&env.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: env.bucket.clone(),
            endpoint: env.endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Content hash of a payload — the object key convention.
    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Upload a payload under its content hash.  Already-present objects are
    /// not re-uploaded.
    pub async fn upload(&self, bytes: Vec<u8>) -> Result<String, StoreError> {
        let hash = Self::content_hash(&bytes);
        if self.exists(&hash).await? {
            tracing::debug!("object {hash} already stored");
            return Ok(hash);
        }

        self.retrying("upload", || async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&hash)
                .body(ByteStream::from(bytes.clone()))
                .send()
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await?;

        tracing::debug!("uploaded {} bytes as {hash}", bytes.len());
        Ok(hash)
    }

    pub async fn exists(&self, hash: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(hash)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(false),
            Err(e) => Err(StoreError::Storage(e.to_string())),
        }
    }

    /// Mint a time-limited GET URL for a stored object.
    pub async fn presign_get(&self, hash: &str, ttl: Duration) -> Result<String, StoreError> {
        self.retrying("presign", || async {
            let presigning = PresigningConfig::expires_in(ttl)
                .map_err(|e| StoreError::Presign(e.to_string()))?;
            let req = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(hash)
                .presigned(presigning)
                .await
                .map_err(|e| StoreError::Presign(e.to_string()))?;
            Ok(req.uri().to_string())
        })
        .await
    }

    /// Unauthenticated fallback URL for when presigning is unavailable; the
    /// UI observes the authorization error and retries via
    /// `/generate-presigned-url`.
    pub fn raw_url(&self, hash: &str) -> String {
        format!("{}/{}/{hash}", self.endpoint, self.bucket)
    }

    pub async fn fetch(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(hash)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx) if ctx.err().is_no_such_key() => {
                    StoreError::NotFound(hash.to_string())
                }
                _ => StoreError::Storage(e.to_string()),
            })?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }

    /// Administrative: keys of every stored object.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(resp
            .contents()
            .iter()
            .filter_map(|o| o.key().map(String::from))
            .collect())
    }

    /// Chunk a CSV dataset, upload every chunk, and publish the manifest.
    ///
    /// Returns the signed manifest URL and the chunk count — the two values
    /// the data owner passes to the wallet when funding the task.
    pub async fn upload_dataset_as_chunks(
        &self,
        path: &Path,
        chunk_bytes: usize,
    ) -> Result<(String, u32), StoreError> {
        let data = tokio::fs::read_to_string(path).await?;
        let chunks = chunker::chunk_csv(&data, chunk_bytes)?;
        let count = u32::try_from(chunks.len())
            .map_err(|_| StoreError::Dataset("chunk count overflows u32".into()))?;

        let mut urls = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let hash = self.upload(chunk.into_bytes()).await?;
            let url = self.presign_get(&hash, DEFAULT_PRESIGN_TTL).await?;
            tracing::debug!("chunk {i} stored as {hash}");
            urls.push(url);
        }

        let manifest_hash = self.upload(manifest::build(&urls).into_bytes()).await?;
        let manifest_url = self.presign_get(&manifest_hash, DEFAULT_PRESIGN_TTL).await?;
        tracing::info!("dataset {} split into {count} chunks", path.display());
        Ok((manifest_url, count))
    }

    async fn retrying<T, F, Fut>(&self, what: &str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut last = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt < RETRY_ATTEMPTS {
                        tracing::warn!("{what} attempt {attempt} failed: {e}; retrying");
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| StoreError::Storage(format!("{what}: no attempt made"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        // SHA-256 of the empty input.
        assert_eq!(
            ObjectStore::content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(ObjectStore::content_hash(b"weights").len(), 64);
    }

    #[test]
    fn raw_url_fallback_points_into_the_bucket() {
        let store = ObjectStore::new(&fedmesh_config::StoreEnv {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            endpoint: "http://localhost:9009/".into(),
            bucket: "fedmesh".into(),
        });
        let hash = "ab".repeat(32);
        assert_eq!(
            store.raw_url(&hash),
            format!("http://localhost:9009/fedmesh/{hash}")
        );
    }
}
