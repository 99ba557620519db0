//! Push pipeline
//!
//! Uploads blobs and manifests to a target registry, driven by a deploy
//! metadata document so the final step is data-driven and re-runnable.
//! Two strategies: **eager** treats the push as a local operation (all
//! blobs already materialized in the local store), **lazy** resolves
//! blobs that live only in a remote content store and streams them to
//! the registry without touching the local disk store.
//!
//! Ordering guarantee: every manifest PUT is sequenced after all blobs
//! it references report success. Blob movement runs on a worker pool of
//! `min(8, cpus)` bounded by a semaphore.

use crate::blobstore::BlobStore;
use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::logging::Logger;
use crate::oci::OciDescriptor;
use crate::registry::client::{RegistryClient, UPLOAD_CHUNK_SIZE};
use crate::template::{TemplateContext, expand};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Blobs at or below this size upload monolithically
const MONOLITHIC_LIMIT: i64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStrategy {
    Eager,
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    Manifest,
    Index,
}

/// One manifest the deploy covers, with its blob set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployManifestEntry {
    pub descriptor: OciDescriptor,
    /// Config plus layer blobs referenced by this manifest
    #[serde(default)]
    pub layer_blobs: Vec<OciDescriptor>,
    /// Digests known to be absent from the local store (lazy strategy)
    #[serde(default)]
    pub missing_blobs: Vec<String>,
}

/// The data-driven description of one push or load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployMetadata {
    pub command: String,
    pub strategy: PushStrategy,
    pub root: OciDescriptor,
    pub root_kind: RootKind,
    pub manifests: Vec<DeployManifestEntry>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<String>,
    /// Provenance: where the base image was pulled from
    #[serde(default)]
    pub original_registries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_digest: Option<String>,
}

impl DeployMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| ImageError::Parse(format!("Malformed deploy metadata: {}", e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = crate::oci::canonical_json(self)?;
        std::fs::write(path, bytes)
            .map_err(|e| ImageError::Io(format!("Failed to write {}: {}", path.display(), e)))
    }
}

/// Resolve the effective tag list: literal tags, a newline-delimited
/// tag file, or template expansion over the stamp context.
pub fn resolve_tags(
    tags: &[String],
    tag_file: Option<&Path>,
    context: &TemplateContext,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for tag in tags {
        out.push(expand(tag, context)?);
    }
    if let Some(path) = tag_file {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        for line in contents.lines() {
            let line = line.trim();
            if !line.is_empty() {
                out.push(expand(line, context)?);
            }
        }
    }
    Ok(out)
}

fn pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

pub struct Pusher {
    client: Arc<RegistryClient>,
    store: Arc<BlobStore>,
    repository: String,
    /// Repository to attempt cross-repo blob mounts from
    mount_from: Option<String>,
    logger: Logger,
    limit: Arc<Semaphore>,
}

impl Pusher {
    pub fn new(
        client: Arc<RegistryClient>,
        store: Arc<BlobStore>,
        repository: String,
        logger: Logger,
    ) -> Self {
        Self {
            client,
            store,
            repository,
            mount_from: None,
            logger,
            limit: Arc::new(Semaphore::new(pool_size())),
        }
    }

    pub fn with_mount_source(mut self, from: Option<String>) -> Self {
        self.mount_from = from;
        self
    }

    /// Execute the push described by the metadata, then apply tags
    pub async fn push(&self, metadata: &DeployMetadata, tags: &[String]) -> Result<()> {
        self.logger.section("Pushing image");
        for entry in &metadata.manifests {
            match metadata.strategy {
                PushStrategy::Eager => self.push_manifest_eager(entry).await?,
                PushStrategy::Lazy => self.push_manifest_lazy(entry, metadata).await?,
            }
        }
        if metadata.root_kind == RootKind::Index {
            self.put_manifest_blob(&metadata.root, &metadata.root.digest)
                .await?;
        }
        for tag in tags {
            self.put_manifest_blob(&metadata.root, tag).await?;
            self.logger.success(&format!(
                "Tagged {} as {}:{}",
                metadata.root.digest, self.repository, tag
            ));
        }
        if tags.is_empty() {
            self.logger.success(&format!(
                "Pushed {} to {}",
                metadata.root.digest, self.repository
            ));
        }
        Ok(())
    }

    /// Upload order: config first, then layers smallest-first, so quick
    /// wins come early and the big transfers overlap.
    fn sorted_blobs(entry: &DeployManifestEntry) -> Vec<OciDescriptor> {
        let mut blobs = entry.layer_blobs.clone();
        blobs.sort_by_key(|blob| {
            let is_config = blob.media_type.contains("config");
            (!is_config, blob.size)
        });
        blobs
    }

    async fn push_manifest_eager(&self, entry: &DeployManifestEntry) -> Result<()> {
        let blobs = Self::sorted_blobs(entry);
        let uploads = blobs.iter().map(|blob| self.push_blob_from_store(blob));
        // The manifest PUT below is sequenced after every blob succeeds.
        for result in futures::future::join_all(uploads).await {
            result?;
        }
        self.put_manifest_blob(&entry.descriptor, &entry.descriptor.digest)
            .await
    }

    async fn push_manifest_lazy(
        &self,
        entry: &DeployManifestEntry,
        metadata: &DeployMetadata,
    ) -> Result<()> {
        let missing: std::collections::HashSet<&str> =
            entry.missing_blobs.iter().map(String::as_str).collect();
        let blobs = Self::sorted_blobs(entry);
        let uploads = blobs.iter().map(|blob| async {
            if missing.contains(blob.digest.as_str()) {
                self.push_blob_from_remote_cas(blob, metadata).await
            } else {
                self.push_blob_from_store(blob).await
            }
        });
        for result in futures::future::join_all(uploads).await {
            result?;
        }
        self.put_manifest_blob(&entry.descriptor, &entry.descriptor.digest)
            .await
    }

    /// Upload one locally materialized blob, skipping blobs the
    /// registry already has and trying a cross-repo mount first.
    async fn push_blob_from_store(&self, blob: &OciDescriptor) -> Result<()> {
        let _permit = self.limit.acquire().await.expect("semaphore closed");
        let digest = blob.parsed_digest()?;
        if self.client.blob_exists(&self.repository, &digest).await? {
            self.logger
                .detail(&format!("Blob {} already present", digest.short()));
            return Ok(());
        }
        if self.try_mount(&digest).await? {
            return Ok(());
        }
        if blob.size <= MONOLITHIC_LIMIT {
            let data = self.store.read_small(&digest)?;
            self.client
                .upload_blob_monolithic(&self.repository, &digest, data.as_ref().clone())
                .await?;
        } else {
            let mut reader = self.store.open(&digest)?;
            self.client
                .upload_blob_chunked(&self.repository, &digest, &mut reader, UPLOAD_CHUNK_SIZE)
                .await?;
        }
        self.logger.detail(&format!(
            "Uploaded blob {} ({} bytes)",
            digest.short(),
            blob.size
        ));
        Ok(())
    }

    /// Lazy path: the blob exists only in the remote content store.
    /// Mount if possible, else stream remote to registry; local disk
    /// reads: zero.
    async fn push_blob_from_remote_cas(
        &self,
        blob: &OciDescriptor,
        metadata: &DeployMetadata,
    ) -> Result<()> {
        let _permit = self.limit.acquire().await.expect("semaphore closed");
        let digest = blob.parsed_digest()?;
        if self.client.blob_exists(&self.repository, &digest).await? {
            return Ok(());
        }
        if self.try_mount(&digest).await? {
            return Ok(());
        }

        let endpoint = std::env::var("IMG_REAPI_ENDPOINT").map_err(|_| {
            ImageError::Validation(
                "Lazy push requires IMG_REAPI_ENDPOINT to locate the remote content store"
                    .to_string(),
            )
        })?;
        let url = format!(
            "{}/cas/v1/blobs/{}/{}",
            endpoint.trim_end_matches('/'),
            digest.algorithm,
            digest.hex
        );
        self.logger.detail(&format!(
            "Streaming {} from remote store",
            digest.short()
        ));
        let response = self
            .client
            .transport()
            .get(&url, None)
            .await?;
        if response.status != 200 {
            return Err(ImageError::NotFound(format!(
                "Blob {} not in remote content store ({} returned {})",
                digest, url, response.status
            )));
        }
        match response.body {
            crate::transport::TransportBody::Bytes(bytes) => {
                self.client
                    .upload_blob_monolithic(&self.repository, &digest, bytes.as_ref().clone())
                    .await
            }
            crate::transport::TransportBody::File(mut file) => {
                // Should not happen for lazy blobs, but stream it anyway.
                let mut reader = &mut file;
                self.client
                    .upload_blob_chunked(&self.repository, &digest, &mut reader, UPLOAD_CHUNK_SIZE)
                    .await
                    .map(|_| ())
            }
            crate::transport::TransportBody::Remote(remote) => {
                let size = blob.size as u64;
                let stream = remote.bytes_stream().map_err(std::io::Error::other);
                let body = reqwest::Body::wrap_stream(stream);
                self.client
                    .upload_blob_streaming(&self.repository, &digest, size, body)
                    .await
            }
        }
    }

    /// Cross-repository mount from the original pull source
    async fn try_mount(&self, digest: &Digest) -> Result<bool> {
        if self.client.transport().is_airgapped() {
            return Ok(false);
        }
        let from = match &self.mount_from {
            Some(from) if *from != self.repository => from.clone(),
            _ => return Ok(false),
        };
        let mounted = self.client.mount_blob(&self.repository, digest, &from).await?;
        if mounted {
            self.logger
                .detail(&format!("Mounted {} from {}", digest.short(), from));
        }
        Ok(mounted)
    }

    /// PUT a manifest or index blob under a reference (digest or tag)
    async fn put_manifest_blob(&self, descriptor: &OciDescriptor, reference: &str) -> Result<()> {
        let digest = descriptor.parsed_digest()?;
        let data = self.store.read_small(&digest)?;
        self.client
            .put_manifest(
                &self.repository,
                reference,
                data.as_ref().clone(),
                &descriptor.media_type,
            )
            .await?;
        Ok(())
    }
}
