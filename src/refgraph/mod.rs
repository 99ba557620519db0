//! Pull and reference-graph synchronization
//!
//! Downloads top-level manifests and indexes plus their children,
//! persists blobs into the local store, and maintains the cached
//! reference graph ("facts") across runs. Children are only enumerated
//! after their parent manifest is on disk and verified. Each image
//! declares one or more sources; the `repository@registry` candidates
//! are tried in a rotated order to spread load across mirrors.

use crate::blobstore::BlobStore;
use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::logging::Logger;
use crate::oci::{ImageManifest, ManifestOrIndex};
use crate::registry::auth::Keychain;
use crate::registry::client::RegistryClient;
use crate::transport::{CachedBlobTransport, TransportBody};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const FACT_KEY_PREFIX: &str = "oci_ref_graph@";

/// One node of the cached reference graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RefGraphEntry {
    Manifest {
        config: String,
        layers: Vec<String>,
    },
    Index {
        manifests: Vec<String>,
    },
}

/// The facts file: graph entries keyed `oci_ref_graph@<digest>`
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Facts(pub BTreeMap<String, RefGraphEntry>);

impl Facts {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Facts::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| ImageError::Parse(format!("Malformed facts file: {}", e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(&serde_json::to_value(&self.0)?)?;
        let mut file = std::fs::File::create(path)
            .map_err(|e| ImageError::Io(format!("Failed to write {}: {}", path.display(), e)))?;
        file.write_all(&json)?;
        Ok(())
    }

    pub fn get(&self, digest: &Digest) -> Option<&RefGraphEntry> {
        self.0.get(&format!("{}{}", FACT_KEY_PREFIX, digest))
    }

    pub fn insert(&mut self, digest: &Digest, entry: RefGraphEntry) {
        self.0.insert(format!("{}{}", FACT_KEY_PREFIX, digest), entry);
    }
}

/// When layer blobs are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayerHandling {
    /// Only manifest and config are required locally
    Shallow,
    /// All layer blobs are prefetched
    Eager,
    /// Manifest and config locally; layers fetched later on demand
    #[default]
    Lazy,
}

/// Merge rule when the same digest is requested twice: non-shallow wins
/// over shallow; within eager/lazy a root-module request wins, then
/// eager over lazy.
pub fn merge_handling(
    a: LayerHandling,
    a_root: bool,
    b: LayerHandling,
    b_root: bool,
) -> LayerHandling {
    use LayerHandling::*;
    match (a, b) {
        (Shallow, other) => other,
        (other, Shallow) => other,
        (a, b) if a == b => a,
        (a, b) => {
            if a_root != b_root {
                if a_root { a } else { b }
            } else if a == Eager || b == Eager {
                Eager
            } else {
                Lazy
            }
        }
    }
}

/// `(repository, [registries])`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullSource {
    pub repository: String,
    pub registries: Vec<String>,
}

/// One image to synchronize, as read from `images.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub digest: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub layer_handling: LayerHandling,
    pub sources: Vec<PullSource>,
    #[serde(default)]
    pub root_module: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImagesFile {
    pub images: Vec<ImageRequest>,
}

/// All `repository@registry` candidates, rotated so repeated runs do
/// not always hammer the first mirror
fn candidates(sources: &[PullSource]) -> Vec<(String, String)> {
    let mut all = Vec::new();
    for source in sources {
        for registry in &source.registries {
            all.push((registry.clone(), source.repository.clone()));
        }
    }
    if all.len() > 1 {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as usize)
            .unwrap_or(0);
        let len = all.len();
        all.rotate_left(seed % len);
    }
    all
}

pub struct RefGraphSync {
    store: Arc<BlobStore>,
    keychain: Arc<Keychain>,
    logger: Logger,
    airgapped: bool,
    limit: Arc<Semaphore>,
}

impl RefGraphSync {
    pub fn new(store: Arc<BlobStore>, keychain: Arc<Keychain>, logger: Logger, airgapped: bool) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(8);
        Self {
            store,
            keychain,
            logger,
            airgapped,
            limit: Arc::new(Semaphore::new(workers)),
        }
    }

    fn client_for(&self, registry: &str) -> Result<RegistryClient> {
        let registry_url = if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.to_string()
        } else {
            format!("https://{}", registry)
        };
        let host = registry_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let http = reqwest::Client::new();
        let transport = Arc::new(CachedBlobTransport::new(
            self.store.clone(),
            http,
            self.airgapped,
        ));
        let credentials = self.keychain.resolve(host);
        RegistryClient::builder(registry_url)
            .with_credentials(credentials)
            .with_transport(transport)
            .with_logger(self.logger.clone())
            .build()
    }

    /// Synchronize every requested image into the store and the facts
    /// map. Requests for the same digest are merged first.
    pub async fn sync(&self, facts: &mut Facts, images: &[ImageRequest]) -> Result<()> {
        let mut merged: BTreeMap<String, ImageRequest> = BTreeMap::new();
        for image in images {
            match merged.get_mut(&image.digest) {
                Some(existing) => {
                    existing.layer_handling = merge_handling(
                        existing.layer_handling,
                        existing.root_module,
                        image.layer_handling,
                        image.root_module,
                    );
                    existing.root_module |= image.root_module;
                    existing.sources.extend(image.sources.iter().cloned());
                }
                None => {
                    merged.insert(image.digest.clone(), image.clone());
                }
            }
        }

        // Top-level images download concurrently; the facts map is
        // shared behind a lock that is never held across a fetch.
        let shared = tokio::sync::Mutex::new(std::mem::take(facts));
        let results = futures::future::join_all(
            merged
                .values()
                .map(|image| self.sync_one(&shared, image)),
        )
        .await;
        *facts = shared.into_inner();
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Fetch one top-level image and its children
    async fn sync_one(
        &self,
        facts: &tokio::sync::Mutex<Facts>,
        image: &ImageRequest,
    ) -> Result<()> {
        let digest = Digest::parse(&image.digest)?;
        let candidates = candidates(&image.sources);
        if candidates.is_empty() {
            return Err(ImageError::Validation(format!(
                "Image {} declares no sources",
                image.digest
            )));
        }

        let mut errors = Vec::new();
        for (registry, repository) in &candidates {
            let client = self.client_for(registry)?;
            match self
                .fetch_graph(facts, &client, repository, &digest, image.layer_handling)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_integrity() => return Err(e),
                Err(e) => {
                    self.logger.verbose(&format!(
                        "Source {}/{} failed: {}",
                        registry, repository, e
                    ));
                    errors.push(format!("{}/{}: {}", registry, repository, e));
                }
            }
        }
        Err(ImageError::Network(format!(
            "All sources failed for {}: {}",
            image.digest,
            errors.join("; ")
        )))
    }

    /// Recursive descent over manifest references. The parent manifest
    /// is persisted and verified before children are enumerated.
    async fn fetch_graph(
        &self,
        facts: &tokio::sync::Mutex<Facts>,
        client: &RegistryClient,
        repository: &str,
        digest: &Digest,
        handling: LayerHandling,
    ) -> Result<()> {
        let manifest_path = self.store.blob_path(digest);
        let known = facts.lock().await.get(digest).is_some();
        let (data, media_type) = if manifest_path.is_file() && known {
            // Already known; only recurse to satisfy the handling mode.
            let data = self.store.read_small(digest)?.as_ref().clone();
            (data, None)
        } else {
            let _permit = self.limit.acquire().await.expect("semaphore closed");
            let (data, media_type, returned) =
                client.get_manifest(repository, &digest.to_string()).await?;
            if returned != *digest {
                return Err(ImageError::Network(format!(
                    "Registry returned digest {} for requested {}",
                    returned, digest
                )));
            }
            self.store.write_small_with_digest(digest, &data)?;
            (data, Some(media_type))
        };
        if let Some(media_type) = media_type {
            client.transport().record_media_type(digest, &media_type);
        }

        match ManifestOrIndex::parse(&data)? {
            ManifestOrIndex::Index(index) => {
                let children: Vec<String> =
                    index.manifests.iter().map(|m| m.digest.clone()).collect();
                facts
                    .lock()
                    .await
                    .insert(digest, RefGraphEntry::Index { manifests: children });
                for child in &index.manifests {
                    let child_digest = child.parsed_digest()?;
                    Box::pin(self.fetch_graph(facts, client, repository, &child_digest, handling))
                        .await?;
                }
            }
            ManifestOrIndex::Manifest(manifest) => {
                facts.lock().await.insert(
                    digest,
                    RefGraphEntry::Manifest {
                        config: manifest.config.digest.clone(),
                        layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
                    },
                );
                self.fetch_manifest_blobs(client, repository, &manifest, handling)
                    .await?;
            }
        }
        Ok(())
    }

    async fn fetch_manifest_blobs(
        &self,
        client: &RegistryClient,
        repository: &str,
        manifest: &ImageManifest,
        handling: LayerHandling,
    ) -> Result<()> {
        // The config is always required locally.
        self.fetch_blob(client, repository, &manifest.config.parsed_digest()?)
            .await?;
        if handling != LayerHandling::Eager {
            return Ok(());
        }
        let mut layer_digests = Vec::new();
        for layer in &manifest.layers {
            layer_digests.push(layer.parsed_digest()?);
        }
        let fetches = layer_digests
            .iter()
            .map(|layer_digest| self.fetch_blob(client, repository, layer_digest));
        for result in futures::future::join_all(fetches).await {
            result?;
        }
        Ok(())
    }

    /// Download one blob into the local store, streaming large bodies
    /// through a temp file
    async fn fetch_blob(
        &self,
        client: &RegistryClient,
        repository: &str,
        digest: &Digest,
    ) -> Result<()> {
        if self.store.exists(digest) {
            return Ok(());
        }
        let _permit = self.limit.acquire().await.expect("semaphore closed");
        let response = client.get_blob(repository, digest).await?;
        match response.body {
            TransportBody::Bytes(bytes) => {
                self.store.write_small_with_digest(digest, &bytes)
            }
            TransportBody::File(_) => Ok(()),
            TransportBody::Remote(remote) => {
                let temp = tempfile::NamedTempFile::new_in(self.store.root())
                    .map_err(|e| ImageError::Io(format!("Failed to create temp file: {}", e)))?;
                let mut writer = crate::digest::HashingWriter::new(temp);
                let mut stream = remote.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk
                        .map_err(|e| ImageError::Network(format!("Blob download: {}", e)))?;
                    writer.write_all(&chunk)?;
                }
                let (temp, actual, _size) = writer.finish();
                if actual != *digest {
                    // Partial temp file is deleted on drop.
                    return Err(ImageError::Network(format!(
                        "Downloaded blob hashes to {} but expected {}",
                        actual, digest
                    )));
                }
                let target = self.store.blob_path(digest);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                temp.persist(&target).map_err(|e| {
                    ImageError::Io(format!("Failed to install blob {}: {}", target.display(), e))
                })?;
                self.logger
                    .detail(&format!("Fetched blob {}", digest.short()));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facts_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.json");
        let digest = Digest::sha256(b"manifest");

        let mut facts = Facts::default();
        facts.insert(
            &digest,
            RefGraphEntry::Manifest {
                config: format!("sha256:{}", "c".repeat(64)),
                layers: vec![format!("sha256:{}", "l".repeat(64))],
            },
        );
        facts.save(&path).unwrap();

        let reloaded = Facts::load(&path).unwrap();
        assert_eq!(reloaded.get(&digest), facts.get(&digest));
        // Keys carry the documented prefix.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains(&format!("{}{}", FACT_KEY_PREFIX, digest)));
    }

    #[test]
    fn test_facts_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let facts = Facts::load(&dir.path().join("absent.json")).unwrap();
        assert!(facts.0.is_empty());
    }

    #[test]
    fn test_merge_handling() {
        use LayerHandling::*;
        // Non-shallow beats shallow.
        assert_eq!(merge_handling(Shallow, true, Lazy, false), Lazy);
        assert_eq!(merge_handling(Eager, false, Shallow, true), Eager);
        // Root-module setting wins within eager/lazy.
        assert_eq!(merge_handling(Lazy, true, Eager, false), Lazy);
        assert_eq!(merge_handling(Eager, true, Lazy, false), Eager);
        // Otherwise eager beats lazy.
        assert_eq!(merge_handling(Lazy, false, Eager, false), Eager);
        assert_eq!(merge_handling(Lazy, false, Lazy, false), Lazy);
    }

    #[test]
    fn test_candidates_cover_all_sources() {
        let sources = vec![
            PullSource {
                repository: "library/alpine".to_string(),
                registries: vec!["mirror.gcr.io".to_string(), "registry-1.docker.io".to_string()],
            },
            PullSource {
                repository: "alpine".to_string(),
                registries: vec!["registry.example.com".to_string()],
            },
        ];
        let all = candidates(&sources);
        assert_eq!(all.len(), 3);
        // Rotation permutes but never drops candidates.
        assert!(all.iter().any(|(r, _)| r == "mirror.gcr.io"));
        assert!(all.iter().any(|(r, _)| r == "registry.example.com"));
    }

    #[test]
    fn test_images_file_parse() {
        let json = r#"{
            "images": [{
                "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "tag": "3.19",
                "layer_handling": "eager",
                "sources": [{"repository": "library/alpine", "registries": ["mirror.gcr.io"]}],
                "root_module": true
            }]
        }"#;
        let parsed: ImagesFile = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.images.len(), 1);
        assert_eq!(parsed.images[0].layer_handling, LayerHandling::Eager);
        assert!(parsed.images[0].root_module);
    }
}
