//! Cached-blob registry transport
//!
//! Wraps the plain HTTP client so GETs of registry blob and manifest
//! URLs (`/v2/{name}/blobs/sha256:...`, `/v2/{name}/manifests/sha256:...`)
//! are served from the local blob store when possible. Small blobs and
//! manifests are verified and memory-cached; large blobs are streamed
//! from disk with only their size cached. A digest mismatch on a cached
//! blob is fatal by contract: no network fallback, and the blob is kept
//! in place for diagnosis.
//!
//! In airgapped mode `GET /v2/` answers `{}` locally and anything that
//! cannot be served from cache is rejected.

use crate::blobstore::{BlobStore, SMALL_BLOB_LIMIT};
use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{ImageError, Result};
use crate::oci::infer_manifest_media_type;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Per-request timeout for manifest GETs
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for blob GETs
pub const BLOB_TIMEOUT: Duration = Duration::from_secs(600);

const MAX_RETRIES: usize = 4;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Send a request built by `build`, retrying transient failures (5xx,
/// 429, connection errors) with exponential backoff and honoring
/// `Retry-After`. Any other status is returned to the caller; the body
/// is never consumed here, so retried attempts rebuild the request from
/// scratch.
pub async fn send_with_retry<F>(build: F, what: &str) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut delay = INITIAL_BACKOFF;
    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() || status.as_u16() == 429 {
                    if let Some(retry_after) = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                    {
                        delay = delay.max(Duration::from_secs(retry_after));
                    }
                    last_error = Some(format!("{}: HTTP {}", what, status));
                    continue;
                }
                return Ok(response);
            }
            Err(e) => {
                last_error = Some(format!("{}: {}", what, e));
            }
        }
    }
    Err(ImageError::Network(format!(
        "{} (gave up after {} attempts)",
        last_error.unwrap_or_else(|| what.to_string()),
        MAX_RETRIES + 1
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Blob,
    Manifest,
}

/// A registry URL the cache layer understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedUrl {
    pub name: String,
    pub kind: UrlKind,
    pub hex: String,
}

fn is_lower_alnum(c: u8) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

/// One path component of the OCI name grammar: lowercase alphanumerics
/// joined by `.`, `_`, `__`, or runs of `-`
fn valid_name_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if bytes.is_empty() || !is_lower_alnum(bytes[0]) || !is_lower_alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        if is_lower_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_lower_alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let ok = separator == "."
            || separator == "_"
            || separator == "__"
            || separator.bytes().all(|c| c == b'-');
        if !ok {
            return false;
        }
    }
    true
}

fn valid_repository_name(name: &str) -> bool {
    !name.is_empty() && name.split('/').all(valid_name_component)
}

/// Recognize blob and manifest-by-digest GET paths
pub fn recognize_url(path: &str) -> Option<RecognizedUrl> {
    let rest = path.strip_prefix("/v2/")?;
    for (marker, kind) in [
        ("/blobs/sha256:", UrlKind::Blob),
        ("/manifests/sha256:", UrlKind::Manifest),
    ] {
        if let Some(pos) = rest.rfind(marker) {
            let name = &rest[..pos];
            let hex = &rest[pos + marker.len()..];
            if hex.len() == 64
                && hex.bytes().all(|c| c.is_ascii_hexdigit())
                && valid_repository_name(name)
            {
                return Some(RecognizedUrl {
                    name: name.to_string(),
                    kind,
                    hex: hex.to_string(),
                });
            }
        }
    }
    None
}

/// A transport-level response; either synthesized from cache or passed
/// through from the network
#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub docker_content_digest: Option<String>,
    pub body: TransportBody,
}

#[derive(Debug)]
pub enum TransportBody {
    Bytes(Arc<Vec<u8>>),
    File(File),
    Remote(reqwest::Response),
}

impl TransportResponse {
    /// Drain the body into memory
    pub async fn bytes(self) -> Result<Vec<u8>> {
        match self.body {
            TransportBody::Bytes(bytes) => Ok(bytes.as_ref().clone()),
            TransportBody::File(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            }
            TransportBody::Remote(response) => Ok(response.bytes().await?.to_vec()),
        }
    }

    fn from_bytes(bytes: Arc<Vec<u8>>, content_type: &str, digest: Option<&Digest>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            content_length: Some(bytes.len() as u64),
            docker_content_digest: digest.map(|d| d.to_string()),
            body: TransportBody::Bytes(bytes),
        }
    }
}

/// Cache slot: full bytes for small blobs and manifests, size only for
/// anything larger
#[derive(Clone)]
struct CachedBlob {
    bytes: Option<Arc<Vec<u8>>>,
    size: u64,
}

pub struct CachedBlobTransport {
    store: Arc<BlobStore>,
    client: reqwest::Client,
    airgapped: bool,
    blob_cache: RwLock<HashMap<String, CachedBlob>>,
    media_types: RwLock<HashMap<String, String>>,
}

impl CachedBlobTransport {
    pub fn new(store: Arc<BlobStore>, client: reqwest::Client, airgapped: bool) -> Self {
        Self {
            store,
            client,
            airgapped,
            blob_cache: RwLock::new(HashMap::new()),
            media_types: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    pub fn is_airgapped(&self) -> bool {
        self.airgapped
    }

    /// Record a manifest media type for later synthesized responses
    pub fn record_media_type(&self, digest: &Digest, media_type: &str) {
        self.media_types
            .write()
            .expect("media type lock")
            .insert(digest.hex.clone(), media_type.to_string());
    }

    pub fn media_type_of(&self, digest: &Digest) -> Option<String> {
        self.media_types
            .read()
            .expect("media type lock")
            .get(&digest.hex)
            .cloned()
    }

    fn cached(&self, hex: &str) -> Option<CachedBlob> {
        self.blob_cache
            .read()
            .expect("blob cache lock")
            .get(hex)
            .cloned()
    }

    fn cache_insert(&self, hex: &str, entry: CachedBlob) {
        self.blob_cache
            .write()
            .expect("blob cache lock")
            .insert(hex.to_string(), entry);
    }

    fn content_type_for(&self, recognized: &RecognizedUrl, bytes: Option<&[u8]>) -> String {
        match recognized.kind {
            UrlKind::Blob => "application/octet-stream".to_string(),
            UrlKind::Manifest => {
                if let Some(cached) = self
                    .media_types
                    .read()
                    .expect("media type lock")
                    .get(&recognized.hex)
                {
                    return cached.clone();
                }
                match bytes {
                    Some(data) => infer_manifest_media_type(data).to_string(),
                    None => "application/json".to_string(),
                }
            }
        }
    }

    /// GET a registry URL, serving recognized blob/manifest requests
    /// from cache when possible
    pub async fn get(&self, url: &str, bearer: Option<&str>) -> Result<TransportResponse> {
        let parsed = url::Url::parse(url)?;
        let path = parsed.path();

        if path == "/v2/" && self.airgapped {
            // The version check never needs the network in airgapped mode.
            return Ok(TransportResponse {
                status: 200,
                content_type: "application/json".to_string(),
                content_length: Some(2),
                docker_content_digest: None,
                body: TransportBody::Bytes(Arc::new(b"{}".to_vec())),
            });
        }

        let recognized = match recognize_url(path) {
            Some(r) => r,
            None => {
                if self.airgapped {
                    return Err(ImageError::NotFound(format!(
                        "Not available locally (airgapped): {}",
                        url
                    )));
                }
                return self.forward(url, bearer, None).await;
            }
        };
        let digest = Digest::new(DigestAlgorithm::Sha256, recognized.hex.clone())?;

        // 1. In-memory cache.
        if let Some(entry) = self.cached(&recognized.hex) {
            match entry.bytes {
                Some(bytes) => {
                    let content_type = self.content_type_for(&recognized, Some(&bytes));
                    return Ok(TransportResponse::from_bytes(
                        bytes,
                        &content_type,
                        Some(&digest),
                    ));
                }
                None => {
                    if let Ok(file) = self.store.open(&digest) {
                        return Ok(TransportResponse {
                            status: 200,
                            content_type: self.content_type_for(&recognized, None),
                            content_length: Some(entry.size),
                            docker_content_digest: Some(digest.to_string()),
                            body: TransportBody::File(file),
                        });
                    }
                }
            }
        }

        // 2. Local blob store.
        let blob_path = self.store.blob_path(&digest);
        if let Ok(metadata) = std::fs::metadata(&blob_path) {
            let size = metadata.len();
            if size <= SMALL_BLOB_LIMIT || recognized.kind == UrlKind::Manifest {
                let mut data = Vec::with_capacity(size as usize);
                File::open(&blob_path)?.read_to_end(&mut data)?;
                if digest.verify(&data).is_err() {
                    // Fatal by contract; the bad blob stays for diagnosis.
                    return Err(ImageError::Integrity {
                        message: format!("Cached blob does not match its digest {}", digest),
                        path: blob_path,
                    });
                }
                let bytes = Arc::new(data);
                self.cache_insert(
                    &recognized.hex,
                    CachedBlob {
                        bytes: Some(bytes.clone()),
                        size,
                    },
                );
                let content_type = self.content_type_for(&recognized, Some(&bytes));
                return Ok(TransportResponse::from_bytes(bytes, &content_type, Some(&digest)));
            }
            // Large blob: remember only the size so lookups stay cheap.
            self.cache_insert(&recognized.hex, CachedBlob { bytes: None, size });
            let file = File::open(&blob_path)?;
            return Ok(TransportResponse {
                status: 200,
                content_type: self.content_type_for(&recognized, None),
                content_length: Some(size),
                docker_content_digest: Some(digest.to_string()),
                body: TransportBody::File(file),
            });
        }

        // 3. Network, unless airgapped.
        if self.airgapped {
            return Err(ImageError::NotFound(format!(
                "Not available locally (airgapped): {}",
                url
            )));
        }
        self.forward(url, bearer, Some((recognized, digest))).await
    }

    async fn forward(
        &self,
        url: &str,
        bearer: Option<&str>,
        recognized: Option<(RecognizedUrl, Digest)>,
    ) -> Result<TransportResponse> {
        let timeout = match &recognized {
            Some((r, _)) if r.kind == UrlKind::Blob => BLOB_TIMEOUT,
            _ => MANIFEST_TIMEOUT,
        };
        let wants_manifest = matches!(&recognized, Some((r, _)) if r.kind == UrlKind::Manifest);
        let response = send_with_retry(
            || {
                let mut request = self.client.get(url).timeout(timeout);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }
                if wants_manifest {
                    request = request.header(
                        reqwest::header::ACCEPT,
                        crate::oci::MANIFEST_ACCEPT_TYPES.join(", "),
                    );
                }
                request
            },
            "registry GET",
        )
        .await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_length = response.content_length();
        let docker_content_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some((recognized, digest)) = recognized {
            let buffer = status == 200
                && (recognized.kind == UrlKind::Manifest
                    || content_length.is_some_and(|len| len <= SMALL_BLOB_LIMIT));
            if buffer {
                let data = response.bytes().await?.to_vec();
                if digest.verify(&data).is_err() {
                    return Err(ImageError::Network(format!(
                        "Registry returned bytes that do not match {} for {}",
                        digest, url
                    )));
                }
                let bytes = Arc::new(data);
                self.cache_insert(
                    &recognized.hex,
                    CachedBlob {
                        bytes: Some(bytes.clone()),
                        size: bytes.len() as u64,
                    },
                );
                let content_type = if recognized.kind == UrlKind::Manifest {
                    let media_type = if crate::oci::MANIFEST_ACCEPT_TYPES.contains(&content_type.as_str())
                    {
                        content_type.clone()
                    } else {
                        infer_manifest_media_type(&bytes).to_string()
                    };
                    self.record_media_type(&digest, &media_type);
                    media_type
                } else {
                    "application/octet-stream".to_string()
                };
                return Ok(TransportResponse::from_bytes(bytes, &content_type, Some(&digest)));
            }
        }

        Ok(TransportResponse {
            status,
            content_type,
            content_length,
            docker_content_digest,
            body: TransportBody::Remote(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(airgapped: bool) -> (tempfile::TempDir, CachedBlobTransport) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let transport = CachedBlobTransport::new(store, reqwest::Client::new(), airgapped);
        (dir, transport)
    }

    #[test]
    fn test_recognizer_accepts_oci_names() {
        let hex = "a".repeat(64);
        let url = recognize_url(&format!("/v2/a_b-c.d/e__f/g/blobs/sha256:{}", hex)).unwrap();
        assert_eq!(url.name, "a_b-c.d/e__f/g");
        assert_eq!(url.kind, UrlKind::Blob);
        assert_eq!(url.hex, hex);

        let url =
            recognize_url(&format!("/v2/library/alpine/manifests/sha256:{}", hex)).unwrap();
        assert_eq!(url.kind, UrlKind::Manifest);
    }

    #[test]
    fn test_recognizer_rejects_bad_input() {
        let hex = "a".repeat(64);
        // Uppercase name segments are outside the grammar.
        assert!(recognize_url(&format!("/v2/A/B/blobs/sha256:{}", hex)).is_none());
        // Tag references are not digest URLs.
        assert!(recognize_url("/v2/library/alpine/manifests/latest").is_none());
        // Wrong hex length.
        assert!(recognize_url("/v2/library/alpine/blobs/sha256:abcd").is_none());
        // Missing name.
        assert!(recognize_url(&format!("/v2//blobs/sha256:{}", hex)).is_none());
    }

    #[test]
    fn test_name_component_grammar() {
        for ok in ["alpine", "a_b-c.d", "e__f", "g", "ubuntu-22.04", "a---b"] {
            assert!(valid_name_component(ok), "{} should be valid", ok);
        }
        for bad in ["", "Alpine", "-leading", "trailing-", "a___b", "a..b", "a_.b"] {
            assert!(!valid_name_component(bad), "{} should be invalid", bad);
        }
    }

    #[tokio::test]
    async fn test_airgapped_version_check() {
        let (_dir, transport) = transport(true);
        let response = transport
            .get("https://registry.example/v2/", None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "application/json");
        assert_eq!(response.content_length, Some(2));
        assert_eq!(response.bytes().await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_airgapped_miss_is_rejected() {
        let (_dir, transport) = transport(true);
        let url = format!(
            "https://registry.example/v2/library/alpine/blobs/sha256:{}",
            "0".repeat(64)
        );
        let err = transport.get(&url, None).await.unwrap_err();
        assert!(err.to_string().contains("Not available locally"));
    }

    #[tokio::test]
    async fn test_served_from_disk_with_verification() {
        let (_dir, transport) = transport(true);
        let payload = b"config blob".to_vec();
        let digest = transport.store().write_small(&payload).unwrap();

        let url = format!(
            "https://registry.example/v2/library/alpine/blobs/{}",
            digest
        );
        let response = transport.get(&url, None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "application/octet-stream");
        assert_eq!(
            response.docker_content_digest.as_deref(),
            Some(digest.to_string().as_str())
        );
        assert_eq!(response.bytes().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_manifest_media_type_inferred() {
        let (_dir, transport) = transport(true);
        let manifest = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"{}","digest":"sha256:{}","size":2}},"layers":[]}}"#,
            crate::oci::MEDIA_TYPE_OCI_CONFIG,
            "a".repeat(64)
        );
        let digest = transport.store().write_small(manifest.as_bytes()).unwrap();
        let url = format!(
            "https://registry.example/v2/library/alpine/manifests/{}",
            digest
        );
        let response = transport.get(&url, None).await.unwrap();
        assert_eq!(response.content_type, crate::oci::MEDIA_TYPE_OCI_MANIFEST);
    }

    #[tokio::test]
    async fn test_corrupt_cached_blob_is_fatal_and_kept() {
        let (_dir, transport) = transport(true);
        let digest = Digest::sha256(b"expected content");
        let path = transport.store().blob_path(&digest);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"corrupted").unwrap();

        let url = format!(
            "https://registry.example/v2/library/alpine/blobs/{}",
            digest
        );
        let err = transport.get(&url, None).await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(err.exit_code(), crate::error::EXIT_INTEGRITY);
        // The bad blob stays in place for diagnosis.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_one_mib_boundary() {
        let (_dir, transport) = transport(true);

        let exactly = vec![1u8; SMALL_BLOB_LIMIT as usize];
        let digest_small = transport.store().write_small(&exactly).unwrap();
        let url = format!("https://r.example/v2/lib/a/blobs/{}", digest_small);
        let response = transport.get(&url, None).await.unwrap();
        assert!(matches!(response.body, TransportBody::Bytes(_)));
        let cached = transport.cached(&digest_small.hex).unwrap();
        assert!(cached.bytes.is_some());

        let over = vec![2u8; SMALL_BLOB_LIMIT as usize + 1];
        let digest_large = transport.store().write_small(&over).unwrap();
        let url = format!("https://r.example/v2/lib/a/blobs/{}", digest_large);
        let response = transport.get(&url, None).await.unwrap();
        assert!(matches!(response.body, TransportBody::File(_)));
        let cached = transport.cached(&digest_large.hex).unwrap();
        // Size-only cache entry for anything over the limit.
        assert!(cached.bytes.is_none());
        assert_eq!(cached.size, SMALL_BLOB_LIMIT + 1);
    }

    #[tokio::test]
    async fn test_second_lookup_hits_memory_cache() {
        let (_dir, transport) = transport(true);
        let digest = transport.store().write_small(b"cache me").unwrap();
        let url = format!("https://r.example/v2/lib/a/blobs/{}", digest);
        transport.get(&url, None).await.unwrap();

        // Remove the file; the memory cache must still serve it.
        std::fs::remove_file(transport.store().blob_path(&digest)).unwrap();
        let response = transport.get(&url, None).await.unwrap();
        assert_eq!(response.bytes().await.unwrap(), b"cache me");
    }
}
