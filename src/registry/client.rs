//! OCI distribution v2 client
//!
//! Implements the wire operations pull and push share: manifest GET/PUT,
//! blob HEAD/GET, monolithic and chunked uploads, and cross-repository
//! blob mounts. Blob and manifest-by-digest GETs route through the
//! cached transport; everything else goes straight to the network.
//!
//! Transient failures (5xx, 429, connection errors) retry with
//! exponential backoff honoring `Retry-After`; 401/403 are terminal auth
//! errors naming the registry; 404 maps to `NotFound` so mirror lists
//! can continue.

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::logging::Logger;
use crate::oci::MANIFEST_ACCEPT_TYPES;
use crate::registry::auth::{Credentials, TokenAuthenticator};
use crate::transport::{BLOB_TIMEOUT, CachedBlobTransport, MANIFEST_TIMEOUT, TransportResponse};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default chunk size for chunked blob uploads
pub const UPLOAD_CHUNK_SIZE: usize = 16 * 1024 * 1024;

pub struct RegistryClientBuilder {
    registry_url: String,
    credentials: Option<Credentials>,
    transport: Option<Arc<CachedBlobTransport>>,
    logger: Option<Logger>,
}

impl RegistryClientBuilder {
    pub fn new(registry_url: String) -> Self {
        Self {
            registry_url: registry_url.trim_end_matches('/').to_string(),
            credentials: None,
            transport: None,
            logger: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_transport(mut self, transport: Arc<CachedBlobTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let client = Client::builder()
            .build()
            .map_err(|e| ImageError::Network(format!("Failed to build HTTP client: {}", e)))?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                // A transport with no local store directory still wants a
                // blob cache root; default next to the working directory.
                let store = Arc::new(crate::blobstore::BlobStore::new(std::path::Path::new(
                    ".image-cache",
                ))?);
                Arc::new(CachedBlobTransport::new(store, client.clone(), false))
            }
        };
        let authenticator = TokenAuthenticator::new(client.clone(), &self.registry_url);
        Ok(RegistryClient {
            client,
            registry_url: self.registry_url,
            credentials: self.credentials,
            authenticator,
            transport,
            logger: self.logger.unwrap_or_else(Logger::new_quiet),
            tokens: RwLock::new(HashMap::new()),
        })
    }
}

pub struct RegistryClient {
    client: Client,
    registry_url: String,
    credentials: Option<Credentials>,
    authenticator: TokenAuthenticator,
    transport: Arc<CachedBlobTransport>,
    logger: Logger,
    /// `(repository, push)` to bearer token
    tokens: RwLock<HashMap<(String, bool), String>>,
}

impl RegistryClient {
    pub fn builder(registry_url: String) -> RegistryClientBuilder {
        RegistryClientBuilder::new(registry_url)
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    pub fn transport(&self) -> &Arc<CachedBlobTransport> {
        &self.transport
    }

    /// Bearer token for a repository, fetched once and cached
    async fn token(&self, repository: &str, push: bool) -> Result<Option<String>> {
        let key = (repository.to_string(), push);
        if let Some(token) = self.tokens.read().await.get(&key) {
            return Ok(Some(token.clone()));
        }
        let token = self
            .authenticator
            .token_for_repository(self.credentials.as_ref(), repository, push, &self.logger)
            .await?;
        if let Some(token) = &token {
            self.tokens.write().await.insert(key, token.clone());
        }
        Ok(token)
    }

    /// Retry transient failures with exponential backoff, honoring
    /// `Retry-After` on 429; final failures name the registry
    async fn send_with_retry<F>(&self, build: F, what: &str) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        crate::transport::send_with_retry(build, what)
            .await
            .map_err(|e| match e {
                ImageError::Network(message) => {
                    ImageError::Network(format!("{} (registry {})", message, self.registry_url))
                }
                other => other,
            })
    }

    /// Map terminal statuses to the error taxonomy
    fn check_status(&self, status: StatusCode, context: &str) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ImageError::Auth(format!(
                "{} rejected by {} (status {}, keychain: {})",
                context,
                self.registry_url,
                status,
                if self.credentials.is_some() {
                    "credentials supplied"
                } else {
                    "anonymous"
                }
            ))),
            StatusCode::NOT_FOUND => Err(ImageError::NotFound(format!(
                "{} not found at {}",
                context, self.registry_url
            ))),
            _ => Err(ImageError::Network(format!(
                "{} failed at {} with status {}",
                context, self.registry_url, status
            ))),
        }
    }

    /// GET a manifest by tag or digest. Returns `(bytes, media type,
    /// digest)`; a `Docker-Content-Digest` header, when present, must
    /// agree with the body.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, String, Digest)> {
        let token = self.token(repository, false).await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        );

        if reference.starts_with("sha256:") {
            // Digest references go through the cached transport.
            let response = self.transport.get(&url, token.as_deref()).await?;
            return self.finish_manifest_response(response, reference, &url).await;
        }

        let response = self
            .send_with_retry(
                || {
                    let mut request = self
                        .client
                        .get(&url)
                        .timeout(MANIFEST_TIMEOUT)
                        .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT_TYPES.join(", "));
                    if let Some(token) = &token {
                        request = request.bearer_auth(token);
                    }
                    request
                },
                "manifest GET",
            )
            .await?;
        self.check_status(response.status(), &format!("manifest {}", reference))?;
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await?.to_vec();
        let digest = Digest::sha256(&data);
        if let Some(expected) = header_digest {
            let expected = Digest::parse(&expected)?;
            if expected != digest {
                return Err(ImageError::Network(format!(
                    "Docker-Content-Digest {} does not match manifest body {} from {}",
                    expected, digest, url
                )));
            }
        }
        self.transport.record_media_type(&digest, &media_type);
        Ok((data, media_type, digest))
    }

    async fn finish_manifest_response(
        &self,
        response: TransportResponse,
        reference: &str,
        url: &str,
    ) -> Result<(Vec<u8>, String, Digest)> {
        let status = StatusCode::from_u16(response.status)
            .map_err(|e| ImageError::Network(format!("Invalid status: {}", e)))?;
        self.check_status(status, &format!("manifest {}", reference))?;
        let media_type = response.content_type.clone();
        let data = response.bytes().await?;
        let digest = Digest::parse(reference)?;
        digest.verify(&data).map_err(|_| {
            ImageError::Network(format!(
                "Manifest body does not match requested digest {} from {}",
                reference, url
            ))
        })?;
        Ok((data, media_type, digest))
    }

    /// HEAD a blob; true when the registry already has it
    pub async fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        let token = self.token(repository, false).await?;
        let url = format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest);
        let response = self
            .send_with_retry(
                || {
                    let mut request = self.client.head(&url).timeout(MANIFEST_TIMEOUT);
                    if let Some(token) = &token {
                        request = request.bearer_auth(token);
                    }
                    request
                },
                "blob HEAD",
            )
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                self.check_status(status, &format!("blob {}", digest))?;
                Ok(false)
            }
        }
    }

    /// GET a blob through the cached transport
    pub async fn get_blob(&self, repository: &str, digest: &Digest) -> Result<TransportResponse> {
        let token = self.token(repository, false).await?;
        let url = format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest);
        let response = self.transport.get(&url, token.as_deref()).await?;
        let status = StatusCode::from_u16(response.status)
            .map_err(|e| ImageError::Network(format!("Invalid status: {}", e)))?;
        self.check_status(status, &format!("blob {}", digest))?;
        Ok(response)
    }

    /// Try a cross-repository mount. Returns true when the registry
    /// mounted the blob (201); a 202 means a fresh upload session was
    /// opened instead, which we abandon.
    pub async fn mount_blob(
        &self,
        repository: &str,
        digest: &Digest,
        from_repository: &str,
    ) -> Result<bool> {
        let token = self.token(repository, true).await?;
        let url = format!(
            "{}/v2/{}/blobs/uploads/?mount={}&from={}",
            self.registry_url, repository, digest, from_repository
        );
        let response = self
            .send_with_retry(
                || {
                    let mut request = self.client.post(&url).timeout(MANIFEST_TIMEOUT);
                    if let Some(token) = &token {
                        request = request.bearer_auth(token);
                    }
                    request.header(CONTENT_LENGTH, 0)
                },
                "blob mount",
            )
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => {
                self.logger.detail(&format!(
                    "Mount of {} from {} fell back to upload",
                    digest.short(),
                    from_repository
                ));
                Ok(false)
            }
            status => {
                // Mount failures are advisory; auth problems still surface.
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    self.check_status(status, &format!("blob mount {}", digest))?;
                }
                Ok(false)
            }
        }
    }

    /// POST a new upload session; returns the absolute upload location
    async fn start_upload(&self, repository: &str, token: &Option<String>) -> Result<String> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.registry_url, repository);
        let response = self
            .send_with_retry(
                || {
                    let mut request = self.client.post(&url).timeout(MANIFEST_TIMEOUT);
                    if let Some(token) = token {
                        request = request.bearer_auth(token);
                    }
                    request.header(CONTENT_LENGTH, 0)
                },
                "upload session POST",
            )
            .await?;
        self.check_status(response.status(), "upload session")?;
        if response
            .headers()
            .get("Docker-Upload-UUID")
            .is_none()
        {
            self.logger
                .detail("Registry did not return Docker-Upload-UUID; continuing with Location");
        }
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ImageError::Upload("No Location header in upload response".to_string())
            })?;
        Ok(self.absolute_location(location))
    }

    fn absolute_location(&self, location: &str) -> String {
        if location.starts_with('/') {
            format!("{}{}", self.registry_url, location)
        } else {
            location.to_string()
        }
    }

    fn location_with_digest(location: &str, digest: &Digest) -> String {
        if location.contains('?') {
            format!("{}&digest={}", location, digest)
        } else {
            format!("{}?digest={}", location, digest)
        }
    }

    /// Monolithic upload: POST a session, then PUT the whole body
    pub async fn upload_blob_monolithic(
        &self,
        repository: &str,
        digest: &Digest,
        data: Vec<u8>,
    ) -> Result<()> {
        let token = self.token(repository, true).await?;
        let location = self.start_upload(repository, &token).await?;
        let url = Self::location_with_digest(&location, digest);
        let data = Arc::new(data);
        let response = self
            .send_with_retry(
                || {
                    let mut request = self
                        .client
                        .put(&url)
                        .timeout(BLOB_TIMEOUT)
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .body(data.as_ref().clone());
                    if let Some(token) = &token {
                        request = request.bearer_auth(token);
                    }
                    request
                },
                "blob PUT",
            )
            .await?;
        self.check_status(response.status(), &format!("blob upload {}", digest))
    }

    /// Monolithic upload from a streaming body. The body cannot be
    /// replayed, so transient failures surface instead of retrying.
    pub async fn upload_blob_streaming(
        &self,
        repository: &str,
        digest: &Digest,
        size: u64,
        body: reqwest::Body,
    ) -> Result<()> {
        let token = self.token(repository, true).await?;
        let location = self.start_upload(repository, &token).await?;
        let url = Self::location_with_digest(&location, digest);
        let mut request = self
            .client
            .put(&url)
            .timeout(BLOB_TIMEOUT)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        self.check_status(response.status(), &format!("blob upload {}", digest))
    }

    /// Chunked upload: POST a session, PATCH fixed-size chunks with
    /// Content-Range, then a final PUT with the digest
    pub async fn upload_blob_chunked<R: std::io::Read>(
        &self,
        repository: &str,
        digest: &Digest,
        reader: &mut R,
        chunk_size: usize,
    ) -> Result<u64> {
        let token = self.token(repository, true).await?;
        let mut location = self.start_upload(repository, &token).await?;
        let mut offset = 0u64;

        loop {
            let mut chunk = vec![0u8; chunk_size];
            let mut filled = 0usize;
            while filled < chunk.len() {
                let n = reader.read(&mut chunk[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                // Empty blob or end of input: the final PUT commits.
                break;
            }
            chunk.truncate(filled);
            let range = format!("{}-{}", offset, offset + filled as u64 - 1);
            let chunk = Arc::new(chunk);
            let response = self
                .send_with_retry(
                    || {
                        let mut request = self
                            .client
                            .patch(&location)
                            .timeout(BLOB_TIMEOUT)
                            .header(CONTENT_TYPE, "application/octet-stream")
                            .header(CONTENT_LENGTH, chunk.len())
                            .header(CONTENT_RANGE, range.clone())
                            .body(chunk.as_ref().clone());
                        if let Some(token) = &token {
                            request = request.bearer_auth(token);
                        }
                        request
                    },
                    "blob PATCH",
                )
                .await?;
            self.check_status(response.status(), &format!("blob chunk at {}", offset))?;
            // The registry may rotate the upload location per chunk.
            if let Some(next) = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
            {
                location = self.absolute_location(next);
            }
            offset += filled as u64;
            if filled < chunk_size {
                break;
            }
        }

        let url = Self::location_with_digest(&location, digest);
        let response = self
            .send_with_retry(
                || {
                    let mut request = self
                        .client
                        .put(&url)
                        .timeout(MANIFEST_TIMEOUT)
                        .header(CONTENT_LENGTH, 0);
                    if let Some(token) = &token {
                        request = request.bearer_auth(token);
                    }
                    request
                },
                "blob commit PUT",
            )
            .await?;
        self.check_status(response.status(), &format!("blob commit {}", digest))?;
        Ok(offset)
    }

    /// PUT a manifest under a tag or digest reference
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        data: Vec<u8>,
        media_type: &str,
    ) -> Result<Digest> {
        let token = self.token(repository, true).await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        );
        let digest = Digest::sha256(&data);
        let data = Arc::new(data);
        let media_type = media_type.to_string();
        let response = self
            .send_with_retry(
                || {
                    let mut request = self
                        .client
                        .put(&url)
                        .timeout(MANIFEST_TIMEOUT)
                        .header(CONTENT_TYPE, media_type.clone())
                        .body(data.as_ref().clone());
                    if let Some(token) = &token {
                        request = request.bearer_auth(token);
                    }
                    request
                },
                "manifest PUT",
            )
            .await?;
        self.check_status(response.status(), &format!("manifest {}", reference))?;
        if let Some(returned) = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
        {
            let returned = Digest::parse(returned)?;
            if returned != digest {
                return Err(ImageError::Network(format!(
                    "Registry acknowledged manifest with digest {} but we sent {}",
                    returned, digest
                )));
            }
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_with_digest() {
        let digest = Digest::sha256(b"x");
        assert_eq!(
            RegistryClient::location_with_digest("https://r/upload/abc", &digest),
            format!("https://r/upload/abc?digest={}", digest)
        );
        assert_eq!(
            RegistryClient::location_with_digest("https://r/upload/abc?state=1", &digest),
            format!("https://r/upload/abc?state=1&digest={}", digest)
        );
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::blobstore::BlobStore::new(dir.path()).unwrap());
        let transport = Arc::new(CachedBlobTransport::new(
            store,
            Client::new(),
            true,
        ));
        let client = RegistryClient::builder("https://registry.example.com/".to_string())
            .with_transport(transport)
            .build()
            .unwrap();
        assert_eq!(client.registry_url(), "https://registry.example.com");
        assert_eq!(client.absolute_location("/v2/x/blobs/uploads/1"),
            "https://registry.example.com/v2/x/blobs/uploads/1");
        assert_eq!(
            client.absolute_location("https://other/upload"),
            "https://other/upload"
        );
    }
}
