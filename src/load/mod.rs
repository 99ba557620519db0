//! Load pipeline
//!
//! Imports a built image or index into a running container daemon.
//! Targets: `containerd` (gRPC content + image services, incremental,
//! index-capable), `docker` (upgraded to containerd when the daemon is
//! containerd-backed and the socket is reachable, else a streamed
//! docker-save tarball piped into `docker load`), `podman` and
//! `generic` (the same tarball piped into `podman load` /
//! `$LOADER_BINARY load`), and `auto` (containerd socket probe, then
//! docker). Once a daemon is selected there is no mid-operation
//! fallback.

pub mod containerd;
pub mod docker_save;

use crate::blobstore::BlobStore;
use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::logging::Logger;
use crate::oci::platform::host_platform;
use crate::oci::{ImageManifest, ManifestOrIndex, Platform, is_index_media_type};
use crate::push::DeployMetadata;
use std::process::Stdio;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    Containerd,
    Docker,
    Podman,
    Generic(String),
    Auto,
}

impl LoadTarget {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "containerd" => Ok(LoadTarget::Containerd),
            "docker" => Ok(LoadTarget::Docker),
            "podman" => Ok(LoadTarget::Podman),
            "auto" => Ok(LoadTarget::Auto),
            "generic" => {
                let binary = std::env::var("LOADER_BINARY").map_err(|_| {
                    ImageError::Validation(
                        "Generic load target requires LOADER_BINARY".to_string(),
                    )
                })?;
                Ok(LoadTarget::Generic(binary))
            }
            other => Err(ImageError::Validation(format!(
                "Unknown load target: {} (expected containerd, docker, podman, generic, auto)",
                other
            ))),
        }
    }
}

/// Pick the manifest to load on single-platform paths: the sole
/// manifest, an exact match for an explicitly requested platform, or
/// the host platform.
pub fn select_platform_manifest<'a>(
    manifests: &'a [crate::oci::OciDescriptor],
    requested: Option<&Platform>,
) -> Result<&'a crate::oci::OciDescriptor> {
    if manifests.len() == 1 {
        return Ok(&manifests[0]);
    }
    let wanted = match requested {
        Some(platform) => platform.clone(),
        None => host_platform(),
    };
    for descriptor in manifests {
        if let Some(platform) = &descriptor.platform {
            if platform.os == wanted.os
                && platform.architecture == wanted.architecture
                && platform.variant == wanted.variant
            {
                return Ok(descriptor);
            }
        }
    }
    let mut message = format!(
        "no matching platform in index for os={} architecture={}",
        wanted.os, wanted.architecture
    );
    if let Some(variant) = &wanted.variant {
        message.push_str(&format!(" variant={}", variant));
    }
    Err(ImageError::Validation(message))
}

pub struct Loader {
    store: Arc<BlobStore>,
    logger: Logger,
}

impl Loader {
    pub fn new(store: Arc<BlobStore>, logger: Logger) -> Self {
        Self { store, logger }
    }

    /// Import the deploy's root into the chosen daemon. `references`
    /// are the `repository:tag` names the daemon should know the image
    /// by.
    pub async fn load(
        &self,
        metadata: &DeployMetadata,
        references: &[String],
        requested_platform: Option<&Platform>,
        target: LoadTarget,
    ) -> Result<()> {
        let target = self.resolve_target(target)?;
        match target {
            LoadTarget::Containerd => {
                self.load_containerd(metadata, references).await
            }
            LoadTarget::Docker => {
                if docker_backed_by_containerd()
                    && containerd::socket_reachable(&containerd::socket_path())
                {
                    // The documented upgrade happens before any work starts.
                    self.logger
                        .info("Docker is containerd-backed; loading via containerd");
                    self.load_containerd(metadata, references).await
                } else {
                    self.load_via_cli("docker", metadata, references, requested_platform)
                        .await
                }
            }
            LoadTarget::Podman => {
                self.load_via_cli("podman", metadata, references, requested_platform)
                    .await
            }
            LoadTarget::Generic(binary) => {
                self.load_via_cli(&binary, metadata, references, requested_platform)
                    .await
            }
            LoadTarget::Auto => unreachable!("resolve_target removes Auto"),
        }
    }

    fn resolve_target(&self, target: LoadTarget) -> Result<LoadTarget> {
        if target != LoadTarget::Auto {
            return Ok(target);
        }
        if containerd::socket_reachable(&containerd::socket_path()) {
            self.logger.verbose("Auto target: containerd socket found");
            Ok(LoadTarget::Containerd)
        } else {
            self.logger.verbose("Auto target: falling back to docker");
            Ok(LoadTarget::Docker)
        }
    }

    fn load_manifest_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        Ok(self.store.read_small(digest)?.as_ref().clone())
    }

    /// containerd path: lease, content uploads, then image entries.
    /// Indexes are supported natively.
    async fn load_containerd(
        &self,
        metadata: &DeployMetadata,
        references: &[String],
    ) -> Result<()> {
        let namespace = std::env::var("CONTAINERD_NAMESPACE")
            .unwrap_or_else(|_| containerd::DEFAULT_NAMESPACE.to_string());
        let mut client = containerd::ContainerdClient::connect(
            &containerd::socket_path(),
            &namespace,
            self.logger.clone(),
        )
        .await?;
        client.create_lease().await?;

        let result = self
            .load_containerd_locked(&mut client, metadata, references)
            .await;
        client.delete_lease().await?;
        result
    }

    async fn load_containerd_locked(
        &self,
        client: &mut containerd::ContainerdClient,
        metadata: &DeployMetadata,
        references: &[String],
    ) -> Result<()> {
        // All referenced content is committed before any image entry.
        for entry in &metadata.manifests {
            for blob in &entry.layer_blobs {
                let digest = blob.parsed_digest()?;
                client
                    .write_content_file(&blob.digest, &self.store.blob_path(&digest))
                    .await?;
            }
            let digest = entry.descriptor.parsed_digest()?;
            let bytes = self.load_manifest_bytes(&digest)?;
            client.write_content(&entry.descriptor.digest, &bytes).await?;
        }
        if is_index_media_type(&metadata.root.media_type) {
            let digest = metadata.root.parsed_digest()?;
            let bytes = self.load_manifest_bytes(&digest)?;
            client.write_content(&metadata.root.digest, &bytes).await?;
        }

        let target = containerd::Descriptor {
            media_type: metadata.root.media_type.clone(),
            digest: metadata.root.digest.clone(),
            size: metadata.root.size,
            annotations: std::collections::HashMap::new(),
        };
        for reference in references {
            client.set_image(reference, target.clone()).await?;
            self.logger
                .success(&format!("Loaded {} into containerd", reference));
        }
        Ok(())
    }

    /// Fallback path: stream a docker-save tarball into `<binary> load`
    async fn load_via_cli(
        &self,
        binary: &str,
        metadata: &DeployMetadata,
        references: &[String],
        requested_platform: Option<&Platform>,
    ) -> Result<()> {
        let manifest = self.select_single_manifest(metadata, requested_platform)?;
        let store = self.store.clone();
        let references = references.to_vec();
        let binary = binary.to_string();
        let logger = self.logger.clone();

        // The writer is synchronous; run it on a blocking thread feeding
        // the loader's stdin.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut child = std::process::Command::new(&binary)
                .arg("load")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| ImageError::Daemon(format!("Failed to run {} load: {}", binary, e)))?;
            {
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| ImageError::Daemon("loader stdin unavailable".to_string()))?;
                docker_save::write_docker_save(stdin, &store, &manifest, &references)?;
            }
            let output = child
                .wait_with_output()
                .map_err(|e| ImageError::Daemon(format!("{} load: {}", binary, e)))?;
            if !output.status.success() {
                // The daemon's own words, verbatim.
                return Err(ImageError::Daemon(format!(
                    "{} load exited with {}: {}",
                    binary,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            logger.success(&format!(
                "Loaded via {}: {}",
                binary,
                String::from_utf8_lossy(&output.stdout).trim()
            ));
            Ok(())
        })
        .await
        .map_err(|e| ImageError::Daemon(format!("loader task: {}", e)))?
    }

    /// Resolve the single manifest a docker-save load needs
    fn select_single_manifest(
        &self,
        metadata: &DeployMetadata,
        requested_platform: Option<&Platform>,
    ) -> Result<ImageManifest> {
        let root_digest = metadata.root.parsed_digest()?;
        let root_bytes = self.load_manifest_bytes(&root_digest)?;
        let manifest_digest = match ManifestOrIndex::parse(&root_bytes)? {
            ManifestOrIndex::Manifest(_) => root_digest,
            ManifestOrIndex::Index(index) => {
                // Multi-platform indexes need a platform choice here.
                let selected = select_platform_manifest(&index.manifests, requested_platform)?;
                selected.parsed_digest()?
            }
        };
        let bytes = self.load_manifest_bytes(&manifest_digest)?;
        match ManifestOrIndex::parse(&bytes)? {
            ManifestOrIndex::Manifest(manifest) => Ok(manifest),
            ManifestOrIndex::Index(_) => Err(ImageError::Schema(
                "Nested indexes are not supported by the docker-save path".to_string(),
            )),
        }
    }
}

/// Is the Docker daemon storing images in containerd?
fn docker_backed_by_containerd() -> bool {
    let output = std::process::Command::new("docker")
        .args(["info", "--format", "{{ .DriverStatus }}"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).contains("containerd")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{MEDIA_TYPE_OCI_MANIFEST, OciDescriptor};

    fn descriptor(platform: Option<Platform>) -> OciDescriptor {
        OciDescriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: format!("sha256:{}", "a".repeat(64)),
            size: 1,
            platform,
            annotations: None,
        }
    }

    #[test]
    fn test_single_manifest_needs_no_platform() {
        let manifests = vec![descriptor(None)];
        assert!(select_platform_manifest(&manifests, None).is_ok());
    }

    #[test]
    fn test_explicit_platform_requires_exact_match() {
        let manifests = vec![
            descriptor(Some(Platform::new("linux", "amd64", None))),
            descriptor(Some(Platform::new("linux", "arm64", Some("v8")))),
        ];
        let wanted = Platform::new("linux", "arm64", Some("v8"));
        let selected = select_platform_manifest(&manifests, Some(&wanted)).unwrap();
        assert_eq!(
            selected.platform.as_ref().unwrap().architecture,
            "arm64"
        );

        let missing = Platform::new("linux", "riscv64", None);
        let err = select_platform_manifest(&manifests, Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("os=linux architecture=riscv64"));
    }

    #[test]
    fn test_load_target_parse() {
        assert_eq!(LoadTarget::parse("containerd").unwrap(), LoadTarget::Containerd);
        assert_eq!(LoadTarget::parse("docker").unwrap(), LoadTarget::Docker);
        assert_eq!(LoadTarget::parse("podman").unwrap(), LoadTarget::Podman);
        assert_eq!(LoadTarget::parse("auto").unwrap(), LoadTarget::Auto);
        assert!(LoadTarget::parse("kubernetes").is_err());
    }
}
