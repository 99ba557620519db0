//! OCI image-spec data model
//!
//! Serde types for descriptors, manifests, indexes, and image configs
//! (OCI image-spec 1.1 plus the Docker v2 equivalents). Documents are
//! modeled as tagged variants rather than free-form dictionaries; unknown
//! top-level fields on inputs are preserved through `#[serde(flatten)]`
//! maps, while synthesized documents never emit unknown fields.

pub mod platform;

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// All manifest/index media types a registry request should accept
pub const MANIFEST_ACCEPT_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];

pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Platform triple `(os, architecture, variant?)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Registry-facing descriptor: a structured reference to a blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciDescriptor {
    pub fn new(media_type: &str, digest: &Digest, size: i64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size,
            platform: None,
            annotations: None,
        }
    }

    pub fn parsed_digest(&self) -> Result<Digest> {
        Digest::parse(&self.digest)
    }
}

/// Build-graph layer descriptor, emitted as the sibling metadata JSON of
/// every layer blob. Field order matches JSON-sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub diff_id: String,
    pub digest: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub name: String,
    pub size: i64,
}

impl LayerDescriptor {
    /// `diff_id == digest` must hold exactly for uncompressed layer tars.
    pub fn validate(&self) -> Result<()> {
        let uncompressed = self.media_type == MEDIA_TYPE_LAYER_TAR;
        if uncompressed != (self.diff_id == self.digest) {
            return Err(ImageError::Schema(format!(
                "Layer {}: diff_id {} and digest {} are inconsistent with media type {}",
                self.name, self.diff_id, self.digest, self.media_type
            )));
        }
        if self.size < 0 {
            return Err(ImageError::Schema(format!(
                "Layer {}: negative size {}",
                self.name, self.size
            )));
        }
        Ok(())
    }

    pub fn to_oci(&self) -> OciDescriptor {
        OciDescriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            platform: None,
            annotations: if self.annotations.is_empty() {
                None
            } else {
                Some(self.annotations.clone())
            },
        }
    }
}

/// Single-platform image manifest: one config, ordered layers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageManifest {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(ImageError::Schema(format!(
                "Unsupported manifest schemaVersion: {}",
                self.schema_version
            )));
        }
        if let Some(mt) = &self.media_type {
            if !is_manifest_media_type(mt) {
                return Err(ImageError::Schema(format!(
                    "Unexpected manifest mediaType: {}",
                    mt
                )));
            }
        }
        // Duplicate layer digests within one manifest are a graph defect.
        let mut seen = std::collections::HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.digest.as_str()) {
                return Err(ImageError::Schema(format!(
                    "Duplicate layer digest in manifest: {}",
                    layer.digest
                )));
            }
        }
        Ok(())
    }
}

/// Multi-platform image index: ordered manifest descriptors with platforms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<OciDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageIndex {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(ImageError::Schema(format!(
                "Unsupported index schemaVersion: {}",
                self.schema_version
            )));
        }
        if let Some(mt) = &self.media_type {
            if !is_index_media_type(mt) {
                return Err(ImageError::Schema(format!(
                    "Unexpected index mediaType: {}",
                    mt
                )));
            }
        }
        Ok(())
    }
}

/// Either side of the manifest/index distinction
#[derive(Debug, Clone)]
pub enum ManifestOrIndex {
    Manifest(ImageManifest),
    Index(ImageIndex),
}

impl ManifestOrIndex {
    /// Parse manifest-endpoint bytes, deciding by mediaType when present
    /// and by document shape (`config`+`layers` vs `manifests`) otherwise.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| ImageError::Schema(format!("Manifest is not valid JSON: {}", e)))?;
        let media_type = value.get("mediaType").and_then(|v| v.as_str());
        let looks_like_index = match media_type {
            Some(mt) if is_index_media_type(mt) => true,
            Some(mt) if is_manifest_media_type(mt) => false,
            Some(mt) => {
                return Err(ImageError::Schema(format!(
                    "Unknown manifest mediaType: {}",
                    mt
                )));
            }
            None => value.get("manifests").is_some(),
        };
        if looks_like_index {
            let index: ImageIndex = serde_json::from_value(value)
                .map_err(|e| ImageError::Schema(format!("Malformed image index: {}", e)))?;
            index.validate()?;
            Ok(ManifestOrIndex::Index(index))
        } else {
            let manifest: ImageManifest = serde_json::from_value(value)
                .map_err(|e| ImageError::Schema(format!("Malformed image manifest: {}", e)))?;
            manifest.validate()?;
            Ok(ManifestOrIndex::Manifest(manifest))
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            ManifestOrIndex::Manifest(m) => {
                m.media_type.as_deref().unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
            }
            ManifestOrIndex::Index(i) => i.media_type.as_deref().unwrap_or(MEDIA_TYPE_OCI_INDEX),
        }
    }
}

/// The runtime half of an image config (`.config`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageExecConfig {
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "StopSignal", skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// OCI image config document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageExecConfig>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ImageError::Schema(format!("Malformed image config: {}", e)))
    }
}

/// Serialize with stable (sorted) key order and no insignificant
/// whitespace. Round-tripping through `serde_json::Value` sorts object
/// keys because the default map representation is ordered.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Infer the Content-Type for manifest-shaped bytes: `config`+`layers`
/// means an image manifest, `manifests` an index, otherwise plain JSON.
pub fn infer_manifest_media_type(data: &[u8]) -> &'static str {
    match serde_json::from_slice::<serde_json::Value>(data) {
        Ok(value) => {
            if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
                if mt == MEDIA_TYPE_OCI_MANIFEST {
                    return MEDIA_TYPE_OCI_MANIFEST;
                } else if mt == MEDIA_TYPE_OCI_INDEX {
                    return MEDIA_TYPE_OCI_INDEX;
                } else if mt == MEDIA_TYPE_DOCKER_MANIFEST {
                    return MEDIA_TYPE_DOCKER_MANIFEST;
                } else if mt == MEDIA_TYPE_DOCKER_MANIFEST_LIST {
                    return MEDIA_TYPE_DOCKER_MANIFEST_LIST;
                }
            }
            if value.get("config").is_some() && value.get("layers").is_some() {
                MEDIA_TYPE_OCI_MANIFEST
            } else if value.get("manifests").is_some() {
                MEDIA_TYPE_OCI_INDEX
            } else {
                "application/json"
            }
        }
        Err(_) => "application/json",
    }
}
