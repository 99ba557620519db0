//! Manifest, config, and index assembly
//!
//! Builds the OCI image config and manifest for a single platform on
//! top of an optional base image, and multi-platform indexes from
//! per-platform manifests. Base selection against an index walks the
//! platform preference vector. All emitted JSON is canonicalized
//! (stable key order); annotations are sorted maps.

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::oci::{
    HistoryEntry, ImageConfig, ImageExecConfig, ImageIndex, ImageManifest, LayerDescriptor,
    ManifestOrIndex, OciDescriptor, Platform, canonical_json, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::template::{TemplateContext, expand, expand_map};
use serde_json::Value;
use std::collections::BTreeMap;

/// A base image's documents as pulled from the store
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub manifest_digest: Digest,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
    /// Layer blobs known to be absent locally (lazy handling); carried
    /// into deploy metadata
    pub missing_blobs: Vec<String>,
}

impl BaseImage {
    pub fn parse(manifest_bytes: &[u8], config_bytes: &[u8]) -> Result<Self> {
        let manifest = match ManifestOrIndex::parse(manifest_bytes)? {
            ManifestOrIndex::Manifest(m) => m,
            ManifestOrIndex::Index(_) => {
                return Err(ImageError::Schema(
                    "Base image reference resolves to an index; select a platform first"
                        .to_string(),
                ));
            }
        };
        let config_digest = Digest::sha256(config_bytes);
        if config_digest.to_string() != manifest.config.digest {
            return Err(ImageError::Schema(format!(
                "Base config digest {} does not match manifest reference {}",
                config_digest, manifest.config.digest
            )));
        }
        let config = ImageConfig::parse(config_bytes)?;
        Ok(Self {
            manifest_digest: Digest::sha256(manifest_bytes),
            manifest,
            config,
            missing_blobs: Vec::new(),
        })
    }
}

/// Everything the assembler needs for one single-platform image
#[derive(Debug, Clone, Default)]
pub struct ManifestBuildRequest {
    pub base: Option<BaseImage>,
    pub layers: Vec<LayerDescriptor>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `KEY=VALUE` pairs; same-key entries replace the base's
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub stop_signal: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// Free-form JSON overlaid onto the image config last
    pub config_fragment: Option<Value>,
    /// RFC 3339 build timestamp for `created` and history entries
    pub created: Option<String>,
    pub platform: Option<Platform>,
}

/// The assembled products: bytes plus digests for config and manifest
#[derive(Debug)]
pub struct AssembledImage {
    pub config_bytes: Vec<u8>,
    pub config_digest: Digest,
    pub manifest: ImageManifest,
    pub manifest_bytes: Vec<u8>,
    pub manifest_digest: Digest,
}

/// Merge env arrays by key: entries from `overlay` replace same-key
/// entries of `base` in place, new keys append in order.
fn merge_env(base: &[String], overlay: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = base.to_vec();
    for entry in overlay {
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
        match merged
            .iter()
            .position(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) == key)
        {
            Some(position) => merged[position] = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Recursive JSON overlay: objects merge key-wise, everything else
/// replaces
fn overlay_json(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(target_map), Value::Object(fragment_map)) => {
            for (key, value) in fragment_map {
                match target_map.get_mut(key) {
                    Some(existing) => overlay_json(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, fragment) => *target = fragment.clone(),
    }
}

fn expand_opt(
    value: &Option<String>,
    context: &TemplateContext,
) -> Result<Option<String>> {
    value.as_ref().map(|v| expand(v, context)).transpose()
}

fn expand_vec(
    value: &Option<Vec<String>>,
    context: &TemplateContext,
) -> Result<Option<Vec<String>>> {
    value
        .as_ref()
        .map(|items| items.iter().map(|v| expand(v, context)).collect())
        .transpose()
}

/// Build the image config and manifest for one platform
pub fn build_manifest(
    request: &ManifestBuildRequest,
    context: &TemplateContext,
) -> Result<AssembledImage> {
    // Expose the base documents to template expansion.
    let mut context = context.clone();
    if let Some(base) = &request.base {
        context.set_base(
            serde_json::to_value(&base.config)?,
            serde_json::to_value(&base.manifest)?,
        );
    }

    // Start from the base config's history, diff_ids, and exec config.
    let (mut config, base_layers) = match &request.base {
        Some(base) => (base.config.clone(), base.manifest.layers.clone()),
        None => (ImageConfig::default(), Vec::new()),
    };
    if let Some(platform) = &request.platform {
        config.os = platform.os.clone();
        config.architecture = platform.architecture.clone();
        config.variant = platform.variant.clone();
    }
    if config.os.is_empty() || config.architecture.is_empty() {
        return Err(ImageError::Validation(
            "No platform available: base image has none and none was supplied".to_string(),
        ));
    }

    for layer in &request.layers {
        layer.validate()?;
        if layer.digest == request.base.as_ref().map(|b| b.manifest_digest.to_string()).unwrap_or_default() {
            return Err(ImageError::Schema(format!(
                "Layer {} references the base manifest itself",
                layer.name
            )));
        }
        config.rootfs.diff_ids.push(layer.diff_id.clone());
        config.history.push(HistoryEntry {
            created: request.created.clone(),
            created_by: Some(format!("layer {}", layer.name)),
            ..HistoryEntry::default()
        });
    }
    if let Some(created) = &request.created {
        config.created = Some(created.clone());
    }

    let mut exec = config.config.take().unwrap_or_else(ImageExecConfig::default);
    if !request.env.is_empty() {
        let expanded: Vec<String> = request
            .env
            .iter()
            .map(|entry| expand(entry, &context))
            .collect::<Result<_>>()?;
        let base_env = exec.env.take().unwrap_or_default();
        exec.env = Some(merge_env(&base_env, &expanded));
    }
    if !request.labels.is_empty() {
        let mut labels = exec.labels.take().unwrap_or_default();
        labels.extend(expand_map(&request.labels, &context)?);
        exec.labels = Some(labels);
    }
    if let Some(entrypoint) = expand_vec(&request.entrypoint, &context)? {
        exec.entrypoint = Some(entrypoint);
        // A new entrypoint invalidates an inherited cmd.
        if request.cmd.is_none() {
            exec.cmd = None;
        }
    }
    if let Some(cmd) = expand_vec(&request.cmd, &context)? {
        exec.cmd = Some(cmd);
    }
    if let Some(user) = expand_opt(&request.user, &context)? {
        exec.user = Some(user);
    }
    if let Some(working_dir) = expand_opt(&request.working_dir, &context)? {
        exec.working_dir = Some(working_dir);
    }
    if let Some(stop_signal) = expand_opt(&request.stop_signal, &context)? {
        exec.stop_signal = Some(stop_signal);
    }
    config.config = Some(exec);

    // The config fragment is a raw JSON overlay applied last.
    let mut config_value = serde_json::to_value(&config)?;
    if let Some(fragment) = &request.config_fragment {
        overlay_json(&mut config_value, fragment);
    }
    let config_bytes = canonical_json(&config_value)?;
    let config_digest = Digest::sha256(&config_bytes);

    // Manifest: base layers first, then the new ones, in order.
    let mut layers = base_layers;
    for layer in &request.layers {
        layers.push(layer.to_oci());
    }
    let annotations = if request.annotations.is_empty() {
        None
    } else {
        Some(expand_map(&request.annotations, &context)?)
    };
    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
        config: OciDescriptor::new(MEDIA_TYPE_OCI_CONFIG, &config_digest, config_bytes.len() as i64),
        layers,
        annotations,
        extra: BTreeMap::new(),
    };
    manifest.validate()?;
    let manifest_bytes = canonical_json(&manifest)?;
    let manifest_digest = Digest::sha256(&manifest_bytes);

    Ok(AssembledImage {
        config_bytes,
        config_digest,
        manifest,
        manifest_bytes,
        manifest_digest,
    })
}

/// One entry of an index build
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub manifest_digest: Digest,
    pub manifest_size: i64,
    pub platform: Platform,
}

/// Build a multi-platform index; manifests keep their given order
pub fn build_index(
    entries: &[IndexEntry],
    annotations: &BTreeMap<String, String>,
    context: &TemplateContext,
) -> Result<(ImageIndex, Vec<u8>, Digest)> {
    let manifests = entries
        .iter()
        .map(|entry| {
            let mut descriptor = OciDescriptor::new(
                MEDIA_TYPE_OCI_MANIFEST,
                &entry.manifest_digest,
                entry.manifest_size,
            );
            descriptor.platform = Some(entry.platform.clone());
            descriptor
        })
        .collect();
    let annotations = if annotations.is_empty() {
        None
    } else {
        Some(expand_map(annotations, context)?)
    };
    let index = ImageIndex {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
        manifests,
        annotations,
        extra: BTreeMap::new(),
    };
    index.validate()?;
    let bytes = canonical_json(&index)?;
    let digest = Digest::sha256(&bytes);
    Ok((index, bytes, digest))
}
