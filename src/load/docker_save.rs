//! Docker-save tarball writing
//!
//! The fallback load path for daemons without a content store: a
//! streaming writer that assembles the `docker save` wire format from
//! the local blob store. Layers are decompressed on the fly (the format
//! wants plain `layer.tar` entries), so nothing larger than an I/O
//! buffer is held in memory; each layer costs one extra read pass to
//! learn its decompressed size up front.

use crate::blobstore::BlobStore;
use crate::error::{ImageError, Result};
use crate::oci::{ImageManifest, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_LAYER_ZSTD};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use std::io::{Read, Write};

#[derive(Debug, Serialize)]
struct SaveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

enum LayerReader<'a> {
    Plain(std::fs::File),
    Gzip(Box<MultiGzDecoder<std::fs::File>>),
    Zstd(zstd::stream::read::Decoder<'a, std::io::BufReader<std::fs::File>>),
}

impl Read for LayerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            LayerReader::Plain(r) => r.read(buf),
            LayerReader::Gzip(r) => r.read(buf),
            LayerReader::Zstd(r) => r.read(buf),
        }
    }
}

fn open_layer<'a>(
    store: &BlobStore,
    digest: &crate::digest::Digest,
    media_type: &str,
) -> Result<LayerReader<'a>> {
    let file = store.open(digest)?;
    match media_type {
        MEDIA_TYPE_LAYER_TAR => Ok(LayerReader::Plain(file)),
        MEDIA_TYPE_LAYER_GZIP => Ok(LayerReader::Gzip(Box::new(MultiGzDecoder::new(file)))),
        MEDIA_TYPE_LAYER_ZSTD => Ok(LayerReader::Zstd(
            zstd::stream::read::Decoder::new(file)
                .map_err(|e| ImageError::Io(format!("zstd decoder: {}", e)))?,
        )),
        other => Err(ImageError::Schema(format!(
            "Layer media type {} cannot be converted to docker-save format",
            other
        ))),
    }
}

/// Count decompressed bytes without keeping them
fn decompressed_size(
    store: &BlobStore,
    digest: &crate::digest::Digest,
    media_type: &str,
) -> Result<u64> {
    let mut reader = open_layer(store, digest, media_type)?;
    let mut sink = std::io::sink();
    std::io::copy(&mut reader, &mut sink).map_err(|e| {
        ImageError::Io(format!("Failed to size layer {}: {}", digest, e))
    })
}

fn file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

/// Stream a docker-save tarball for a single-platform image
pub fn write_docker_save<W: Write>(
    out: W,
    store: &BlobStore,
    manifest: &ImageManifest,
    repo_tags: &[String],
) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    builder.mode(tar::HeaderMode::Deterministic);

    let config_digest = manifest.config.parsed_digest()?;
    let config_name = format!("{}.json", config_digest.hex);
    let config_bytes = store.read_small(&config_digest)?;
    let mut header = file_header(config_bytes.len() as u64);
    builder
        .append_data(&mut header, &config_name, config_bytes.as_slice())
        .map_err(|e| ImageError::Io(format!("docker-save config: {}", e)))?;

    let mut layer_names = Vec::with_capacity(manifest.layers.len());
    let mut last_layer_hex = String::new();
    for layer in &manifest.layers {
        let digest = layer.parsed_digest()?;
        let dir_name = format!("{}/", digest.hex);
        let mut dir_header = file_header(0);
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_mode(0o755);
        builder
            .append_data(&mut dir_header, &dir_name, std::io::empty())
            .map_err(|e| ImageError::Io(format!("docker-save layer dir: {}", e)))?;

        let entry_name = format!("{}/layer.tar", digest.hex);
        // One pass to size, one to stream.
        let size = decompressed_size(store, &digest, &layer.media_type)?;
        let reader = open_layer(store, &digest, &layer.media_type)?;
        let mut header = file_header(size);
        builder
            .append_data(&mut header, &entry_name, reader)
            .map_err(|e| ImageError::Io(format!("docker-save layer {}: {}", digest, e)))?;
        layer_names.push(entry_name);
        last_layer_hex = digest.hex.clone();
    }

    let save_manifest = vec![SaveManifestEntry {
        config: config_name,
        repo_tags: repo_tags.to_vec(),
        layers: layer_names,
    }];
    let manifest_json = serde_json::to_vec(&save_manifest)?;
    let mut header = file_header(manifest_json.len() as u64);
    builder
        .append_data(&mut header, "manifest.json", &manifest_json[..])
        .map_err(|e| ImageError::Io(format!("docker-save manifest.json: {}", e)))?;

    // Legacy repositories map: repo -> tag -> top layer id.
    let mut repositories: serde_json::Map<String, serde_json::Value> = serde_json::Map::new();
    for repo_tag in repo_tags {
        if let Some((repo, tag)) = repo_tag.rsplit_once(':') {
            repositories
                .entry(repo.to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .expect("repositories entry is an object")
                .insert(
                    tag.to_string(),
                    serde_json::Value::String(last_layer_hex.clone()),
                );
        }
    }
    let repositories_json = serde_json::to_vec(&serde_json::Value::Object(repositories))?;
    let mut header = file_header(repositories_json.len() as u64);
    builder
        .append_data(&mut header, "repositories", &repositories_json[..])
        .map_err(|e| ImageError::Io(format!("docker-save repositories: {}", e)))?;

    builder
        .into_inner()
        .map_err(|e| ImageError::Io(format!("docker-save finish: {}", e)))?
        .flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_MANIFEST, OciDescriptor};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn layer_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, "etc/motd", &b"hello"[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_docker_save_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        // A gzip layer and a config in the store.
        let raw = layer_tar();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let gzipped = encoder.finish().unwrap();
        let layer_digest = store.write_small(&gzipped).unwrap();
        let config_digest = store
            .write_small(br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#)
            .unwrap();

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: OciDescriptor::new(MEDIA_TYPE_OCI_CONFIG, &config_digest, 10),
            layers: vec![OciDescriptor::new(
                MEDIA_TYPE_LAYER_GZIP,
                &layer_digest,
                gzipped.len() as i64,
            )],
            annotations: None,
            extra: BTreeMap::new(),
        };

        let mut out = Vec::new();
        write_docker_save(
            &mut out,
            &store,
            &manifest,
            &["example.com/app:latest".to_string()],
        )
        .unwrap();

        let mut archive = tar::Archive::new(Cursor::new(&out));
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.insert(name, data);
        }

        assert!(entries.contains_key(&format!("{}.json", config_digest.hex)));
        // The layer entry holds the decompressed tar bytes.
        assert_eq!(entries[&format!("{}/layer.tar", layer_digest.hex)], raw);

        let manifest_json: serde_json::Value =
            serde_json::from_slice(&entries["manifest.json"]).unwrap();
        assert_eq!(
            manifest_json[0]["Config"],
            format!("{}.json", config_digest.hex)
        );
        assert_eq!(manifest_json[0]["RepoTags"][0], "example.com/app:latest");
        assert_eq!(
            manifest_json[0]["Layers"][0],
            format!("{}/layer.tar", layer_digest.hex)
        );

        let repositories: serde_json::Value =
            serde_json::from_slice(&entries["repositories"]).unwrap();
        assert_eq!(
            repositories["example.com/app"]["latest"],
            layer_digest.hex
        );
    }
}
