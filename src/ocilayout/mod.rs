//! OCI layout emission
//!
//! Materializes an image or index from the local blob store as an OCI
//! layout: the `oci-layout` marker file, an `index.json` pointing at
//! the root descriptor, and a `blobs/<algorithm>/<hex>` tree holding
//! every reachable blob. Optionally packed as a tar instead of a
//! directory.

use crate::blobstore::BlobStore;
use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::oci::{ImageIndex, ManifestOrIndex, OciDescriptor, canonical_json};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

const LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Every blob reachable from the root, in dependency order (children
/// before parents is not required by the layout; emission order is
/// discovery order)
fn reachable_blobs(store: &BlobStore, root: &Digest) -> Result<Vec<Digest>> {
    let mut queue = vec![root.clone()];
    let mut seen = Vec::new();
    while let Some(digest) = queue.pop() {
        if seen.contains(&digest) {
            continue;
        }
        let bytes = store.read_small(&digest)?;
        match ManifestOrIndex::parse(&bytes) {
            Ok(ManifestOrIndex::Index(index)) => {
                for child in &index.manifests {
                    queue.push(child.parsed_digest()?);
                }
            }
            Ok(ManifestOrIndex::Manifest(manifest)) => {
                queue.push(manifest.config.parsed_digest()?);
                for layer in &manifest.layers {
                    queue.push(layer.parsed_digest()?);
                }
            }
            // Leaf blob (config or layer).
            Err(_) => {}
        }
        seen.push(digest);
    }
    Ok(seen)
}

fn layout_index(root: &OciDescriptor) -> Result<Vec<u8>> {
    let index = ImageIndex {
        schema_version: 2,
        media_type: Some(crate::oci::MEDIA_TYPE_OCI_INDEX.to_string()),
        manifests: vec![root.clone()],
        annotations: None,
        extra: BTreeMap::new(),
    };
    canonical_json(&index)
}

/// Write the layout as a directory tree
pub fn write_layout_dir(store: &BlobStore, root: &OciDescriptor, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| ImageError::Io(format!("Failed to create {}: {}", out_dir.display(), e)))?;
    std::fs::write(out_dir.join("oci-layout"), LAYOUT_MARKER)?;
    std::fs::write(out_dir.join("index.json"), layout_index(root)?)?;

    let root_digest = root.parsed_digest()?;
    for digest in reachable_blobs(store, &root_digest)? {
        let target_dir = out_dir.join("blobs").join(digest.algorithm.as_str());
        std::fs::create_dir_all(&target_dir)?;
        let target = target_dir.join(&digest.hex);
        if target.exists() {
            continue;
        }
        std::fs::copy(store.blob_path(&digest), &target).map_err(|e| {
            ImageError::Io(format!("Failed to copy blob {}: {}", digest, e))
        })?;
    }
    Ok(())
}

/// Write the layout as a tar stream
pub fn write_layout_tar<W: Write>(store: &BlobStore, root: &OciDescriptor, out: W) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut append_file = |name: &str, data: &[u8]| -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, name, data)
            .map_err(|e| ImageError::Io(format!("oci-layout tar {}: {}", name, e)))
    };

    append_file("oci-layout", LAYOUT_MARKER.as_bytes())?;
    append_file("index.json", &layout_index(root)?)?;

    let root_digest = root.parsed_digest()?;
    for digest in reachable_blobs(store, &root_digest)? {
        let name = format!("blobs/{}/{}", digest.algorithm.as_str(), digest.hex);
        let mut header = tar::Header::new_gnu();
        header.set_size(store.size(&digest)?);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        let file = store.open(&digest)?;
        builder
            .append_data(&mut header, &name, file)
            .map_err(|e| ImageError::Io(format!("oci-layout tar {}: {}", name, e)))?;
    }
    builder
        .into_inner()
        .map_err(|e| ImageError::Io(format!("oci-layout tar finish: {}", e)))?
        .flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{
        MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_MANIFEST, ImageManifest,
    };
    use std::io::Read;

    fn seeded_store() -> (tempfile::TempDir, BlobStore, OciDescriptor) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let layer_digest = store.write_small(b"layer-bytes").unwrap();
        let config_digest = store
            .write_small(br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#)
            .unwrap();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: OciDescriptor::new(MEDIA_TYPE_OCI_CONFIG, &config_digest, 10),
            layers: vec![OciDescriptor::new(MEDIA_TYPE_LAYER_GZIP, &layer_digest, 11)],
            annotations: None,
            extra: BTreeMap::new(),
        };
        let manifest_bytes = canonical_json(&manifest).unwrap();
        let manifest_digest = store.write_small(&manifest_bytes).unwrap();
        let root = OciDescriptor::new(
            MEDIA_TYPE_OCI_MANIFEST,
            &manifest_digest,
            manifest_bytes.len() as i64,
        );
        (dir, store, root)
    }

    #[test]
    fn test_layout_dir_structure() {
        let (_dir, store, root) = seeded_store();
        let out = tempfile::tempdir().unwrap();
        write_layout_dir(&store, &root, out.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(out.path().join("oci-layout")).unwrap(),
            LAYOUT_MARKER
        );
        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index["manifests"][0]["digest"], root.digest);

        // Root, config, and layer all present under blobs/sha256.
        let blob_count = std::fs::read_dir(out.path().join("blobs/sha256"))
            .unwrap()
            .count();
        assert_eq!(blob_count, 3);
    }

    #[test]
    fn test_layout_tar_contains_same_blobs() {
        let (_dir, store, root) = seeded_store();
        let mut tar_bytes = Vec::new();
        write_layout_tar(&store, &root, &mut tar_bytes).unwrap();

        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"oci-layout".to_string()));
        assert!(names.contains(&"index.json".to_string()));
        assert_eq!(names.iter().filter(|n| n.starts_with("blobs/")).count(), 3);
    }

    #[test]
    fn test_roundtrip_preserves_digests() {
        let (_dir, store, root) = seeded_store();
        let out = tempfile::tempdir().unwrap();
        write_layout_dir(&store, &root, out.path()).unwrap();

        // Every emitted blob re-hashes to its file name.
        for entry in std::fs::read_dir(out.path().join("blobs/sha256")).unwrap() {
            let entry = entry.unwrap();
            let mut data = Vec::new();
            std::fs::File::open(entry.path())
                .unwrap()
                .read_to_end(&mut data)
                .unwrap();
            assert_eq!(
                Digest::sha256(&data).hex,
                entry.file_name().to_string_lossy()
            );
        }
    }
}
