//! End-to-end pipeline tests: layer build, manifest assembly, blob
//! store ingestion, OCI layout emission, and the docker-save fallback,
//! all without touching a network.

use oci_image_builder::blobstore::BlobStore;
use oci_image_builder::compress::{CompressionAlgorithm, CompressionSettings};
use oci_image_builder::digest::Digest;
use oci_image_builder::layer::{
    GroupingPolicy, InputSpec, LayerSpec, SourceSpec, SymlinkSpec, build_layers,
};
use oci_image_builder::load::docker_save::write_docker_save;
use oci_image_builder::logging::Logger;
use oci_image_builder::manifest::{ManifestBuildRequest, build_manifest};
use oci_image_builder::oci::{ImageConfig, ManifestOrIndex, OciDescriptor, Platform};
use oci_image_builder::ocilayout::write_layout_dir;
use oci_image_builder::template::TemplateContext;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

fn gzip_settings() -> CompressionSettings {
    CompressionSettings {
        algorithm: CompressionAlgorithm::Gzip,
        level: Some(6),
        jobs: 2,
        estargz: false,
    }
}

fn sample_spec(source_dir: &Path) -> LayerSpec {
    std::fs::write(source_dir.join("server"), b"\x7fELF fake binary").unwrap();
    std::fs::write(source_dir.join("conf"), b"port=8080\n").unwrap();
    LayerSpec {
        name: "app".to_string(),
        inputs: vec![
            InputSpec {
                dest: "usr/bin/server".to_string(),
                source: SourceSpec::File {
                    path: source_dir.join("server"),
                },
                groups: vec![],
                include_executable: true,
            },
            InputSpec {
                dest: "etc/app/conf".to_string(),
                source: SourceSpec::File {
                    path: source_dir.join("conf"),
                },
                groups: vec![],
                include_executable: true,
            },
        ],
        default_metadata: Default::default(),
        metadata: BTreeMap::new(),
        symlinks: vec![SymlinkSpec {
            link: "usr/bin/srv".to_string(),
            target: "server".to_string(),
        }],
        empty_dirs: vec!["var/log/app".to_string()],
        annotations: BTreeMap::new(),
        grouping: GroupingPolicy::LayerPerGroup,
        layer_ids: None,
        include_groups: vec![],
        exclude_groups: vec![],
        layer_for_group: BTreeMap::new(),
    }
}

/// Build a layer, assemble a manifest on top of no base, ingest
/// everything into a store, and emit an OCI layout whose blobs all
/// re-hash to their names.
#[test]
fn layer_to_manifest_to_layout() {
    let sources = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let logger = Logger::new_quiet();

    let spec = sample_spec(sources.path());
    let layers = build_layers(&spec, out.path(), &gzip_settings(), &logger).unwrap();
    assert_eq!(layers.len(), 1);
    let layer = &layers[0];

    let request = ManifestBuildRequest {
        layers: vec![layer.descriptor.clone()],
        entrypoint: Some(vec!["/usr/bin/server".to_string()]),
        env: vec!["PORT=8080".to_string()],
        platform: Some(Platform::new("linux", "amd64", None)),
        created: Some("2024-06-01T00:00:00Z".to_string()),
        ..ManifestBuildRequest::default()
    };
    let assembled = build_manifest(&request, &TemplateContext::new()).unwrap();

    // The config records the layer's diff-id and the build timestamp.
    let config = ImageConfig::parse(&assembled.config_bytes).unwrap();
    assert_eq!(config.rootfs.diff_ids, vec![layer.descriptor.diff_id.clone()]);
    assert_eq!(config.created.as_deref(), Some("2024-06-01T00:00:00Z"));
    assert_eq!(
        config.config.unwrap().entrypoint.unwrap(),
        vec!["/usr/bin/server"]
    );

    // Ingest all three blobs and emit a layout.
    let store_dir = tempfile::tempdir().unwrap();
    let store = BlobStore::new(store_dir.path()).unwrap();
    store
        .write_small_with_digest(&assembled.config_digest, &assembled.config_bytes)
        .unwrap();
    store
        .write_small_with_digest(&assembled.manifest_digest, &assembled.manifest_bytes)
        .unwrap();
    let layer_digest = Digest::parse(&layer.descriptor.digest).unwrap();
    let mut blob = std::fs::File::open(&layer.blob_path).unwrap();
    store.write_large(&layer_digest, &mut blob).unwrap();

    let layout = tempfile::tempdir().unwrap();
    let root = OciDescriptor::new(
        oci_image_builder::oci::MEDIA_TYPE_OCI_MANIFEST,
        &assembled.manifest_digest,
        assembled.manifest_bytes.len() as i64,
    );
    write_layout_dir(&store, &root, layout.path()).unwrap();

    for entry in std::fs::read_dir(layout.path().join("blobs/sha256")).unwrap() {
        let entry = entry.unwrap();
        let mut data = Vec::new();
        std::fs::File::open(entry.path())
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(
            Digest::sha256(&data).hex,
            entry.file_name().to_string_lossy(),
            "layout blob does not re-hash to its name"
        );
    }
}

/// The same build twice produces byte-identical blobs, descriptors,
/// and manifests.
#[test]
fn rebuild_is_reproducible() {
    let sources = tempfile::tempdir().unwrap();
    let spec = sample_spec(sources.path());
    let logger = Logger::new_quiet();

    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let first = build_layers(&spec, out_a.path(), &gzip_settings(), &logger).unwrap();
    let second = build_layers(&spec, out_b.path(), &gzip_settings(), &logger).unwrap();
    assert_eq!(first[0].descriptor, second[0].descriptor);
    assert_eq!(
        std::fs::read(&first[0].blob_path).unwrap(),
        std::fs::read(&second[0].blob_path).unwrap()
    );

    let request = |layer: &oci_image_builder::oci::LayerDescriptor| ManifestBuildRequest {
        layers: vec![layer.clone()],
        platform: Some(Platform::new("linux", "amd64", None)),
        ..ManifestBuildRequest::default()
    };
    let manifest_a = build_manifest(&request(&first[0].descriptor), &TemplateContext::new()).unwrap();
    let manifest_b =
        build_manifest(&request(&second[0].descriptor), &TemplateContext::new()).unwrap();
    assert_eq!(manifest_a.manifest_digest, manifest_b.manifest_digest);
}

/// A built image converts to a docker-save tarball whose layer entry
/// matches the layer's diff-id.
#[test]
fn docker_save_matches_diff_id() {
    let sources = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let logger = Logger::new_quiet();

    let spec = sample_spec(sources.path());
    let layers = build_layers(&spec, out.path(), &gzip_settings(), &logger).unwrap();
    let request = ManifestBuildRequest {
        layers: vec![layers[0].descriptor.clone()],
        platform: Some(Platform::new("linux", "amd64", None)),
        ..ManifestBuildRequest::default()
    };
    let assembled = build_manifest(&request, &TemplateContext::new()).unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store = BlobStore::new(store_dir.path()).unwrap();
    store
        .write_small_with_digest(&assembled.config_digest, &assembled.config_bytes)
        .unwrap();
    let layer_digest = Digest::parse(&layers[0].descriptor.digest).unwrap();
    let mut blob = std::fs::File::open(&layers[0].blob_path).unwrap();
    store.write_large(&layer_digest, &mut blob).unwrap();

    let manifest = match ManifestOrIndex::parse(&assembled.manifest_bytes).unwrap() {
        ManifestOrIndex::Manifest(manifest) => manifest,
        ManifestOrIndex::Index(_) => unreachable!(),
    };
    let mut save_tar = Vec::new();
    write_docker_save(
        &mut save_tar,
        &store,
        &manifest,
        &["example.com/app:it".to_string()],
    )
    .unwrap();

    let mut archive = tar::Archive::new(&save_tar[..]);
    let mut found_layer = false;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().to_string();
        if name.ends_with("/layer.tar") {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            // The decompressed layer re-hashes to the diff-id.
            assert_eq!(
                Digest::sha256(&data).to_string(),
                layers[0].descriptor.diff_id
            );
            found_layer = true;
        }
    }
    assert!(found_layer);
}
