//! Subcommand handlers
//!
//! Routes parsed arguments to the library components. Every handler
//! writes its product to the subcommand's positional output and keeps
//! user-facing reporting on the shared [`Logger`].

use crate::blobstore::BlobStore;
use crate::cli::args::{self, Args, Commands, parse_platform};
use crate::compress::{CompressionAlgorithm, CompressionSettings, compress, default_jobs};
use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::layer::{LayerSpec, build_layers};
use crate::load::{LoadTarget, Loader};
use crate::logging::Logger;
use crate::manifest::{BaseImage, IndexEntry, ManifestBuildRequest, build_index, build_manifest};
use crate::oci::{
    ImageConfig, LayerDescriptor, ManifestOrIndex, OciDescriptor, canonical_json,
    infer_manifest_media_type,
};
use crate::push::{DeployMetadata, DeployManifestEntry, PushStrategy, Pusher, RootKind, resolve_tags};
use crate::refgraph::{Facts, ImageRequest, ImagesFile, PullSource, RefGraphSync};
use crate::registry::auth::Keychain;
use crate::registry::client::RegistryClient;
use crate::template::{TemplateContext, expand};
use crate::transport::{CachedBlobTransport, TransportBody};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub async fn run(args: Args, logger: &Logger) -> Result<()> {
    args.validate()?;
    match args.command.expect("validated above") {
        Commands::Layer(args) => layer(args, logger),
        Commands::LayerMetadata(args) => layer_metadata(args, logger),
        Commands::Manifest(args) => manifest(args, logger),
        Commands::Index(args) => index(args, logger),
        Commands::Validate(args) => validate(args, logger),
        Commands::Pull(args) => pull(args, logger).await,
        Commands::Push(args) => push(args, logger).await,
        Commands::PushMetadata(args) => push_metadata(args, logger),
        Commands::Compress(args) => compress_file(args, logger),
        Commands::DownloadBlob(args) => download_blob(args, logger).await,
        Commands::OciLayout(args) => oci_layout(args, logger),
        Commands::ExpandTemplate(args) => expand_template(args, logger),
        Commands::Load(args) => load(args, logger).await,
        Commands::SyncOciRefGraph(args) => sync_ref_graph(args, logger).await,
        Commands::Hash(args) => hash(args, logger).await,
    }
}

/// Workspace status files are `KEY VALUE` lines
pub fn stamp_context(files: &[PathBuf]) -> Result<TemplateContext> {
    let mut context = TemplateContext::new();
    for file in files {
        let contents = std::fs::read_to_string(file)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", file.display(), e)))?;
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once(' ') {
                context.insert(key.trim(), value.trim());
            }
        }
    }
    Ok(context)
}

fn parse_kv_pairs(pairs: &[String]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn compression_settings(
    algorithm: &str,
    level: Option<i32>,
    jobs: Option<usize>,
    estargz: bool,
) -> Result<CompressionSettings> {
    Ok(CompressionSettings {
        algorithm: CompressionAlgorithm::parse(algorithm)?,
        level,
        jobs: jobs.unwrap_or_else(default_jobs),
        estargz,
    })
}

fn layer(args: args::LayerArgs, logger: &Logger) -> Result<()> {
    let spec: LayerSpec = serde_json::from_str(
        &std::fs::read_to_string(&args.spec)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", args.spec.display(), e)))?,
    )
    .map_err(|e| ImageError::Parse(format!("Malformed layer spec: {}", e)))?;
    let settings = compression_settings(
        &args.compression,
        args.level,
        args.compression_jobs,
        args.estargz,
    )?;
    std::fs::create_dir_all(&args.output_dir)?;

    let layers = build_layers(&spec, &args.output_dir, &settings, logger)?;
    for layer in &layers {
        let descriptor_path = args
            .output_dir
            .join(format!("{}.json", layer.descriptor.name));
        std::fs::write(&descriptor_path, canonical_json(&layer.descriptor)?)?;
        logger.info(&format!(
            "Layer {} -> {} ({} bytes, {})",
            layer.descriptor.name,
            layer.blob_path.display(),
            layer.descriptor.size,
            layer.descriptor.digest
        ));
    }
    Ok(())
}

fn layer_metadata(args: args::LayerMetadataArgs, logger: &Logger) -> Result<()> {
    let digests = crate::digest::layer_digests_from_path(&args.input)?;
    let descriptor = LayerDescriptor {
        annotations: BTreeMap::new(),
        diff_id: digests.diff_id.to_string(),
        digest: digests.digest.to_string(),
        media_type: digests.format.media_type().to_string(),
        name: args.name.clone(),
        size: digests.size as i64,
    };
    std::fs::write(&args.output, canonical_json(&descriptor)?)?;
    logger.verbose(&format!(
        "{}: {} ({} bytes, {})",
        args.input.display(),
        descriptor.digest,
        descriptor.size,
        digests.format.as_str()
    ));
    Ok(())
}

fn read_layer_descriptors(paths: &[PathBuf]) -> Result<Vec<LayerDescriptor>> {
    paths
        .iter()
        .map(|path| {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
            serde_json::from_str(&contents)
                .map_err(|e| ImageError::Parse(format!("Malformed layer descriptor {}: {}", path.display(), e)))
        })
        .collect()
}

fn manifest(args: args::ManifestArgs, logger: &Logger) -> Result<()> {
    let base = match (&args.base_manifest, &args.base_config) {
        (Some(manifest_path), Some(config_path)) => Some(BaseImage::parse(
            &std::fs::read(manifest_path)?,
            &std::fs::read(config_path)?,
        )?),
        _ => None,
    };
    let request = ManifestBuildRequest {
        base,
        layers: read_layer_descriptors(&args.layers)?,
        entrypoint: (!args.entrypoint.is_empty()).then(|| args.entrypoint.clone()),
        cmd: (!args.cmd.is_empty()).then(|| args.cmd.clone()),
        env: args.env.clone(),
        labels: parse_kv_pairs(&args.labels),
        user: args.user.clone(),
        working_dir: args.working_dir.clone(),
        stop_signal: args.stop_signal.clone(),
        annotations: parse_kv_pairs(&args.annotations),
        config_fragment: match &args.config_fragment {
            Some(path) => Some(serde_json::from_slice(&std::fs::read(path)?)?),
            None => None,
        },
        created: args.created.clone(),
        platform: args.platform.as_deref().map(parse_platform).transpose()?,
    };
    let context = stamp_context(&args.stamp_info_files)?;
    let assembled = build_manifest(&request, &context)?;

    std::fs::write(&args.config_out, &assembled.config_bytes)?;
    std::fs::write(&args.output, &assembled.manifest_bytes)?;
    if let Some(storage_dir) = &args.storage_dir {
        let store = BlobStore::new(storage_dir)?;
        store.write_small_with_digest(&assembled.config_digest, &assembled.config_bytes)?;
        store.write_small_with_digest(&assembled.manifest_digest, &assembled.manifest_bytes)?;
    }
    logger.info(&format!(
        "Manifest {} ({} layers)",
        assembled.manifest_digest,
        assembled.manifest.layers.len()
    ));
    Ok(())
}

fn index(args: args::IndexArgs, logger: &Logger) -> Result<()> {
    let mut entries = Vec::with_capacity(args.manifests.len());
    for (path, platform) in args.manifests.iter().zip(&args.platforms) {
        let bytes = std::fs::read(path)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        // Reject inputs that are not image manifests.
        match ManifestOrIndex::parse(&bytes)? {
            ManifestOrIndex::Manifest(_) => {}
            ManifestOrIndex::Index(_) => {
                return Err(ImageError::Schema(format!(
                    "{} is an index; indexes nest manifests, not indexes",
                    path.display()
                )));
            }
        }
        entries.push(IndexEntry {
            manifest_digest: Digest::sha256(&bytes),
            manifest_size: bytes.len() as i64,
            platform: parse_platform(platform)?,
        });
    }
    let context = stamp_context(&args.stamp_info_files)?;
    let (_, bytes, digest) = build_index(&entries, &parse_kv_pairs(&args.annotations), &context)?;
    std::fs::write(&args.output, &bytes)?;
    if let Some(storage_dir) = &args.storage_dir {
        BlobStore::new(storage_dir)?.write_small_with_digest(&digest, &bytes)?;
    }
    logger.info(&format!("Index {} ({} manifests)", digest, entries.len()));
    Ok(())
}

fn validate(args: args::ValidateArgs, logger: &Logger) -> Result<()> {
    let store = args
        .storage_dir
        .as_deref()
        .map(BlobStore::new)
        .transpose()?;
    for input in &args.inputs {
        let bytes = std::fs::read(input)?;
        let described: Vec<OciDescriptor> = match ManifestOrIndex::parse(&bytes) {
            Ok(ManifestOrIndex::Manifest(manifest)) => {
                let mut all = vec![manifest.config.clone()];
                all.extend(manifest.layers.clone());
                all
            }
            Ok(ManifestOrIndex::Index(index)) => index.manifests.clone(),
            Err(_) => {
                // Not a manifest or index; accept a well-formed config.
                ImageConfig::parse(&bytes)?;
                logger.info(&format!("{}: valid image config", input.display()));
                continue;
            }
        };
        if let Some(store) = &store {
            for descriptor in &described {
                let digest = descriptor.parsed_digest()?;
                if !store.exists(&digest) {
                    return Err(ImageError::NotFound(format!(
                        "{} references {} which is not in the store",
                        input.display(),
                        descriptor.digest
                    )));
                }
                let size = store.size(&digest)?;
                if size as i64 != descriptor.size {
                    return Err(ImageError::Schema(format!(
                        "{}: descriptor {} declares {} bytes but the blob has {}",
                        input.display(),
                        descriptor.digest,
                        descriptor.size,
                        size
                    )));
                }
            }
        }
        logger.info(&format!(
            "{}: valid ({} descriptors)",
            input.display(),
            described.len()
        ));
    }
    Ok(())
}

async fn pull(args: args::PullArgs, logger: &Logger) -> Result<()> {
    let store = Arc::new(BlobStore::new(&args.storage_dir)?);
    let keychain = Arc::new(Keychain::from_environment());
    let sync = RefGraphSync::new(store, keychain, logger.clone(), args.airgapped);

    let layer_handling = serde_json::from_value(serde_json::Value::String(
        args.layer_handling.clone(),
    ))
    .expect("validated");
    let request = ImageRequest {
        digest: args.digest.clone(),
        tag: args.tag.clone(),
        layer_handling,
        sources: vec![PullSource {
            repository: args.repository.clone(),
            registries: args.registries.clone(),
        }],
        root_module: true,
    };
    let mut facts = Facts::default();
    sync.sync(&mut facts, &[request]).await?;
    facts.save(&args.output)?;
    logger.success(&format!("Pulled {}", args.digest));
    Ok(())
}

async fn sync_ref_graph(args: args::SyncArgs, logger: &Logger) -> Result<()> {
    let images: ImagesFile = serde_json::from_str(
        &std::fs::read_to_string(&args.images)
            .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", args.images.display(), e)))?,
    )
    .map_err(|e| ImageError::Parse(format!("Malformed images file: {}", e)))?;
    let mut facts = match &args.facts {
        Some(path) => Facts::load(path)?,
        None => Facts::load(&args.output)?,
    };

    let store = Arc::new(BlobStore::new(&args.storage_dir)?);
    let keychain = Arc::new(Keychain::from_environment());
    let sync = RefGraphSync::new(store, keychain, logger.clone(), args.airgapped);
    sync.sync(&mut facts, &images.images).await?;
    facts.save(&args.output)?;
    logger.success(&format!(
        "Synchronized {} images into {}",
        images.images.len(),
        args.output.display()
    ));
    Ok(())
}

async fn push(args: args::PushArgs, logger: &Logger) -> Result<()> {
    let metadata = DeployMetadata::load(&args.metadata)?;
    let context = stamp_context(&args.stamp_info_files)?;
    let mut tags = resolve_tags(&args.tags, args.tag_file.as_deref(), &context)?;
    if tags.is_empty() {
        tags = metadata.tags.clone();
    }

    let store = Arc::new(BlobStore::new(&args.storage_dir)?);
    let keychain = Keychain::from_environment();
    let host = args
        .registry
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let transport = Arc::new(CachedBlobTransport::new(
        store.clone(),
        reqwest::Client::new(),
        args.airgapped,
    ));
    let client = Arc::new(
        RegistryClient::builder(args.registry.clone())
            .with_credentials(keychain.resolve(host))
            .with_transport(transport)
            .with_logger(logger.clone())
            .build()?,
    );
    let pusher = Pusher::new(client, store, args.repository.clone(), logger.clone())
        .with_mount_source(metadata.original_repository.clone());
    pusher.push(&metadata, &tags).await
}

fn descriptor_for_document(bytes: &[u8]) -> OciDescriptor {
    OciDescriptor {
        media_type: infer_manifest_media_type(bytes).to_string(),
        digest: Digest::sha256(bytes).to_string(),
        size: bytes.len() as i64,
        platform: None,
        annotations: None,
    }
}

fn push_metadata(args: args::PushMetadataArgs, logger: &Logger) -> Result<()> {
    let root_bytes = std::fs::read(&args.root)?;
    let root = descriptor_for_document(&root_bytes);
    let root_kind = match ManifestOrIndex::parse(&root_bytes)? {
        ManifestOrIndex::Manifest(_) => RootKind::Manifest,
        ManifestOrIndex::Index(_) => RootKind::Index,
    };

    let mut manifest_paths = args.manifests.clone();
    if manifest_paths.is_empty() && root_kind == RootKind::Manifest {
        manifest_paths.push(args.root.clone());
    }
    let mut manifests = Vec::with_capacity(manifest_paths.len());
    for path in &manifest_paths {
        let bytes = std::fs::read(path)?;
        let manifest = match ManifestOrIndex::parse(&bytes)? {
            ManifestOrIndex::Manifest(manifest) => manifest,
            ManifestOrIndex::Index(_) => {
                return Err(ImageError::Schema(format!(
                    "--manifest {} is an index",
                    path.display()
                )));
            }
        };
        let mut layer_blobs = vec![manifest.config.clone()];
        layer_blobs.extend(manifest.layers.clone());
        manifests.push(DeployManifestEntry {
            descriptor: descriptor_for_document(&bytes),
            layer_blobs,
            missing_blobs: args
                .missing_blobs
                .iter()
                .filter(|digest| {
                    manifest
                        .layers
                        .iter()
                        .any(|layer| layer.digest.as_str() == digest.as_str())
                })
                .cloned()
                .collect(),
        });
    }

    let strategy = if args.strategy == "lazy" {
        PushStrategy::Lazy
    } else {
        PushStrategy::Eager
    };
    let metadata = DeployMetadata {
        command: args.command.clone(),
        strategy,
        root,
        root_kind,
        manifests,
        tags: args.tags.clone(),
        daemon: args.daemon.clone(),
        original_registries: args.original_registries.clone(),
        original_repository: args.original_repository.clone(),
        original_tag: args.original_tag.clone(),
        original_digest: args.original_digest.clone(),
    };
    metadata.save(&args.output)?;
    logger.info(&format!(
        "Deploy metadata for {} ({} manifests) -> {}",
        metadata.root.digest,
        metadata.manifests.len(),
        args.output.display()
    ));
    Ok(())
}

fn compress_file(args: args::CompressArgs, logger: &Logger) -> Result<()> {
    let settings = compression_settings(&args.algorithm, args.level, args.jobs, false)?;
    let input = std::fs::File::open(&args.input)
        .map_err(|e| ImageError::Io(format!("Failed to open {}: {}", args.input.display(), e)))?;
    let output = std::fs::File::create(&args.output)
        .map_err(|e| ImageError::Io(format!("Failed to create {}: {}", args.output.display(), e)))?;
    let mut writer = std::io::BufWriter::new(output);
    let consumed = compress(input, &mut writer, &settings)?;
    writer.flush()?;
    let produced = std::fs::metadata(&args.output)?.len();
    logger.info(&format!(
        "{} -> {} ({} -> {} bytes, {})",
        args.input.display(),
        args.output.display(),
        consumed,
        produced,
        settings.algorithm.as_str()
    ));
    Ok(())
}

async fn download_blob(args: args::DownloadBlobArgs, logger: &Logger) -> Result<()> {
    let store = Arc::new(BlobStore::new(&args.storage_dir)?);
    let keychain = Keychain::from_environment();
    let registry_url = if args.registry.starts_with("http") {
        args.registry.clone()
    } else {
        format!("https://{}", args.registry)
    };
    let host = registry_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let transport = Arc::new(CachedBlobTransport::new(
        store.clone(),
        reqwest::Client::new(),
        args.airgapped,
    ));
    let credentials = keychain.resolve(host);
    let client = RegistryClient::builder(registry_url)
        .with_credentials(credentials)
        .with_transport(transport)
        .with_logger(logger.clone())
        .build()?;

    let digest = Digest::parse(&args.digest)?;
    let response = client.get_blob(&args.repository, &digest).await?;
    let mut output = std::fs::File::create(&args.output)
        .map_err(|e| ImageError::Io(format!("Failed to create {}: {}", args.output.display(), e)))?;
    match response.body {
        TransportBody::Bytes(bytes) => output.write_all(&bytes)?,
        TransportBody::File(mut file) => {
            std::io::copy(&mut file, &mut output)?;
        }
        TransportBody::Remote(remote) => {
            use futures_util::StreamExt;
            let mut hasher = crate::digest::HashingWriter::new(&mut output);
            let mut stream = remote.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| ImageError::Network(format!("Blob download: {}", e)))?;
                hasher.write_all(&chunk)?;
            }
            let (_, actual, _) = hasher.finish();
            if actual != digest {
                return Err(ImageError::Network(format!(
                    "Downloaded blob hashes to {} but expected {}",
                    actual, digest
                )));
            }
        }
    }
    logger.success(&format!("Downloaded {}", digest));
    Ok(())
}

fn oci_layout(args: args::OciLayoutArgs, logger: &Logger) -> Result<()> {
    let store = BlobStore::new(&args.storage_dir)?;
    let digest = Digest::parse(&args.root_digest)?;
    let bytes = store.read_small(&digest)?;
    let root = descriptor_for_document(&bytes);

    if args.tar {
        let out = std::fs::File::create(&args.output).map_err(|e| {
            ImageError::Io(format!("Failed to create {}: {}", args.output.display(), e))
        })?;
        crate::ocilayout::write_layout_tar(&store, &root, std::io::BufWriter::new(out))?;
    } else {
        crate::ocilayout::write_layout_dir(&store, &root, &args.output)?;
    }
    logger.success(&format!(
        "OCI layout for {} -> {}",
        digest,
        args.output.display()
    ));
    Ok(())
}

fn expand_template(args: args::ExpandTemplateArgs, logger: &Logger) -> Result<()> {
    let template = std::fs::read_to_string(&args.template)
        .map_err(|e| ImageError::Io(format!("Failed to read {}: {}", args.template.display(), e)))?;
    let context = stamp_context(&args.stamp_info_files)?;
    let expanded = expand(&template, &context)?;
    std::fs::write(&args.output, expanded)?;
    logger.verbose(&format!("Expanded template -> {}", args.output.display()));
    Ok(())
}

async fn load(args: args::LoadArgs, logger: &Logger) -> Result<()> {
    let metadata = DeployMetadata::load(&args.metadata)?;
    let store = Arc::new(BlobStore::new(&args.storage_dir)?);
    let platform = args.platform.as_deref().map(parse_platform).transpose()?;
    let target = LoadTarget::parse(&args.target)?;
    let loader = Loader::new(store, logger.clone());
    loader
        .load(&metadata, &args.references, platform.as_ref(), target)
        .await
}

async fn hash(args: args::HashArgs, logger: &Logger) -> Result<()> {
    if args.persistent_worker {
        logger.verbose("Serving persistent worker requests on stdin");
        return crate::worker::run_worker(args.cheat).await;
    }
    let job = crate::worker::HashJob {
        algorithm: crate::digest::DigestAlgorithm::parse(&args.algorithm)?,
        encoding: crate::worker::HashEncoding::parse(&args.encoding)?,
        name: args.name.clone(),
        input: args.input.clone().expect("validated"),
        output: args.output.clone().expect("validated"),
    };
    let result = crate::worker::execute_hash(&job, None, None, false)?;
    logger.verbose(&result);
    Ok(())
}

/// Locate a `dispatch.json` in the runfiles tree around the executable
pub fn find_dispatch_file() -> Option<PathBuf> {
    if let Ok(runfiles) = std::env::var("RUNFILES_DIR") {
        let candidate = Path::new(&runfiles).join("dispatch.json");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let exe = std::env::current_exe().ok()?;
    let runfiles = exe.with_extension("runfiles");
    let candidate = runfiles.join("dispatch.json");
    if candidate.is_file() {
        return Some(candidate);
    }
    let candidate = exe.parent()?.join("dispatch.json");
    candidate.is_file().then_some(candidate)
}
