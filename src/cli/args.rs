//! Command line argument parsing and validation
//!
//! One subcommand per image-toolchain operation. Every subcommand
//! accepts `--verbose` and names its product as a positional output
//! path. Validation failures exit 1, runtime errors 2, cache integrity
//! errors 3.

use crate::error::{ImageError, Result};
use crate::oci::Platform;
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "oci-image-builder",
    version,
    about = "Builds, assembles and transports OCI container images",
    long_about = "Image-producing toolchain for hermetic builds: deterministic layer tars, \
manifest/index assembly, cached registry pulls and pushes, and container daemon loads."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build layer tars from a layer spec
    Layer(LayerArgs),

    /// Compute the descriptor JSON for an existing layer blob
    LayerMetadata(LayerMetadataArgs),

    /// Assemble an image config and manifest
    Manifest(ManifestArgs),

    /// Assemble a multi-platform image index
    Index(IndexArgs),

    /// Schema-check manifests, indexes, and configs
    Validate(ValidateArgs),

    /// Pull one image (manifest graph plus blobs) into the local store
    Pull(PullArgs),

    /// Push an image or index described by deploy metadata
    Push(PushArgs),

    /// Emit the deploy metadata a later push or load consumes
    PushMetadata(PushMetadataArgs),

    /// Compress a file with the layer compressors
    Compress(CompressArgs),

    /// Fetch a single blob through the cached transport
    DownloadBlob(DownloadBlobArgs),

    /// Materialize an OCI layout directory or tar
    OciLayout(OciLayoutArgs),

    /// Expand a template against stamp values
    ExpandTemplate(ExpandTemplateArgs),

    /// Import an image into a container daemon
    Load(LoadArgs),

    /// Synchronize the cached reference graph
    SyncOciRefGraph(SyncArgs),

    /// Hash files (persistent-worker capable)
    Hash(HashArgs),
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Some(command) => match command {
                Commands::Layer(args) => args.validate(),
                Commands::LayerMetadata(args) => args.validate(),
                Commands::Manifest(args) => args.validate(),
                Commands::Index(args) => args.validate(),
                Commands::Validate(args) => args.validate(),
                Commands::Pull(args) => args.validate(),
                Commands::Push(args) => args.validate(),
                Commands::PushMetadata(args) => args.validate(),
                Commands::Compress(args) => args.validate(),
                Commands::DownloadBlob(args) => args.validate(),
                Commands::OciLayout(args) => args.validate(),
                Commands::ExpandTemplate(args) => args.validate(),
                Commands::Load(args) => args.validate(),
                Commands::SyncOciRefGraph(args) => args.validate(),
                Commands::Hash(args) => args.validate(),
            },
            None => Err(ImageError::Validation(
                "No command provided. Use --help for usage information.".into(),
            )),
        }
    }
}

/// Parse `os/architecture[/variant]`
pub fn parse_platform(s: &str) -> Result<Platform> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
        [os, architecture] => Ok(Platform::new(os, architecture, None)),
        [os, architecture, variant] => Ok(Platform::new(os, architecture, Some(variant))),
        _ => Err(ImageError::Validation(format!(
            "Invalid platform (expected os/architecture[/variant]): {}",
            s
        ))),
    }
}

fn require_digest(value: &str, flag: &str) -> Result<()> {
    crate::digest::Digest::parse(value)
        .map(|_| ())
        .map_err(|e| ImageError::Validation(format!("{}: {}", flag, e)))
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LayerArgs {
    /// Layer spec JSON describing inputs, metadata, and grouping
    #[arg(long, value_name = "FILE")]
    pub spec: PathBuf,

    /// Compression algorithm
    #[arg(long, default_value = "gzip")]
    pub compression: String,

    /// Compression level
    #[arg(long)]
    pub level: Option<i32>,

    /// Compression worker bound
    #[arg(long, value_name = "N")]
    pub compression_jobs: Option<usize>,

    /// Restructure gzip output as seekable eStargz
    #[arg(long, action = ArgAction::SetTrue)]
    pub estargz: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output directory for layer blobs and descriptor JSONs
    pub output_dir: PathBuf,
}

impl LayerArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.spec.exists() {
            return Err(ImageError::Validation(format!(
                "--spec: file '{}' does not exist",
                self.spec.display()
            )));
        }
        crate::compress::CompressionAlgorithm::parse(&self.compression)?;
        if self.compression_jobs == Some(0) {
            return Err(ImageError::Validation(
                "--compression-jobs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LayerMetadataArgs {
    /// Descriptor name recorded in the metadata JSON
    #[arg(long, default_value = "")]
    pub name: String,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Layer blob to describe
    pub input: PathBuf,

    /// Output descriptor JSON
    pub output: PathBuf,
}

impl LayerMetadataArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.input.exists() {
            return Err(ImageError::Validation(format!(
                "Input layer '{}' does not exist",
                self.input.display()
            )));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ManifestArgs {
    /// Base image manifest JSON
    #[arg(long, value_name = "FILE")]
    pub base_manifest: Option<PathBuf>,

    /// Base image config JSON
    #[arg(long, value_name = "FILE")]
    pub base_config: Option<PathBuf>,

    /// Layer descriptor JSONs, in layer order
    #[arg(long = "layer", value_name = "FILE")]
    pub layers: Vec<PathBuf>,

    /// Entrypoint element (repeatable, ordered)
    #[arg(long = "entrypoint")]
    pub entrypoint: Vec<String>,

    /// Cmd element (repeatable, ordered)
    #[arg(long = "cmd")]
    pub cmd: Vec<String>,

    /// KEY=VALUE environment entries
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// KEY=VALUE image labels
    #[arg(long = "label")]
    pub labels: Vec<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub working_dir: Option<String>,

    #[arg(long)]
    pub stop_signal: Option<String>,

    /// KEY=VALUE manifest annotations
    #[arg(long = "annotation")]
    pub annotations: Vec<String>,

    /// JSON fragment overlaid onto the image config
    #[arg(long, value_name = "FILE")]
    pub config_fragment: Option<PathBuf>,

    /// RFC 3339 build timestamp
    #[arg(long)]
    pub created: Option<String>,

    /// Target platform os/architecture[/variant]
    #[arg(long)]
    pub platform: Option<String>,

    /// Workspace status files feeding template expansion
    #[arg(long = "stamp-info-file", value_name = "FILE")]
    pub stamp_info_files: Vec<PathBuf>,

    /// Where the image config JSON is written
    #[arg(long, value_name = "FILE")]
    pub config_out: PathBuf,

    /// Also install config and manifest into this blob store
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output manifest JSON
    pub output: PathBuf,
}

impl ManifestArgs {
    pub fn validate(&self) -> Result<()> {
        if self.base_manifest.is_some() != self.base_config.is_some() {
            return Err(ImageError::Validation(
                "--base-manifest and --base-config must be provided together".to_string(),
            ));
        }
        if self.base_manifest.is_none() && self.platform.is_none() {
            return Err(ImageError::Validation(
                "--platform is required when no base image is given".to_string(),
            ));
        }
        if let Some(platform) = &self.platform {
            parse_platform(platform)?;
        }
        for pair in self.env.iter().chain(&self.labels).chain(&self.annotations) {
            if !pair.contains('=') {
                return Err(ImageError::Validation(format!(
                    "Expected KEY=VALUE, got '{}'",
                    pair
                )));
            }
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct IndexArgs {
    /// Per-platform manifest JSONs, in index order
    #[arg(long = "manifest", value_name = "FILE", required = true)]
    pub manifests: Vec<PathBuf>,

    /// Platform for each manifest, aligned with --manifest
    #[arg(long = "platform", required = true)]
    pub platforms: Vec<String>,

    /// KEY=VALUE index annotations
    #[arg(long = "annotation")]
    pub annotations: Vec<String>,

    /// Workspace status files feeding template expansion
    #[arg(long = "stamp-info-file", value_name = "FILE")]
    pub stamp_info_files: Vec<PathBuf>,

    /// Also install the index into this blob store
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output index JSON
    pub output: PathBuf,
}

impl IndexArgs {
    pub fn validate(&self) -> Result<()> {
        if self.manifests.len() != self.platforms.len() {
            return Err(ImageError::Validation(format!(
                "--manifest and --platform counts differ: {} vs {}",
                self.manifests.len(),
                self.platforms.len()
            )));
        }
        for platform in &self.platforms {
            parse_platform(platform)?;
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ValidateArgs {
    /// Verify descriptor digests against this blob store
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Manifest, index, or config JSONs to check
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

impl ValidateArgs {
    pub fn validate(&self) -> Result<()> {
        for input in &self.inputs {
            if !input.exists() {
                return Err(ImageError::Validation(format!(
                    "Input '{}' does not exist",
                    input.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PullArgs {
    /// Image digest to pull
    #[arg(long)]
    pub digest: String,

    /// Repository name (for example library/alpine)
    #[arg(short, long)]
    pub repository: String,

    /// Registry hosts to try, in declared order
    #[arg(long = "registry", required = true)]
    pub registries: Vec<String>,

    /// Original tag, recorded for provenance
    #[arg(long)]
    pub tag: Option<String>,

    /// shallow, eager, or lazy
    #[arg(long, default_value = "lazy")]
    pub layer_handling: String,

    /// Local blob store directory
    #[arg(long, default_value = ".image-cache", value_name = "DIR")]
    pub storage_dir: PathBuf,

    /// Serve everything from the local store; never touch the network
    #[arg(long, action = ArgAction::SetTrue)]
    pub airgapped: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output facts JSON covering the pulled graph
    pub output: PathBuf,
}

impl PullArgs {
    pub fn validate(&self) -> Result<()> {
        require_digest(&self.digest, "--digest")?;
        if self.repository.is_empty() {
            return Err(ImageError::Validation(
                "Repository name cannot be empty".to_string(),
            ));
        }
        serde_json::from_value::<crate::refgraph::LayerHandling>(serde_json::Value::String(
            self.layer_handling.clone(),
        ))
        .map_err(|_| {
            ImageError::Validation(format!(
                "--layer-handling must be shallow, eager, or lazy, got '{}'",
                self.layer_handling
            ))
        })?;
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PushArgs {
    /// Target registry, with scheme (https://...)
    #[arg(long)]
    pub registry: String,

    /// Target repository
    #[arg(short, long)]
    pub repository: String,

    /// Deploy metadata JSON driving the push
    #[arg(long, value_name = "FILE")]
    pub metadata: PathBuf,

    /// Literal tags
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Newline-delimited tag file (template-expanded)
    #[arg(long, value_name = "FILE")]
    pub tag_file: Option<PathBuf>,

    /// Workspace status files feeding template expansion
    #[arg(long = "stamp-info-file", value_name = "FILE")]
    pub stamp_info_files: Vec<PathBuf>,

    /// Local blob store directory
    #[arg(long, default_value = ".image-cache", value_name = "DIR")]
    pub storage_dir: PathBuf,

    #[arg(long, action = ArgAction::SetTrue)]
    pub airgapped: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl PushArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.registry.starts_with("http://") && !self.registry.starts_with("https://") {
            return Err(ImageError::Validation(format!(
                "Invalid registry URL: {}. Must start with http:// or https://",
                self.registry
            )));
        }
        if self.repository.is_empty() {
            return Err(ImageError::Validation(
                "Repository name cannot be empty".to_string(),
            ));
        }
        if !self.metadata.exists() {
            return Err(ImageError::Validation(format!(
                "--metadata: file '{}' does not exist",
                self.metadata.display()
            )));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PushMetadataArgs {
    /// push or load (recorded as the wrapped command)
    #[arg(long, default_value = "push")]
    pub command: String,

    /// eager or lazy
    #[arg(long, default_value = "eager")]
    pub strategy: String,

    /// Root manifest or index JSON
    #[arg(long, value_name = "FILE")]
    pub root: PathBuf,

    /// Per-platform manifest JSONs covered by the deploy
    #[arg(long = "manifest", value_name = "FILE")]
    pub manifests: Vec<PathBuf>,

    /// Blob digests absent from the local store (lazy strategy)
    #[arg(long = "missing-blob")]
    pub missing_blobs: Vec<String>,

    /// Literal tags
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Daemon hint recorded for load wrappers
    #[arg(long)]
    pub daemon: Option<String>,

    #[arg(long = "original-registry")]
    pub original_registries: Vec<String>,

    #[arg(long)]
    pub original_repository: Option<String>,

    #[arg(long)]
    pub original_tag: Option<String>,

    #[arg(long)]
    pub original_digest: Option<String>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output deploy metadata JSON
    pub output: PathBuf,
}

impl PushMetadataArgs {
    pub fn validate(&self) -> Result<()> {
        if self.strategy != "eager" && self.strategy != "lazy" {
            return Err(ImageError::Validation(format!(
                "--strategy must be eager or lazy, got '{}'",
                self.strategy
            )));
        }
        if !self.root.exists() {
            return Err(ImageError::Validation(format!(
                "--root: file '{}' does not exist",
                self.root.display()
            )));
        }
        for digest in &self.missing_blobs {
            require_digest(digest, "--missing-blob")?;
        }
        if let Some(digest) = &self.original_digest {
            require_digest(digest, "--original-digest")?;
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CompressArgs {
    /// gzip or zstd
    #[arg(long, default_value = "gzip")]
    pub algorithm: String,

    #[arg(long)]
    pub level: Option<i32>,

    /// Compression worker bound
    #[arg(long, value_name = "N")]
    pub jobs: Option<usize>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// File to compress
    pub input: PathBuf,

    /// Compressed output file
    pub output: PathBuf,
}

impl CompressArgs {
    pub fn validate(&self) -> Result<()> {
        crate::compress::CompressionAlgorithm::parse(&self.algorithm)?;
        if self.jobs == Some(0) {
            return Err(ImageError::Validation(
                "--jobs must be greater than 0".to_string(),
            ));
        }
        if !self.input.exists() {
            return Err(ImageError::Validation(format!(
                "Input '{}' does not exist",
                self.input.display()
            )));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DownloadBlobArgs {
    /// Blob digest
    #[arg(long)]
    pub digest: String,

    /// Registry host
    #[arg(long)]
    pub registry: String,

    #[arg(short, long)]
    pub repository: String,

    /// Local blob store directory
    #[arg(long, default_value = ".image-cache", value_name = "DIR")]
    pub storage_dir: PathBuf,

    #[arg(long, action = ArgAction::SetTrue)]
    pub airgapped: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output file for the blob bytes
    pub output: PathBuf,
}

impl DownloadBlobArgs {
    pub fn validate(&self) -> Result<()> {
        require_digest(&self.digest, "--digest")?;
        if self.repository.is_empty() {
            return Err(ImageError::Validation(
                "Repository name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct OciLayoutArgs {
    /// Digest of the root manifest or index in the store
    #[arg(long)]
    pub root_digest: String,

    /// Local blob store directory
    #[arg(long, default_value = ".image-cache", value_name = "DIR")]
    pub storage_dir: PathBuf,

    /// Emit a tar instead of a directory
    #[arg(long, action = ArgAction::SetTrue)]
    pub tar: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Output directory (or tar file with --tar)
    pub output: PathBuf,
}

impl OciLayoutArgs {
    pub fn validate(&self) -> Result<()> {
        require_digest(&self.root_digest, "--root-digest")
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ExpandTemplateArgs {
    /// Template file
    #[arg(long, value_name = "FILE")]
    pub template: PathBuf,

    /// Workspace status files feeding template expansion
    #[arg(long = "stamp-info-file", value_name = "FILE")]
    pub stamp_info_files: Vec<PathBuf>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Expanded output file
    pub output: PathBuf,
}

impl ExpandTemplateArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.template.exists() {
            return Err(ImageError::Validation(format!(
                "--template: file '{}' does not exist",
                self.template.display()
            )));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LoadArgs {
    /// Deploy metadata JSON describing what to load
    #[arg(long, value_name = "FILE")]
    pub metadata: PathBuf,

    /// containerd, docker, podman, generic, or auto
    #[arg(long, default_value = "auto")]
    pub target: String,

    /// Platform to select from a multi-platform index
    #[arg(long)]
    pub platform: Option<String>,

    /// repository:tag names the daemon should know the image by
    #[arg(long = "reference", required = true)]
    pub references: Vec<String>,

    /// Local blob store directory
    #[arg(long, default_value = ".image-cache", value_name = "DIR")]
    pub storage_dir: PathBuf,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl LoadArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.metadata.exists() {
            return Err(ImageError::Validation(format!(
                "--metadata: file '{}' does not exist",
                self.metadata.display()
            )));
        }
        if let Some(platform) = &self.platform {
            parse_platform(platform)?;
        }
        // The target may depend on LOADER_BINARY; resolve late, but
        // reject obviously unknown names now.
        if self.target != "generic" {
            crate::load::LoadTarget::parse(&self.target)?;
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SyncArgs {
    /// images.json: digests, sources, and layer handling
    #[arg(long, value_name = "FILE")]
    pub images: PathBuf,

    /// Existing facts JSON to start from
    #[arg(long, value_name = "FILE")]
    pub facts: Option<PathBuf>,

    /// Local blob store directory
    #[arg(long, default_value = ".image-cache", value_name = "DIR")]
    pub storage_dir: PathBuf,

    #[arg(long, action = ArgAction::SetTrue)]
    pub airgapped: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Updated facts JSON
    pub output: PathBuf,
}

impl SyncArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.images.exists() {
            return Err(ImageError::Validation(format!(
                "--images: file '{}' does not exist",
                self.images.display()
            )));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct HashArgs {
    /// sha256 or sha512
    #[arg(long, default_value = "sha256")]
    pub algorithm: String,

    /// hash or layer-metadata
    #[arg(long, default_value = "hash")]
    pub encoding: String,

    /// Descriptor name for layer-metadata output
    #[arg(long, default_value = "")]
    pub name: String,

    /// Serve the persistent worker protocol on stdin/stdout
    #[arg(long, action = ArgAction::SetTrue)]
    pub persistent_worker: bool,

    /// Extract digests from the build system's input digests when
    /// possible (worker mode)
    #[arg(long, action = ArgAction::SetTrue)]
    pub cheat: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// File to hash (one-shot mode)
    pub input: Option<PathBuf>,

    /// Output file (one-shot mode)
    pub output: Option<PathBuf>,
}

impl HashArgs {
    pub fn validate(&self) -> Result<()> {
        crate::digest::DigestAlgorithm::parse(&self.algorithm)?;
        crate::worker::HashEncoding::parse(&self.encoding)?;
        if !self.persistent_worker && (self.input.is_none() || self.output.is_none()) {
            return Err(ImageError::Validation(
                "hash needs <input> <output> unless --persistent-worker is set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_no_command() {
        let args = Args { command: None };
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_parse_platform() {
        let platform = parse_platform("linux/arm64/v8").unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.variant.as_deref(), Some("v8"));

        assert!(parse_platform("linux").is_err());
        assert!(parse_platform("a/b/c/d").is_err());
    }

    #[test]
    fn test_push_args_validation() {
        let args = PushArgs {
            registry: "registry.example.com".to_string(),
            repository: "app".to_string(),
            metadata: PathBuf::from("/nonexistent"),
            tags: vec![],
            tag_file: None,
            stamp_info_files: vec![],
            storage_dir: PathBuf::from(".image-cache"),
            airgapped: false,
            verbose: false,
        };
        // Missing scheme fails before the metadata check.
        assert!(args.validate().unwrap_err().to_string().contains("http"));
    }

    #[test]
    fn test_hash_args_validation() {
        let args = HashArgs {
            algorithm: "sha256".to_string(),
            encoding: "hash".to_string(),
            name: String::new(),
            persistent_worker: false,
            cheat: false,
            verbose: false,
            input: None,
            output: None,
        };
        assert!(args.validate().is_err());

        let worker = HashArgs {
            persistent_worker: true,
            ..args
        };
        assert!(worker.validate().is_ok());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "oci-image-builder",
            "compress",
            "--algorithm",
            "zstd",
            "in.tar",
            "out.tar.zst",
        ])
        .unwrap();
        match args.command {
            Some(Commands::Compress(compress)) => {
                assert_eq!(compress.algorithm, "zstd");
                assert_eq!(compress.input, PathBuf::from("in.tar"));
            }
            _ => panic!("parsed wrong subcommand"),
        }

        let args = Args::try_parse_from([
            "oci-image-builder",
            "sync-oci-ref-graph",
            "--images",
            "images.json",
            "facts.json",
        ])
        .unwrap();
        assert!(matches!(args.command, Some(Commands::SyncOciRefGraph(_))));
    }
}
