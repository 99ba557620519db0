//! Persistent hashing worker
//!
//! Amortizes digest computation across many build actions: a
//! line-delimited JSON request stream on stdin, one JSON response per
//! line on stdout. Each request re-parses the one-shot `hash` CLI,
//! resolves its input against the request sandbox, and runs on a
//! CPU-sized pool; a failed request answers with a non-zero exit code
//! and the worker keeps serving.
//!
//! Results are cached keyed by the build system's opaque input digest,
//! sharded per hash algorithm behind reader/writer locks. Layer
//! metadata requests additionally cache `(diff_id, format, size)` so a
//! repeat request writes its output without opening the input. Cheat
//! mode tries to read a SHA-256 straight out of the opaque digest
//! (base64 or hex of exactly 32 bytes); cheated results are never
//! cached.

use crate::digest::{Digest, DigestAlgorithm, LayerFormat, layer_digests_from_path};
use crate::error::{ImageError, Result};
use crate::oci::LayerDescriptor;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, mpsc};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    #[serde(default)]
    pub request_id: u64,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<WorkInput>,
    #[serde(default)]
    pub verbosity: u32,
    #[serde(default)]
    pub sandbox_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkInput {
    pub path: String,
    #[serde(default)]
    pub digest: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResponse {
    pub request_id: u64,
    pub exit_code: i32,
    pub output: String,
}

/// What the `hash` CLI asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    /// Plain content hash
    Hash,
    /// Layer descriptor JSON: compressed digest, diff-id, size
    LayerMetadata,
}

impl HashEncoding {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(HashEncoding::Hash),
            "layer-metadata" => Ok(HashEncoding::LayerMetadata),
            other => Err(ImageError::Validation(format!(
                "Unknown hash encoding: {} (expected hash or layer-metadata)",
                other
            ))),
        }
    }
}

/// One parsed `hash` invocation
#[derive(Debug, Clone)]
pub struct HashJob {
    pub algorithm: DigestAlgorithm,
    pub encoding: HashEncoding,
    pub name: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
struct CachedResult {
    hash_hex: String,
    layer: Option<CachedLayer>,
}

#[derive(Debug, Clone)]
struct CachedLayer {
    diff_id: String,
    format: LayerFormat,
    size: u64,
}

/// Per-algorithm cache shards keyed by the opaque input digest
#[derive(Default)]
pub struct HashCache {
    sha256: RwLock<HashMap<String, CachedResult>>,
    sha512: RwLock<HashMap<String, CachedResult>>,
}

impl HashCache {
    fn shard(&self, algorithm: DigestAlgorithm) -> &RwLock<HashMap<String, CachedResult>> {
        match algorithm {
            DigestAlgorithm::Sha256 => &self.sha256,
            DigestAlgorithm::Sha512 => &self.sha512,
        }
    }

    fn get(&self, algorithm: DigestAlgorithm, key: &str) -> Option<CachedResult> {
        self.shard(algorithm)
            .read()
            .expect("hash cache lock")
            .get(key)
            .cloned()
    }

    fn insert(&self, algorithm: DigestAlgorithm, key: String, result: CachedResult) {
        self.shard(algorithm)
            .write()
            .expect("hash cache lock")
            .insert(key, result);
    }
}

/// Attempt to extract a raw SHA-256 from the build system's opaque
/// digest: base64 then hex, accepting exactly 32 decoded bytes.
pub fn cheat_sha256(opaque: &str) -> Option<Digest> {
    if let Ok(decoded) = BASE64.decode(opaque) {
        if decoded.len() == 32 {
            return Digest::new(DigestAlgorithm::Sha256, hex::encode(decoded)).ok();
        }
    }
    if opaque.len() == 64 {
        if let Ok(decoded) = hex::decode(opaque) {
            if decoded.len() == 32 {
                return Digest::new(DigestAlgorithm::Sha256, hex::encode(decoded)).ok();
            }
        }
    }
    None
}

fn write_output(job: &HashJob, hash_hex: &str, layer: Option<&CachedLayer>) -> Result<String> {
    match job.encoding {
        HashEncoding::Hash => {
            let text = format!("{}:{}", job.algorithm, hash_hex);
            std::fs::write(&job.output, &text).map_err(|e| {
                ImageError::Io(format!("Failed to write {}: {}", job.output.display(), e))
            })?;
            Ok(text)
        }
        HashEncoding::LayerMetadata => {
            let layer = layer.ok_or_else(|| {
                ImageError::Validation("Layer metadata missing from cache entry".to_string())
            })?;
            let descriptor = LayerDescriptor {
                annotations: BTreeMap::new(),
                diff_id: layer.diff_id.clone(),
                digest: format!("{}:{}", job.algorithm, hash_hex),
                media_type: layer.format.media_type().to_string(),
                name: job.name.clone(),
                size: layer.size as i64,
            };
            let json = crate::oci::canonical_json(&descriptor)?;
            std::fs::write(&job.output, &json).map_err(|e| {
                ImageError::Io(format!("Failed to write {}: {}", job.output.display(), e))
            })?;
            Ok(descriptor.digest)
        }
    }
}

/// Run one hash job. `opaque_digest` keys the cache; `cheat` skips
/// hashing when the opaque digest already encodes a SHA-256.
pub fn execute_hash(
    job: &HashJob,
    opaque_digest: Option<&str>,
    cache: Option<&HashCache>,
    cheat: bool,
) -> Result<String> {
    if let (Some(cache), Some(key)) = (cache, opaque_digest) {
        if let Some(cached) = cache.get(job.algorithm, key) {
            // Cache hit: the input file is not opened at all.
            return write_output(job, &cached.hash_hex, cached.layer.as_ref());
        }
    }

    if cheat && job.encoding == HashEncoding::Hash && job.algorithm == DigestAlgorithm::Sha256 {
        if let Some(digest) = opaque_digest.and_then(cheat_sha256) {
            // Cheated results are never cached.
            return write_output(job, &digest.hex, None);
        }
    }

    if !job.input.is_file() {
        return Err(ImageError::Validation(format!(
            "Input file does not exist: {}",
            job.input.display()
        )));
    }

    let result = match job.encoding {
        HashEncoding::Hash => {
            let file = std::fs::File::open(&job.input)
                .map_err(|e| ImageError::Io(format!("Failed to open {}: {}", job.input.display(), e)))?;
            let (digest, _size) = match job.algorithm {
                DigestAlgorithm::Sha256 => Digest::sha256_reader(file)?,
                DigestAlgorithm::Sha512 => Digest::sha512_reader(file)?,
            };
            CachedResult {
                hash_hex: digest.hex,
                layer: None,
            }
        }
        HashEncoding::LayerMetadata => {
            if job.algorithm != DigestAlgorithm::Sha256 {
                return Err(ImageError::Validation(
                    "Layer metadata digests are always sha256".to_string(),
                ));
            }
            let digests = layer_digests_from_path(&job.input)?;
            CachedResult {
                hash_hex: digests.digest.hex,
                layer: Some(CachedLayer {
                    diff_id: digests.diff_id.to_string(),
                    format: digests.format,
                    size: digests.size,
                }),
            }
        }
    };

    let output = write_output(job, &result.hash_hex, result.layer.as_ref())?;
    if let (Some(cache), Some(key)) = (cache, opaque_digest) {
        cache.insert(job.algorithm, key.to_string(), result);
    }
    Ok(output)
}

/// Parse the `hash` CLI arguments a worker request carries. Kept in
/// lock-step with the one-shot subcommand.
pub fn parse_hash_arguments(arguments: &[String]) -> Result<HashJob> {
    let mut algorithm = DigestAlgorithm::Sha256;
    let mut encoding = HashEncoding::Hash;
    let mut name = String::new();
    let mut positionals = Vec::new();
    let mut iter = arguments.iter().peekable();
    while let Some(argument) = iter.next() {
        match argument.as_str() {
            "hash" if positionals.is_empty() && name.is_empty() => {}
            "--algorithm" => {
                let value = iter.next().ok_or_else(|| {
                    ImageError::Validation("--algorithm needs a value".to_string())
                })?;
                algorithm = DigestAlgorithm::parse(value)?;
            }
            "--encoding" => {
                let value = iter.next().ok_or_else(|| {
                    ImageError::Validation("--encoding needs a value".to_string())
                })?;
                encoding = HashEncoding::parse(value)?;
            }
            "--name" => {
                name = iter
                    .next()
                    .ok_or_else(|| ImageError::Validation("--name needs a value".to_string()))?
                    .clone();
            }
            "--persistent-worker" | "--verbose" => {}
            other if other.starts_with("--") => {
                return Err(ImageError::Validation(format!(
                    "Unknown hash flag: {}",
                    other
                )));
            }
            other => positionals.push(other.to_string()),
        }
    }
    if positionals.len() != 2 {
        return Err(ImageError::Validation(format!(
            "hash expects <input> <output>, got {} positional arguments",
            positionals.len()
        )));
    }
    Ok(HashJob {
        algorithm,
        encoding,
        name,
        input: PathBuf::from(&positionals[0]),
        output: PathBuf::from(&positionals[1]),
    })
}

fn resolve_sandboxed(path: &Path, sandbox: Option<&Path>) -> PathBuf {
    match sandbox {
        Some(sandbox) if path.is_relative() => sandbox.join(path),
        _ => path.to_path_buf(),
    }
}

/// Handle one request end to end; errors become non-zero responses
fn handle_request(request: &WorkRequest, cache: &HashCache, cheat: bool) -> WorkResponse {
    let result = (|| -> Result<String> {
        let mut job = parse_hash_arguments(&request.arguments)?;
        let sandbox = request.sandbox_dir.as_deref().map(Path::new);
        let opaque = request
            .inputs
            .iter()
            .find(|input| Path::new(&input.path) == job.input)
            .map(|input| input.digest.clone())
            .filter(|digest| !digest.is_empty());
        job.input = resolve_sandboxed(&job.input, sandbox);
        job.output = resolve_sandboxed(&job.output, sandbox);
        execute_hash(&job, opaque.as_deref(), Some(cache), cheat)
    })();
    match result {
        Ok(output) => WorkResponse {
            request_id: request.request_id,
            exit_code: 0,
            output,
        },
        Err(e) => WorkResponse {
            request_id: request.request_id,
            exit_code: e.exit_code(),
            output: e.to_string(),
        },
    }
}

/// Serve the persistent worker protocol until stdin closes. Request
/// ingestion is serialized; handling runs concurrently on a CPU-sized
/// pool.
pub async fn run_worker(cheat: bool) -> Result<()> {
    let cache = Arc::new(HashCache::default());
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let limit = Arc::new(Semaphore::new(workers));
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<WorkResponse>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = response_rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(_) => continue,
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ImageError::Io(format!("worker stdin: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let _ = response_tx.send(WorkResponse {
                    request_id: 0,
                    exit_code: crate::error::EXIT_VALIDATION,
                    output: format!("Malformed work request: {}", e),
                });
                continue;
            }
        };
        let cache = cache.clone();
        let limit = limit.clone();
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
            let _permit = limit.acquire().await.expect("semaphore closed");
            let response =
                tokio::task::spawn_blocking(move || handle_request(&request, &cache, cheat))
                    .await
                    .unwrap_or(WorkResponse {
                        request_id: 0,
                        exit_code: crate::error::EXIT_RUNTIME,
                        output: "worker task panicked".to_string(),
                    });
            let _ = response_tx.send(response);
        });
    }
    drop(response_tx);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cheat_sha256() {
        let digest = Digest::sha256(b"payload");
        let raw = hex::decode(&digest.hex).unwrap();
        assert_eq!(cheat_sha256(&BASE64.encode(&raw)), Some(digest.clone()));
        assert_eq!(cheat_sha256(&digest.hex), Some(digest));
        // Wrong length decodes are rejected.
        assert_eq!(cheat_sha256(&BASE64.encode(b"short")), None);
        assert_eq!(cheat_sha256("zz"), None);
    }

    #[test]
    fn test_parse_hash_arguments() {
        let job = parse_hash_arguments(&[
            "hash".to_string(),
            "--algorithm".to_string(),
            "sha512".to_string(),
            "--encoding".to_string(),
            "hash".to_string(),
            "in.bin".to_string(),
            "out.txt".to_string(),
        ])
        .unwrap();
        assert_eq!(job.algorithm, DigestAlgorithm::Sha512);
        assert_eq!(job.encoding, HashEncoding::Hash);
        assert_eq!(job.input, PathBuf::from("in.bin"));

        assert!(parse_hash_arguments(&["hash".to_string()]).is_err());
        assert!(
            parse_hash_arguments(&[
                "--algorithm".to_string(),
                "md5".to_string(),
                "a".to_string(),
                "b".to_string()
            ])
            .is_err()
        );
    }

    #[test]
    fn test_execute_hash_and_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        std::fs::write(&input, b"hello world").unwrap();
        let output = dir.path().join("out.txt");

        let cache = HashCache::default();
        let job = HashJob {
            algorithm: DigestAlgorithm::Sha256,
            encoding: HashEncoding::Hash,
            name: String::new(),
            input: input.clone(),
            output: output.clone(),
        };
        let first = execute_hash(&job, Some("opaque-key"), Some(&cache), false).unwrap();
        assert_eq!(
            first,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(std::fs::read_to_string(&output).unwrap(), first);

        // Second run: the input is gone, but the cache answers.
        std::fs::remove_file(&input).unwrap();
        let second = execute_hash(&job, Some("opaque-key"), Some(&cache), false).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn test_layer_metadata_caches_diff_id_and_size() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("layer.tar.gz");
        let payload = b"tar bytes".repeat(100);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        std::fs::write(&input, encoder.finish().unwrap()).unwrap();
        let output = dir.path().join("layer.json");

        let cache = HashCache::default();
        let job = HashJob {
            algorithm: DigestAlgorithm::Sha256,
            encoding: HashEncoding::LayerMetadata,
            name: "_0_app".to_string(),
            input: input.clone(),
            output: output.clone(),
        };
        execute_hash(&job, Some("key"), Some(&cache), false).unwrap();
        let descriptor: LayerDescriptor =
            serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(descriptor.name, "_0_app");
        assert_eq!(descriptor.media_type, crate::oci::MEDIA_TYPE_LAYER_GZIP);
        assert_eq!(
            descriptor.diff_id,
            Digest::sha256(&payload).to_string()
        );

        // Cache hit writes an identical descriptor without the input.
        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&output).unwrap();
        execute_hash(&job, Some("key"), Some(&cache), false).unwrap();
        let again: LayerDescriptor =
            serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
        assert_eq!(again, descriptor);
    }

    #[test]
    fn test_cheated_results_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let cache = HashCache::default();
        let digest = Digest::sha256(b"whatever");
        let job = HashJob {
            algorithm: DigestAlgorithm::Sha256,
            encoding: HashEncoding::Hash,
            name: String::new(),
            // Input does not exist; cheat mode never opens it.
            input: dir.path().join("missing.bin"),
            output: output.clone(),
        };
        let result = execute_hash(&job, Some(&digest.hex), Some(&cache), true).unwrap();
        assert_eq!(result, digest.to_string());
        assert!(cache.get(DigestAlgorithm::Sha256, &digest.hex).is_none());
    }

    #[test]
    fn test_handle_request_reports_failures_without_exiting() {
        let cache = HashCache::default();
        let request = WorkRequest {
            request_id: 7,
            arguments: vec!["hash".to_string(), "only-one-positional".to_string()],
            inputs: vec![],
            verbosity: 0,
            sandbox_dir: None,
        };
        let response = handle_request(&request, &cache, false);
        assert_eq!(response.request_id, 7);
        assert_ne!(response.exit_code, 0);
        assert!(response.output.contains("hash expects"));
    }

    #[test]
    fn test_sandbox_resolution() {
        let sandbox = Path::new("/sandbox/1");
        assert_eq!(
            resolve_sandboxed(Path::new("a/b.bin"), Some(sandbox)),
            PathBuf::from("/sandbox/1/a/b.bin")
        );
        assert_eq!(
            resolve_sandboxed(Path::new("/abs/b.bin"), Some(sandbox)),
            PathBuf::from("/abs/b.bin")
        );
    }
}
