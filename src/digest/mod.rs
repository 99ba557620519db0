//! Digest computation and validation
//!
//! Centralized SHA-256/SHA-512 handling for the image toolchain: parsing
//! and formatting of `<algorithm>:<hex>` strings, streaming hashers, and
//! the one-pass compressed-digest + diff-id computation used for layer
//! metadata. Layer digests are always computed over the compressed byte
//! stream; diff-ids over the uncompressed tar.

use crate::error::{ImageError, Result};
use flate2::write::MultiGzDecoder;
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// SHA-256 of the empty input
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Hex length of a digest under this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ImageError::Validation(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content digest: `(algorithm, hex)` with canonical text form
/// `<algorithm>:<hex>`. Equality is byte equality of the hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl Digest {
    pub fn new(algorithm: DigestAlgorithm, hex: String) -> Result<Self> {
        if hex.len() != algorithm.hex_len() {
            return Err(ImageError::Validation(format!(
                "Invalid {} digest length: expected {} hex characters, got {}",
                algorithm,
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ImageError::Validation(format!(
                "Invalid digest: contains non-hex characters: {}",
                hex
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Parse the canonical `<algorithm>:<hex>` form
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, hex) = s.split_once(':').ok_or_else(|| {
            ImageError::Validation(format!("Digest missing algorithm prefix: {}", s))
        })?;
        Self::new(DigestAlgorithm::parse(alg)?, hex.to_string())
    }

    /// SHA-256 of a byte slice
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: format!("{:x}", hasher.finalize()),
        }
    }

    /// SHA-256 of everything a reader yields
    pub fn sha256_reader<R: Read>(mut reader: R) -> Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((
            Self {
                algorithm: DigestAlgorithm::Sha256,
                hex: format!("{:x}", hasher.finalize()),
            },
            total,
        ))
    }

    /// SHA-512 of everything a reader yields
    pub fn sha512_reader<R: Read>(mut reader: R) -> Result<(Self, u64)> {
        let mut hasher = Sha512::new();
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((
            Self {
                algorithm: DigestAlgorithm::Sha512,
                hex: format!("{:x}", hasher.finalize()),
            },
            total,
        ))
    }

    /// Verify `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = match self.algorithm {
            DigestAlgorithm::Sha256 => Digest::sha256(data),
            DigestAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                hasher.update(data);
                Digest {
                    algorithm: DigestAlgorithm::Sha512,
                    hex: format!("{:x}", hasher.finalize()),
                }
            }
        };
        if actual != *self {
            return Err(ImageError::Validation(format!(
                "Digest mismatch: expected {}, computed {}",
                self, actual
            )));
        }
        Ok(())
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        &self.hex[..12.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// A `Write` adapter that hashes everything written through it
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn finish(self) -> (W, Digest, u64) {
        (
            self.inner,
            Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: format!("{:x}", self.hasher.finalize()),
            },
            self.written,
        )
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A sink that only hashes, discarding the bytes
struct HashingSink {
    hasher: Sha256,
    written: u64,
}

impl HashingSink {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl Write for HashingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Layer blob wire format, detected by magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFormat {
    Tar,
    TarGzip,
    TarZstd,
}

impl LayerFormat {
    pub fn detect(head: &[u8]) -> Self {
        if head.len() >= 2 && head[..2] == GZIP_MAGIC {
            LayerFormat::TarGzip
        } else if head.len() >= 4 && head[..4] == ZSTD_MAGIC {
            LayerFormat::TarZstd
        } else {
            LayerFormat::Tar
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            LayerFormat::Tar => "application/vnd.oci.image.layer.v1.tar",
            LayerFormat::TarGzip => "application/vnd.oci.image.layer.v1.tar+gzip",
            LayerFormat::TarZstd => "application/vnd.oci.image.layer.v1.tar+zstd",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerFormat::Tar => "tar",
            LayerFormat::TarGzip => "gzip",
            LayerFormat::TarZstd => "zstd",
        }
    }
}

/// Result of the one-pass layer metadata computation
#[derive(Debug, Clone)]
pub struct LayerDigests {
    /// Digest of the bytes as stored (compressed form)
    pub digest: Digest,
    /// Digest of the uncompressed tar stream
    pub diff_id: Digest,
    pub format: LayerFormat,
    /// Size of the compressed bytes
    pub size: u64,
}

enum DiffIdSink {
    // Multi-member aware: parallel gzip concatenates members.
    Gzip(MultiGzDecoder<HashingSink>),
    Zstd(zstd::stream::write::Decoder<'static, HashingSink>),
    Raw(HashingSink),
}

impl DiffIdSink {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            DiffIdSink::Gzip(w) => w.write_all(data),
            DiffIdSink::Zstd(w) => w.write_all(data),
            DiffIdSink::Raw(w) => w.write_all(data),
        }
    }

    fn finish(self) -> std::io::Result<HashingSink> {
        match self {
            DiffIdSink::Gzip(w) => w.finish(),
            DiffIdSink::Zstd(mut w) => {
                w.flush()?;
                Ok(w.into_inner())
            }
            DiffIdSink::Raw(w) => Ok(w),
        }
    }
}

/// Compute compressed digest and uncompressed diff-id in a single pass.
///
/// The input is tee'd into the compressed hasher and into a decompressor
/// (selected by magic bytes) whose output feeds the uncompressed hasher.
pub fn layer_digests<R: Read>(mut reader: R) -> Result<LayerDigests> {
    let mut head = Vec::with_capacity(4);
    let mut buf = [0u8; 64 * 1024];

    // Read enough for format detection; short inputs are raw tar.
    while head.len() < 4 {
        let n = reader.read(&mut buf[..4 - head.len()])?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    let format = LayerFormat::detect(&head);

    let mut compressed = HashingSink::new();
    let mut diff_id = match format {
        LayerFormat::TarGzip => DiffIdSink::Gzip(MultiGzDecoder::new(HashingSink::new())),
        LayerFormat::TarZstd => DiffIdSink::Zstd(
            zstd::stream::write::Decoder::new(HashingSink::new())
                .map_err(|e| ImageError::Io(format!("zstd decoder: {}", e)))?,
        ),
        LayerFormat::Tar => DiffIdSink::Raw(HashingSink::new()),
    };

    compressed.write_all(&head)?;
    diff_id
        .write_all(&head)
        .map_err(|e| ImageError::Parse(format!("Decompression error: {}", e)))?;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        compressed.write_all(&buf[..n])?;
        diff_id
            .write_all(&buf[..n])
            .map_err(|e| ImageError::Parse(format!("Decompression error: {}", e)))?;
    }
    let diff_sink = diff_id
        .finish()
        .map_err(|e| ImageError::Parse(format!("Decompression error: {}", e)))?;

    let size = compressed.written;
    Ok(LayerDigests {
        digest: Digest {
            algorithm: DigestAlgorithm::Sha256,
            hex: format!("{:x}", compressed.hasher.finalize()),
        },
        diff_id: Digest {
            algorithm: DigestAlgorithm::Sha256,
            hex: format!("{:x}", diff_sink.hasher.finalize()),
        },
        format,
        size,
    })
}

/// [`layer_digests`] over a file on disk
pub fn layer_digests_from_path(path: &Path) -> Result<LayerDigests> {
    let file = File::open(path)
        .map_err(|e| ImageError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
    layer_digests(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(Digest::sha256(b"hello world").hex, HELLO_SHA256);
        assert_eq!(Digest::sha256(b"").hex, EMPTY_SHA256);
    }

    #[test]
    fn test_parse_roundtrip() {
        let text = format!("sha256:{}", HELLO_SHA256);
        let digest = Digest::parse(&text).unwrap();
        assert_eq!(digest.to_string(), text);
        assert_eq!(digest.algorithm, DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Digest::parse("sha256:short").is_err());
        assert!(Digest::parse(HELLO_SHA256).is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        let bad = format!("sha256:{}", "z".repeat(64));
        assert!(Digest::parse(&bad).is_err());
    }

    #[test]
    fn test_verify() {
        let digest = Digest::sha256(b"hello world");
        assert!(digest.verify(b"hello world").is_ok());
        assert!(digest.verify(b"hello there").is_err());
    }

    #[test]
    fn test_format_detect() {
        assert_eq!(LayerFormat::detect(&[0x1f, 0x8b, 0x08]), LayerFormat::TarGzip);
        assert_eq!(
            LayerFormat::detect(&[0x28, 0xb5, 0x2f, 0xfd]),
            LayerFormat::TarZstd
        );
        assert_eq!(LayerFormat::detect(b"ustar"), LayerFormat::Tar);
        assert_eq!(LayerFormat::detect(b""), LayerFormat::Tar);
    }

    #[test]
    fn test_layer_digests_gzip() {
        let payload = b"dummy tar layer content".repeat(100);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let gzipped = encoder.finish().unwrap();

        let result = layer_digests(&gzipped[..]).unwrap();
        assert_eq!(result.format, LayerFormat::TarGzip);
        assert_eq!(result.size, gzipped.len() as u64);
        assert_eq!(result.digest, Digest::sha256(&gzipped));
        assert_eq!(result.diff_id, Digest::sha256(&payload));
    }

    #[test]
    fn test_layer_digests_zstd() {
        let payload = b"another layer payload".repeat(50);
        let compressed = zstd::encode_all(&payload[..], 3).unwrap();

        let result = layer_digests(&compressed[..]).unwrap();
        assert_eq!(result.format, LayerFormat::TarZstd);
        assert_eq!(result.digest, Digest::sha256(&compressed));
        assert_eq!(result.diff_id, Digest::sha256(&payload));
    }

    #[test]
    fn test_layer_digests_uncompressed() {
        let payload = b"plain tar bytes";
        let result = layer_digests(&payload[..]).unwrap();
        assert_eq!(result.format, LayerFormat::Tar);
        // Uncompressed: digest and diff-id coincide.
        assert_eq!(result.digest, result.diff_id);
    }

    #[test]
    fn test_hashing_writer() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello world").unwrap();
        let (inner, digest, n) = writer.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(digest.hex, HELLO_SHA256);
        assert_eq!(n, 11);
    }
}
