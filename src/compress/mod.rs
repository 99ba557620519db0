//! Layer compression
//!
//! Gzip and zstd compression for layer tars. Gzip runs a pigz-style
//! parallel pipeline: fixed-size chunks are compressed as independent
//! gzip members on worker threads and reassembled in order, which keeps
//! the output deterministic for a given chunk size and level. Zstd uses
//! the library's own worker pool. Both are bounded by the user-visible
//! `compression_jobs` setting.

pub mod estargz;

use crate::error::{ImageError, Result};
use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::mpsc;

/// Chunk size fed to parallel gzip workers
const GZIP_CHUNK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Gzip,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            other => Err(ImageError::Validation(format!(
                "Unknown compression algorithm: {} (expected gzip or zstd)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    pub fn layer_media_type(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => crate::oci::MEDIA_TYPE_LAYER_GZIP,
            CompressionAlgorithm::Zstd => crate::oci::MEDIA_TYPE_LAYER_ZSTD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub level: Option<i32>,
    /// Worker bound for the compressor (`compression_jobs`)
    pub jobs: usize,
    /// Restructure gzip output as seekable eStargz
    pub estargz: bool,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Gzip,
            level: None,
            jobs: default_jobs(),
            estargz: false,
        }
    }
}

impl CompressionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(ImageError::Validation(
                "compression_jobs must be greater than 0".to_string(),
            ));
        }
        if self.estargz && self.algorithm != CompressionAlgorithm::Gzip {
            return Err(ImageError::Validation(
                "eStargz requires gzip compression".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Compress `reader` into `writer` per the settings. Returns the number
/// of uncompressed bytes consumed.
pub fn compress<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    settings: &CompressionSettings,
) -> Result<u64> {
    settings.validate()?;
    match settings.algorithm {
        CompressionAlgorithm::Gzip => {
            let level = GzLevel::new(settings.level.unwrap_or(6) as u32);
            if settings.jobs <= 1 {
                let mut encoder = GzEncoder::new(writer, level);
                let copied = std::io::copy(&mut reader, &mut encoder)
                    .map_err(|e| ImageError::Io(format!("gzip: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| ImageError::Io(format!("gzip finish: {}", e)))?;
                Ok(copied)
            } else {
                parallel_gzip(reader, writer, level, settings.jobs)
            }
        }
        CompressionAlgorithm::Zstd => {
            let mut encoder =
                zstd::stream::write::Encoder::new(writer, settings.level.unwrap_or(3))
                    .map_err(|e| ImageError::Io(format!("zstd encoder: {}", e)))?;
            if settings.jobs > 1 {
                encoder
                    .multithread(settings.jobs as u32)
                    .map_err(|e| ImageError::Io(format!("zstd workers: {}", e)))?;
            }
            let copied = std::io::copy(&mut reader, &mut encoder)
                .map_err(|e| ImageError::Io(format!("zstd: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| ImageError::Io(format!("zstd finish: {}", e)))?;
            Ok(copied)
        }
    }
}

/// Multi-member parallel gzip: chunks are compressed independently and
/// written back in input order. Concatenated gzip members form a valid
/// gzip stream.
fn parallel_gzip<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    level: GzLevel,
    jobs: usize,
) -> Result<u64> {
    let mut total_in = 0u64;
    std::thread::scope(|scope| -> Result<u64> {
        let (result_tx, result_rx) = mpsc::channel::<(usize, std::io::Result<Vec<u8>>)>();
        let mut work_txs = Vec::with_capacity(jobs);
        for _ in 0..jobs {
            let (work_tx, work_rx) = mpsc::channel::<(usize, Vec<u8>)>();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok((index, chunk)) = work_rx.recv() {
                    let mut encoder = GzEncoder::new(Vec::new(), level);
                    let compressed = encoder
                        .write_all(&chunk)
                        .and_then(|_| encoder.finish());
                    if result_tx.send((index, compressed)).is_err() {
                        break;
                    }
                }
            });
            work_txs.push(work_tx);
        }
        drop(result_tx);

        let mut pending: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut next_to_write = 0usize;
        let mut received = 0usize;
        let mut drain_one = |pending: &mut BTreeMap<usize, Vec<u8>>,
                             next_to_write: &mut usize,
                             writer: &mut W|
         -> Result<()> {
            let (index, compressed) = result_rx
                .recv()
                .map_err(|_| ImageError::Io("gzip worker exited early".to_string()))?;
            let compressed = compressed.map_err(|e| ImageError::Io(format!("gzip: {}", e)))?;
            pending.insert(index, compressed);
            while let Some(ready) = pending.remove(next_to_write) {
                writer.write_all(&ready)?;
                *next_to_write += 1;
            }
            Ok(())
        };

        let mut chunks_sent = 0usize;
        loop {
            let mut chunk = vec![0u8; GZIP_CHUNK_SIZE];
            let mut filled = 0usize;
            while filled < chunk.len() {
                let n = reader.read(&mut chunk[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 && chunks_sent > 0 {
                break;
            }
            chunk.truncate(filled);
            total_in += filled as u64;
            let worker = chunks_sent % jobs;
            work_txs[worker]
                .send((chunks_sent, chunk))
                .map_err(|_| ImageError::Io("gzip worker exited early".to_string()))?;
            chunks_sent += 1;
            // Keep at most two chunks per worker in flight.
            while chunks_sent - received > jobs * 2 {
                drain_one(&mut pending, &mut next_to_write, writer)?;
                received += 1;
            }
            if filled < GZIP_CHUNK_SIZE {
                break;
            }
        }
        drop(work_txs);

        while received < chunks_sent {
            drain_one(&mut pending, &mut next_to_write, writer)?;
            received += 1;
        }
        Ok(total_in)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;

    fn roundtrip_gzip(payload: &[u8], jobs: usize) -> Vec<u8> {
        let settings = CompressionSettings {
            algorithm: CompressionAlgorithm::Gzip,
            level: Some(6),
            jobs,
            estargz: false,
        };
        let mut compressed = Vec::new();
        let consumed = compress(payload, &mut compressed, &settings).unwrap();
        assert_eq!(consumed, payload.len() as u64);
        let mut decompressed = Vec::new();
        MultiGzDecoder::new(&compressed[..])
            .read_to_end(&mut decompressed)
            .unwrap();
        decompressed
    }

    #[test]
    fn test_gzip_roundtrip_single_worker() {
        let payload = b"layer bytes ".repeat(1000);
        assert_eq!(roundtrip_gzip(&payload, 1), payload);
    }

    #[test]
    fn test_parallel_gzip_roundtrip_multiple_chunks() {
        // Spans several chunks to exercise reassembly ordering.
        let payload: Vec<u8> = (0..(GZIP_CHUNK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        assert_eq!(roundtrip_gzip(&payload, 4), payload);
    }

    #[test]
    fn test_parallel_gzip_deterministic() {
        let payload = b"deterministic input".repeat(300_000);
        let settings = CompressionSettings {
            algorithm: CompressionAlgorithm::Gzip,
            level: Some(6),
            jobs: 3,
            estargz: false,
        };
        let mut first = Vec::new();
        let mut second = Vec::new();
        compress(&payload[..], &mut first, &settings).unwrap();
        compress(&payload[..], &mut second, &settings).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_gzip_empty_input() {
        assert_eq!(roundtrip_gzip(b"", 4), b"");
    }

    #[test]
    fn test_zstd_roundtrip() {
        let payload = b"zstd layer".repeat(500);
        let settings = CompressionSettings {
            algorithm: CompressionAlgorithm::Zstd,
            level: Some(3),
            jobs: 2,
            estargz: false,
        };
        let mut compressed = Vec::new();
        compress(&payload[..], &mut compressed, &settings).unwrap();
        let decompressed = zstd::decode_all(&compressed[..]).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = CompressionSettings::default();
        settings.jobs = 0;
        assert!(settings.validate().is_err());

        let mut settings = CompressionSettings::default();
        settings.algorithm = CompressionAlgorithm::Zstd;
        settings.estargz = true;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(
            CompressionAlgorithm::parse("gzip").unwrap(),
            CompressionAlgorithm::Gzip
        );
        assert_eq!(
            CompressionAlgorithm::parse("zstd").unwrap(),
            CompressionAlgorithm::Zstd
        );
        assert!(CompressionAlgorithm::parse("lz4").is_err());
    }
}
