//! Error types shared across the image toolchain
//!
//! Every component surfaces its failures through [`ImageError`]; only the
//! registry transport recovers locally (retries). The cache-integrity
//! variant is distinguishable so callers can short-circuit instead of
//! re-entering the network path.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImageError>;

/// Process exit code for usage and validation failures.
pub const EXIT_VALIDATION: i32 = 1;
/// Process exit code for runtime and I/O failures.
pub const EXIT_RUNTIME: i32 = 2;
/// Process exit code for fatal integrity failures (cached blob mismatch).
pub const EXIT_INTEGRITY: i32 = 3;

#[derive(Error, Debug)]
pub enum ImageError {
    /// Malformed user input: bad digest string, unknown compression, flag misuse
    #[error("Validation error: {0}")]
    Validation(String),

    /// Content read from the local cache does not match its digest.
    /// Fatal by contract: no network fallback, the blob is kept for inspection.
    #[error("Integrity error at {path}: {message}\nDelete the blob to recover: rm {path}")]
    Integrity { message: String, path: PathBuf },

    /// Transient or final network failure
    #[error("Network error: {0}")]
    Network(String),

    /// 401/403 from a registry; never retried
    #[error("Authentication error: {0}")]
    Auth(String),

    /// 404 with no mirrors left to try
    #[error("Not found: {0}")]
    NotFound(String),

    /// containerd gRPC status or a loader process exiting non-zero
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// JSON that does not match the expected OCI type
    #[error("Schema error: {0}")]
    Schema(String),

    /// Upload protocol failure (session, chunk, or commit)
    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ImageError {
    /// Exit code per the documented contract: 1 usage/validation,
    /// 2 runtime/I-O, 3 fatal integrity.
    pub fn exit_code(&self) -> i32 {
        match self {
            ImageError::Validation(_) => EXIT_VALIDATION,
            ImageError::Integrity { .. } => EXIT_INTEGRITY,
            _ => EXIT_RUNTIME,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ImageError::Integrity { .. })
    }
}

impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> Self {
        ImageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for ImageError {
    fn from(err: reqwest::Error) -> Self {
        ImageError::Network(err.to_string())
    }
}

impl From<url::ParseError> for ImageError {
    fn from(err: url::ParseError) -> Self {
        ImageError::Validation(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for ImageError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ImageError::Parse(format!("UTF-8 conversion error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ImageError::Validation("x".into()).exit_code(), 1);
        assert_eq!(ImageError::Network("x".into()).exit_code(), 2);
        assert_eq!(
            ImageError::Integrity {
                message: "digest mismatch".into(),
                path: PathBuf::from("/tmp/blob"),
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn test_integrity_message_names_path() {
        let err = ImageError::Integrity {
            message: "digest mismatch".into(),
            path: PathBuf::from("/store/blobs/sha256/ab"),
        };
        let text = err.to_string();
        assert!(text.contains("/store/blobs/sha256/ab"));
        assert!(text.contains("rm "));
        assert!(err.is_integrity());
    }
}
