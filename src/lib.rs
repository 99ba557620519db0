//! OCI Image Builder
//!
//! `oci-image-builder` is the image-producing toolchain of a hermetic
//! build: a single multi-command binary (plus its registry transport)
//! that builds deterministic layer tars, assembles OCI manifests,
//! configs, and multi-platform indexes, and moves the results into
//! registries and container daemons.
//!
//! ## Main Modules
//! - [`castar`] - Content-addressed tar writing with hardlink dedup.
//! - [`layer`] - Layer building from declared file sets.
//! - [`compress`] - Parallel gzip, zstd, and eStargz output.
//! - [`manifest`] - Image config, manifest, and index assembly.
//! - [`oci`] - OCI image-spec data model and platform matching.
//! - [`blobstore`] - The content-addressed local blob store.
//! - [`transport`] - Cached-blob registry transport (airgap capable).
//! - [`registry`] - Distribution v2 client and credential keychain.
//! - [`refgraph`] - Pulls and the cached reference graph.
//! - [`push`] - Eager and lazy push pipelines.
//! - [`load`] - containerd, docker, and podman image loading.
//! - [`worker`] - The persistent hashing worker.
//! - [`template`] - Stamp-value template expansion.
//! - [`cli`] - Argument parsing, dispatch mode, and the runner.

pub mod blobstore;
pub mod castar;
pub mod cli;
pub mod compress;
pub mod digest;
pub mod error;
pub mod layer;
pub mod load;
pub mod logging;
pub mod manifest;
pub mod oci;
pub mod ocilayout;
pub mod push;
pub mod refgraph;
pub mod registry;
pub mod template;
pub mod transport;
pub mod worker;

pub use digest::{Digest, DigestAlgorithm};
pub use error::{ImageError, Result};
pub use logging::Logger;
