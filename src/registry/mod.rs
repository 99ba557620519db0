//! Registry access: authentication keychain and the OCI distribution
//! v2 client shared by pull and push.

pub mod auth;
pub mod client;

pub use auth::{Credentials, Keychain};
pub use client::{RegistryClient, RegistryClientBuilder};
