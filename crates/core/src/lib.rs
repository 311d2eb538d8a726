//! Core domain types for the on-demand extension fetcher.
//!
//! This crate defines the data model shared by the other crates:
//! - Postgres major versions, extension names and remote object keys
//! - Content hashes and remote object fingerprints
//! - The extension manifest
//! - Configuration

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod key;
pub mod manifest;

pub use config::{
    AppConfig, CacheConfig, CatalogConfig, FetchConfig, ManifestSource, RemoteExtConfig,
    StalenessPolicy,
};
pub use error::{Error, Result};
pub use fingerprint::{ContentHash, Fingerprint};
pub use key::{ExtensionName, PgMajorVersion, RemoteObjectKey};
pub use manifest::{Manifest, ManifestEntry, ManifestFile};
