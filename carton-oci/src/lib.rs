//! OCI image acquisition and content-addressed storage for carton.
//!
//! Pulls container images from OCI registries, flattens their layers into
//! root filesystem trees keyed by a stable content identity, and caches
//! the work so repeated pulls are free.

#![allow(clippy::missing_docs_in_private_items)]

mod cache;
mod extract;
pub mod paths;
mod pull;
pub mod reference;
mod registry;
mod store;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use cache::RefCache;
pub use extract::{extract_tar, extract_tar_file};
pub use paths::Layout;
pub use pull::{ImageSource, Puller, ResolvedImage};
pub use reference::{Identifier, Reference};
pub use registry::Client;
pub use store::{Descriptor, Manifest, Store};

/// Result type for carton-oci operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from image acquisition and storage.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The image was not found in the registry or local store.
    #[error("image not found: {0}")]
    NotFound(String),

    /// No manifest matched the current platform.
    #[error("no matching platform for {arch}/{os}")]
    NoPlatform {
        /// CPU architecture.
        arch: String,
        /// Operating system.
        os: String,
    },

    /// An archive entry resolved outside the extraction root.
    ///
    /// The partially written tree must not be trusted; this is distinct
    /// from ordinary I/O failures.
    #[error("archive entry escapes extraction root: {entry}")]
    PathEscape {
        /// The offending entry path as stored in the archive.
        entry: PathBuf,
    },

    /// The reference cache could not be updated.
    ///
    /// A pull that fails only at this step still produced a usable image;
    /// `id` identifies the completed materialization.
    #[error("image {id} pulled but reference cache update failed: {reason}")]
    Cache {
        /// Identity of the image that was materialized despite the failure.
        id: ImageId,
        /// Why the cache write failed.
        reason: String,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(String),

    /// HTTP / registry protocol error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Stable content-derived image identity: 12 lowercase hex characters.
///
/// [`ImageId::compute`] is the canonical identity function: the leading
/// 12 hex characters of the SHA-256 of the input bytes. Registry pulls
/// hash the manifest's config digest string; local tarball imports hash
/// the raw archive bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Length of the identity token in hex characters.
    pub const LEN: usize = 12;

    /// Derives an identity from arbitrary bytes.
    pub fn compute(bytes: &[u8]) -> Self {
        Self::from_sha256(&Sha256::digest(bytes))
    }

    /// Encodes the leading bytes of a SHA-256 digest as an identity.
    pub(crate) fn from_sha256(digest: &[u8]) -> Self {
        let hex: String = digest
            .iter()
            .take(Self::LEN / 2)
            .map(|b| format!("{b:02x}"))
            .collect();
        Self(hex)
    }

    /// Parses an existing identity token.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == Self::LEN
            && s.chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::InvalidReference(format!("not an image identity: {s}")))
        }
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subset of the OCI image configuration relevant to container execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ImageConfig {
    /// Default command (`CMD`).
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint (`ENTRYPOINT`).
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default environment variables (`KEY=VALUE`).
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Default working directory.
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ImageConfig {
    /// Resolves the default command line: entrypoint followed by cmd.
    pub fn command(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(entrypoint) = &self.entrypoint {
            argv.extend(entrypoint.iter().cloned());
        }
        if let Some(cmd) = &self.cmd {
            argv.extend(cmd.iter().cloned());
        }
        argv
    }
}
