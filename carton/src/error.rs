//! Error types for carton runtime operations.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, carton::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by container runtime operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image has no flattened root filesystem in the local store.
    #[error("image {0} has no root filesystem; pull it first")]
    MissingRootfs(String),

    /// Neither the caller nor the image configuration named a command.
    #[error("no command given and the image defines no entrypoint or cmd")]
    NoCommand,

    /// An overlayfs mount or unmount failed.
    #[error("{op} overlay at {merged}: {source}")]
    Mount {
        /// The mount operation that failed.
        op: &'static str,
        /// The merged mount point.
        merged: PathBuf,
        /// The underlying OS error.
        source: io::Error,
    },

    /// An error from image acquisition or the local store.
    #[error(transparent)]
    Oci(#[from] carton_oci::Error),

    /// An I/O error from container state operations.
    #[error(transparent)]
    Io(#[from] io::Error),
}
