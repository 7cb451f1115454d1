//! On-disk state layout.
//!
//! Pure path composition over a single state root:
//!
//! ```text
//! $XDG_STATE_HOME/carton/
//! ├── images/<id>/{config.json,manifest.json}
//! ├── roots/<id>/...                flattened root filesystems
//! ├── containers/<cid>/{upper,work,merged}
//! └── image_cache.json              reference → identity map
//! ```

use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::{Error, ImageId, Result};

const STATE_DIR: &str = "carton";
const IMAGES_DIR: &str = "images";
const ROOTS_DIR: &str = "roots";
const CONTAINERS_DIR: &str = "containers";
const CACHE_FILE: &str = "image_cache.json";
const CACHE_LOCK_FILE: &str = "image_cache.lock";

/// Maps a state root to image, root filesystem, and container paths.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Opens the default layout: `$XDG_STATE_HOME/carton`, falling back
    /// to `~/.local/state/carton`.
    pub fn open() -> Result<Self> {
        let root = match env::var_os("XDG_STATE_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(STATE_DIR),
            _ => dirs::home_dir()
                .ok_or_else(|| Error::Store("cannot determine home directory".into()))?
                .join(".local")
                .join("state")
                .join(STATE_DIR),
        };
        Ok(Self { root })
    }

    /// Uses an explicit state root (embedding, tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state root directory.
    pub fn state_dir(&self) -> &Path {
        &self.root
    }

    /// Creates the state root if missing.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Directory holding all image records.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Per-identity image record directory (manifest + config).
    pub fn image_dir(&self, id: &ImageId) -> PathBuf {
        self.images_dir().join(id.as_str())
    }

    /// Directory holding all flattened root filesystems.
    pub fn roots_dir(&self) -> PathBuf {
        self.root.join(ROOTS_DIR)
    }

    /// Per-identity flattened root filesystem.
    pub fn rootfs_dir(&self, id: &ImageId) -> PathBuf {
        self.roots_dir().join(id.as_str())
    }

    /// Per-container working area; `upper`, `work`, and `merged` live
    /// beneath it.
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.root.join(CONTAINERS_DIR).join(container_id)
    }

    /// The persisted reference → identity cache file.
    pub fn cache_file(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    /// Sidecar lock file guarding cache read-modify-write cycles.
    pub fn cache_lock_file(&self) -> PathBuf {
        self.root.join(CACHE_LOCK_FILE)
    }
}
