//! Persisted reference → identity cache with staleness detection.
//!
//! A single pretty-printed JSON file maps human references (e.g.
//! `alpine:latest`) to image identities. The cache is an optimization,
//! never a source of truth: entries are revalidated against the on-disk
//! image state, and a corrupt or missing file is treated as empty.
//! Read-modify-write cycles run under an exclusive file lock so
//! concurrent pullers cannot lose updates.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::Layout;
use crate::{Error, ImageId, Result};

/// On-disk shape of the cache file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    /// Reference string → image identity.
    #[serde(default)]
    ref_to_id: BTreeMap<String, ImageId>,
}

/// Reference → identity cache backed by `image_cache.json`.
#[derive(Debug)]
pub struct RefCache {
    layout: Layout,
}

impl RefCache {
    /// Creates a cache over the given layout.
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Looks up a reference, validating that the identity's backing
    /// directories still exist.
    ///
    /// A stale entry (backing state deleted externally) is removed from
    /// the file and reported as a miss. Cache file or lock problems
    /// degrade to a miss rather than failing the lookup.
    pub fn lookup(&self, reference: &str) -> Option<ImageId> {
        let _lock = match self.lock() {
            Ok(lock) => lock,
            Err(err) => {
                warn!(%err, "cache lock unavailable, treating as miss");
                return None;
            }
        };

        let mut cache = self.load();
        let id = cache.ref_to_id.get(reference)?.clone();
        if self.layout.image_dir(&id).is_dir() && self.layout.rootfs_dir(&id).is_dir() {
            debug!(%reference, %id, "cache hit");
            return Some(id);
        }

        debug!(%reference, %id, "stale cache entry, discarding");
        cache.ref_to_id.remove(reference);
        if let Err(err) = self.save(&cache) {
            warn!(%err, "failed to persist stale-entry removal");
        }
        None
    }

    /// Records a reference → identity mapping, rewriting the whole file.
    ///
    /// Failures carry `id` so callers holding only the error can still
    /// use the image it names.
    pub fn record(&self, reference: &str, id: &ImageId) -> Result<()> {
        let cache_err = |e: io::Error| Error::Cache {
            id: id.clone(),
            reason: e.to_string(),
        };
        let _lock = self.lock().map_err(cache_err)?;
        let mut cache = self.load();
        cache.ref_to_id.insert(reference.to_owned(), id.clone());
        self.save(&cache).map_err(cache_err)
    }

    /// Loads the cache file; absence or corruption yields an empty cache.
    fn load(&self) -> CacheFile {
        match fs::read_to_string(self.layout.cache_file()) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|err| {
                warn!(%err, "unreadable cache file, starting empty");
                CacheFile::default()
            }),
            Err(_) => CacheFile::default(),
        }
    }

    /// Persists the whole cache file, pretty-printed.
    fn save(&self, cache: &CacheFile) -> io::Result<()> {
        let data = serde_json::to_string_pretty(cache).map_err(io::Error::other)?;
        fs::write(self.layout.cache_file(), data)
    }

    /// Takes the exclusive cache lock, creating the state dir if needed.
    fn lock(&self) -> io::Result<Flock<File>> {
        fs::create_dir_all(self.layout.state_dir())?;
        let file = File::create(self.layout.cache_lock_file())?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| io::Error::from(errno))
    }
}
