//! Pull orchestration: cache consultation, registry resolution, and
//! store materialization.

use std::io::Read;

use tracing::info;

use crate::cache::RefCache;
use crate::paths::Layout;
use crate::store::{Manifest, Store};
use crate::{ImageId, Result};

/// A reference resolved to its manifest, config, and layer streams.
///
/// Implemented by the registry client; test doubles serve layers from
/// memory.
pub trait ResolvedImage {
    /// The image manifest, layers in application order.
    fn manifest(&self) -> &Manifest;

    /// Raw bytes of the image configuration blob.
    fn config_bytes(&self) -> &[u8];

    /// Opens an uncompressed tar stream for the layer with `digest`.
    fn layer_reader(&mut self, digest: &str) -> Result<Box<dyn Read + '_>>;
}

/// Registry collaborator: resolves a reference string to an image.
///
/// Passed into [`Puller::new`] rather than living as process-wide state,
/// so embedders and tests can substitute their own resolution.
pub trait ImageSource {
    /// Resolves `reference` against the backing registry.
    fn resolve(&mut self, reference: &str) -> Result<Box<dyn ResolvedImage + '_>>;
}

/// Pulls images: cache first, then registry resolution and store
/// materialization.
#[derive(Debug)]
pub struct Puller<S> {
    cache: RefCache,
    store: Store,
    source: S,
}

impl<S: ImageSource> Puller<S> {
    /// Creates a puller over a layout and a registry collaborator.
    pub fn new(layout: &Layout, source: S) -> Self {
        Self {
            cache: RefCache::new(layout.clone()),
            store: Store::new(layout.clone()),
            source,
        }
    }

    /// Pulls `reference`, returning its image identity.
    ///
    /// A valid cache hit returns without any network or extraction work.
    /// Otherwise the reference is resolved, the image materialized
    /// (skipped when the identity already exists on disk, e.g. pulled
    /// earlier under a different reference), and the mapping recorded.
    ///
    /// A cache write failure after a successful materialization surfaces
    /// as [`Error::Cache`], which carries the identity; the image itself
    /// is complete and usable.
    ///
    /// [`Error::Cache`]: crate::Error::Cache
    pub fn pull(&mut self, reference: &str) -> Result<ImageId> {
        if let Some(id) = self.cache.lookup(reference) {
            info!(%reference, %id, "using cached image");
            return Ok(id);
        }

        let id = {
            let mut image = self.source.resolve(reference)?;
            self.store.materialize(image.as_mut())?
        };

        self.cache.record(reference, &id)?;
        Ok(id)
    }

    /// The underlying image store.
    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::io::Cursor;
    use std::rc::Rc;
    use std::cell::Cell;

    use tempfile::TempDir;

    use super::*;
    use crate::Error;
    use crate::store::Descriptor;

    #[derive(Debug)]
    struct FakeSource {
        manifest: Manifest,
        config: Vec<u8>,
        layers: HashMap<String, Vec<u8>>,
        resolves: usize,
        layer_reads: Rc<Cell<usize>>,
    }

    struct FakeImage {
        manifest: Manifest,
        config: Vec<u8>,
        layers: HashMap<String, Vec<u8>>,
        layer_reads: Rc<Cell<usize>>,
    }

    impl ImageSource for FakeSource {
        fn resolve(&mut self, _reference: &str) -> Result<Box<dyn ResolvedImage + '_>> {
            self.resolves += 1;
            Ok(Box::new(FakeImage {
                manifest: self.manifest.clone(),
                config: self.config.clone(),
                layers: self.layers.clone(),
                layer_reads: Rc::clone(&self.layer_reads),
            }))
        }
    }

    impl ResolvedImage for FakeImage {
        fn manifest(&self) -> &Manifest {
            &self.manifest
        }

        fn config_bytes(&self) -> &[u8] {
            &self.config
        }

        fn layer_reader(&mut self, digest: &str) -> Result<Box<dyn Read + '_>> {
            self.layer_reads.set(self.layer_reads.get() + 1);
            let data = self
                .layers
                .get(digest)
                .ok_or_else(|| Error::NotFound(digest.to_owned()))?;
            Ok(Box::new(Cursor::new(data.clone())))
        }
    }

    fn single_layer_source() -> FakeSource {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        builder.append_data(&mut header, "hello", &b"world"[..]).unwrap();
        let layer = builder.into_inner().unwrap();

        FakeSource {
            manifest: Manifest {
                config: Descriptor {
                    media_type: None,
                    digest: "sha256:cfgdigest".to_owned(),
                    size: 2,
                },
                layers: vec![Descriptor {
                    media_type: None,
                    digest: "sha256:layer0".to_owned(),
                    size: layer.len() as u64,
                }],
            },
            config: b"{}".to_vec(),
            layers: HashMap::from([("sha256:layer0".to_owned(), layer)]),
            resolves: 0,
            layer_reads: Rc::new(Cell::new(0)),
        }
    }

    #[test]
    fn second_pull_is_served_from_cache() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::at(temp.path());
        let mut puller = Puller::new(&layout, single_layer_source());

        let first = puller.pull("alpine:latest").unwrap();
        let second = puller.pull("alpine:latest").unwrap();

        assert_eq!(first, second);
        assert_eq!(puller.source.resolves, 1);
        assert!(layout.rootfs_dir(&first).join("hello").exists());
    }

    #[test]
    fn deleted_backing_state_forces_a_repull() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::at(temp.path());
        let mut puller = Puller::new(&layout, single_layer_source());

        let id = puller.pull("alpine:latest").unwrap();
        fs::remove_dir_all(layout.rootfs_dir(&id)).unwrap();
        fs::remove_dir_all(layout.image_dir(&id)).unwrap();

        let again = puller.pull("alpine:latest").unwrap();
        assert_eq!(id, again);
        assert_eq!(puller.source.resolves, 2);
        assert!(layout.rootfs_dir(&id).join("hello").exists());
    }

    #[test]
    fn failed_pull_is_not_recorded_in_the_cache() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::at(temp.path());

        let mut broken = single_layer_source();
        broken.layers.clear();
        let mut puller = Puller::new(&layout, broken);
        assert!(puller.pull("alpine:latest").is_err());

        // The reference must still miss, and a working source must do
        // the full pull rather than trusting leftover state.
        let mut retry = Puller::new(&layout, single_layer_source());
        let id = retry.pull("alpine:latest").unwrap();
        assert_eq!(retry.source.resolves, 1);
        assert!(layout.rootfs_dir(&id).join("hello").exists());
    }

    #[test]
    fn same_content_under_other_reference_skips_extraction() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::at(temp.path());
        let mut puller = Puller::new(&layout, single_layer_source());

        let id = puller.pull("alpine:latest").unwrap();
        let reads_after_first = puller.source.layer_reads.get();

        // Different reference resolving to the same content identity:
        // resolution happens, extraction does not.
        let aliased = puller.pull("alpine:3").unwrap();

        assert_eq!(id, aliased);
        assert_eq!(puller.source.resolves, 2);
        assert_eq!(puller.source.layer_reads.get(), reads_after_first);
    }
}
