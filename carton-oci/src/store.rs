//! Content-addressed image store.
//!
//! Persists image records (manifest + config) and flattened root
//! filesystems keyed by [`ImageId`]. Materialization is idempotent: an
//! identity whose record and rootfs directories both exist is never
//! re-extracted.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::paths::Layout;
use crate::pull::ResolvedImage;
use crate::{ImageConfig, ImageId, Result, extract};

const CONFIG_FILE: &str = "config.json";
const MANIFEST_FILE: &str = "manifest.json";

/// OCI content descriptor: a digest-addressed blob and its size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Descriptor {
    /// Blob media type.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Content digest (`sha256:…`).
    pub digest: String,
    /// Blob size in bytes.
    pub size: u64,
}

/// OCI image manifest (single platform): config plus ordered layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Manifest {
    /// Descriptor of the image configuration blob.
    pub config: Descriptor,
    /// Layer descriptors in application order.
    pub layers: Vec<Descriptor>,
}

/// Wire shape of the OCI config blob: execution settings nest under
/// `config`.
#[derive(Debug, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: Option<ImageConfig>,
}

/// Persists image records and flattened root filesystems.
#[derive(Debug)]
pub struct Store {
    layout: Layout,
}

impl Store {
    /// Creates a store over the given layout.
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Returns `true` if both the image record and root filesystem
    /// directories exist for `id`.
    pub fn is_materialized(&self, id: &ImageId) -> bool {
        self.layout.image_dir(id).is_dir() && self.layout.rootfs_dir(id).is_dir()
    }

    /// Materializes a resolved image: extracts every layer in manifest
    /// order into a staging directory, persists the manifest and config,
    /// then renames the staging directory into place.
    ///
    /// Returns immediately when the identity is already materialized.
    /// A failed attempt leaves only the staging directory behind, which
    /// never satisfies [`Store::is_materialized`], so a retry re-runs
    /// the full extraction instead of trusting partial state.
    pub fn materialize(&self, image: &mut dyn ResolvedImage) -> Result<ImageId> {
        let id = ImageId::compute(image.manifest().config.digest.as_bytes());

        // Not race-free against a concurrent first pull of the same
        // identity; both extract the same content, so the worst case is
        // redundant work, not corruption.
        if self.is_materialized(&id) {
            debug!(%id, "image already materialized");
            return Ok(id);
        }

        let staging = self.layout.roots_dir().join(format!("{id}.partial"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        // Later layers overwrite earlier ones at matching paths, so
        // extraction must follow manifest order.
        let digests: Vec<String> = image
            .manifest()
            .layers
            .iter()
            .map(|layer| layer.digest.clone())
            .collect();
        for (index, digest) in digests.iter().enumerate() {
            info!(layer = index + 1, total = digests.len(), %id, "extracting layer");
            let reader = image.layer_reader(digest)?;
            extract::extract_tar(reader, &staging)?;
        }

        let image_dir = self.layout.image_dir(&id);
        fs::create_dir_all(&image_dir)?;

        // Round-trip the config through a Value so the on-disk record is
        // readable regardless of how the registry formatted it.
        let config: serde_json::Value = serde_json::from_slice(image.config_bytes())?;
        fs::write(
            image_dir.join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )?;
        fs::write(
            image_dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(image.manifest())?,
        )?;

        // The rename is the commit point: only a complete extraction
        // ever appears at roots/<id>.
        let rootfs = self.layout.rootfs_dir(&id);
        if rootfs.exists() {
            fs::remove_dir_all(&rootfs)?;
        }
        fs::rename(&staging, &rootfs)?;

        Ok(id)
    }

    /// Loads the stored image configuration for `id`.
    ///
    /// A missing record or a config blob without execution settings
    /// yields the default (empty) configuration.
    pub fn load_config(&self, id: &ImageId) -> Result<ImageConfig> {
        let path = self.layout.image_dir(id).join(CONFIG_FILE);
        if !path.exists() {
            return Ok(ImageConfig::default());
        }
        let data = fs::read_to_string(path)?;
        let blob: ConfigBlob = serde_json::from_str(&data)?;
        Ok(blob.config.unwrap_or_default())
    }

    /// Imports a local image tarball under its content identity.
    ///
    /// The identity is the canonical hash of the raw archive bytes; the
    /// archive is unpacked into the image record directory. No flattened
    /// root filesystem is produced — layer flattening applies only to
    /// manifest-driven pulls.
    pub fn import_tarball(&self, archive: &Path) -> Result<ImageId> {
        let mut file = File::open(archive)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let id = ImageId::from_sha256(&hasher.finalize());

        let image_dir = self.layout.image_dir(&id);
        if image_dir.is_dir() {
            debug!(%id, "tarball already imported");
            return Ok(id);
        }
        extract::extract_tar_file(archive, &image_dir)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Cursor, Read};

    use tempfile::TempDir;

    use super::*;
    use crate::Error;

    struct FakeImage {
        manifest: Manifest,
        config: Vec<u8>,
        layers: HashMap<String, Vec<u8>>,
        reads: usize,
    }

    impl ResolvedImage for FakeImage {
        fn manifest(&self) -> &Manifest {
            &self.manifest
        }

        fn config_bytes(&self) -> &[u8] {
            &self.config
        }

        fn layer_reader(&mut self, digest: &str) -> Result<Box<dyn Read + '_>> {
            self.reads += 1;
            let data = self
                .layers
                .get(digest)
                .ok_or_else(|| Error::NotFound(digest.to_owned()))?;
            Ok(Box::new(Cursor::new(data.clone())))
        }
    }

    fn layer_with_file(path: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data).unwrap();
        builder.into_inner().unwrap()
    }

    fn descriptor(digest: &str, size: u64) -> Descriptor {
        Descriptor {
            media_type: None,
            digest: digest.to_owned(),
            size,
        }
    }

    fn two_layer_image() -> FakeImage {
        let base = layer_with_file("x", b"1");
        let top = layer_with_file("x", b"2");
        FakeImage {
            manifest: Manifest {
                config: descriptor("sha256:cfg", 2),
                layers: vec![
                    descriptor("sha256:base", base.len() as u64),
                    descriptor("sha256:top", top.len() as u64),
                ],
            },
            config: b"{\"config\":{\"Env\":[\"A=1\"]}}".to_vec(),
            layers: HashMap::from([
                ("sha256:base".to_owned(), base),
                ("sha256:top".to_owned(), top),
            ]),
            reads: 0,
        }
    }

    #[test]
    fn materialize_flattens_layers_in_manifest_order() {
        let temp = TempDir::new().unwrap();
        let store = Store::new(Layout::at(temp.path()));
        let mut image = two_layer_image();

        let id = store.materialize(&mut image).unwrap();

        let layout = Layout::at(temp.path());
        assert!(layout.image_dir(&id).join("config.json").exists());
        assert!(layout.image_dir(&id).join("manifest.json").exists());
        assert_eq!(fs::read(layout.rootfs_dir(&id).join("x")).unwrap(), b"2");
    }

    #[test]
    fn second_materialize_does_no_extraction() {
        let temp = TempDir::new().unwrap();
        let store = Store::new(Layout::at(temp.path()));

        let id = store.materialize(&mut two_layer_image()).unwrap();
        let sentinel = Layout::at(temp.path()).rootfs_dir(&id).join("sentinel");
        fs::write(&sentinel, b"kept").unwrap();

        let mut again = two_layer_image();
        let id2 = store.materialize(&mut again).unwrap();

        assert_eq!(id, id2);
        assert_eq!(again.reads, 0);
        assert!(sentinel.exists());
    }

    #[test]
    fn failed_materialize_is_retried_in_full() {
        let temp = TempDir::new().unwrap();
        let store = Store::new(Layout::at(temp.path()));

        // Second layer's blob is unavailable: extraction dies mid-way.
        let mut broken = two_layer_image();
        broken.layers.remove("sha256:top");
        assert!(store.materialize(&mut broken).is_err());

        // Partial state must not pass for a complete image.
        let id = ImageId::compute(b"sha256:cfg");
        assert!(!store.is_materialized(&id));
        assert!(!Layout::at(temp.path()).rootfs_dir(&id).exists());

        // The retry extracts everything again, not just the missing tail.
        let mut good = two_layer_image();
        let retried = store.materialize(&mut good).unwrap();
        assert_eq!(retried, id);
        assert_eq!(good.reads, 2);
        assert!(store.is_materialized(&id));
        assert_eq!(
            fs::read(Layout::at(temp.path()).rootfs_dir(&id).join("x")).unwrap(),
            b"2"
        );
    }

    #[test]
    fn load_config_reads_nested_execution_settings() {
        let temp = TempDir::new().unwrap();
        let store = Store::new(Layout::at(temp.path()));
        let id = store.materialize(&mut two_layer_image()).unwrap();

        let config = store.load_config(&id).unwrap();
        assert_eq!(config.env, Some(vec!["A=1".to_owned()]));

        let missing = ImageId::compute(b"never pulled");
        assert!(store.load_config(&missing).unwrap().env.is_none());
    }

    #[test]
    fn import_tarball_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let store = Store::new(Layout::at(temp.path()));
        let archive = temp.path().join("image.tar");
        fs::write(&archive, layer_with_file("rootfs/bin", b"elf")).unwrap();

        let id = store.import_tarball(&archive).unwrap();
        let id2 = store.import_tarball(&archive).unwrap();

        assert_eq!(id, id2);
        let layout = Layout::at(temp.path());
        assert!(layout.image_dir(&id).join("rootfs/bin").exists());
    }
}
