//! Container lifecycle: overlay assembly, process launch, and teardown.

use std::collections::hash_map::RandomState;
use std::fs;
use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use carton_oci::{ImageConfig, ImageId, Layout, Store};
use tracing::{debug, info};

use crate::{Error, Result, overlay};

/// Outcome of a container run.
#[derive(Debug)]
#[non_exhaustive]
pub struct RunReport {
    /// Identifier of the container that ran, for later teardown.
    pub container_id: String,
    /// Exit status of the containerized process.
    pub status: ExitStatus,
}

/// Runs commands inside overlay-mounted image root filesystems.
#[derive(Debug)]
pub struct Runtime {
    layout: Layout,
    store: Store,
}

impl Runtime {
    /// Creates a runtime over the given layout.
    pub fn new(layout: &Layout) -> Self {
        Self {
            layout: layout.clone(),
            store: Store::new(layout.clone()),
        }
    }

    /// Runs `command` in a fresh container over the image `id`.
    ///
    /// An empty `command` falls back to the image's configured
    /// entrypoint and cmd. The image's environment and working
    /// directory apply either way; explicit command arguments replace
    /// the configured command wholesale rather than appending to the
    /// entrypoint.
    ///
    /// The overlay stays mounted when this returns so the upper layer
    /// can be inspected; call [`Runtime::teardown`] to unmount and
    /// delete it.
    pub fn run(&self, id: &ImageId, command: &[String]) -> Result<RunReport> {
        let lower = self.layout.rootfs_dir(id);
        if !lower.is_dir() {
            return Err(Error::MissingRootfs(id.to_string()));
        }

        let config = self.store.load_config(id)?;
        let argv = resolve_argv(command, &config)?;

        let container_id = gen_id();
        let dir = self.layout.container_dir(&container_id);
        let upper = dir.join("upper");
        let work = dir.join("work");
        let merged = dir.join("merged");
        for layer in [&upper, &work, &merged] {
            fs::create_dir_all(layer)?;
        }

        overlay::mount_overlay(&lower, &upper, &work, &merged)?;
        info!(%container_id, image = %id, "container filesystem mounted");

        let mut child = Command::new(&argv[0]);
        child
            .args(&argv[1..])
            .current_dir(workdir_in(&merged, config.working_dir.as_deref()));
        for entry in config.env.iter().flatten() {
            if let Some((key, value)) = entry.split_once('=') {
                child.env(key, value);
            }
        }

        debug!(command = ?argv, "launching container process");
        let status = child.status()?;
        Ok(RunReport {
            container_id,
            status,
        })
    }

    /// Unmounts a container's overlay and deletes its directories.
    ///
    /// Safe to call on a container that was never mounted or is already
    /// torn down.
    pub fn teardown(&self, container_id: &str) -> Result<()> {
        let dir = self.layout.container_dir(container_id);
        let merged = dir.join("merged");
        if merged.is_dir() && overlay::is_mounted(&merged)? {
            overlay::unmount(&merged)?;
        }
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        debug!(%container_id, "container torn down");
        Ok(())
    }
}

/// Chooses the command line: caller arguments, else the image default.
fn resolve_argv(command: &[String], config: &ImageConfig) -> Result<Vec<String>> {
    let argv = if command.is_empty() {
        config.command()
    } else {
        command.to_vec()
    };
    if argv.is_empty() {
        return Err(Error::NoCommand);
    }
    Ok(argv)
}

/// Resolves the process working directory beneath the merged root.
fn workdir_in(merged: &Path, working_dir: Option<&str>) -> PathBuf {
    match working_dir {
        Some(dir) if !dir.is_empty() => merged.join(dir.trim_start_matches('/')),
        _ => merged.to_path_buf(),
    }
}

/// Generates a fresh 12-character container identifier.
///
/// Seeded from the pid, the current time, and `RandomState`'s per-process
/// randomness, so concurrent runs in one process stay distinct.
fn gen_id() -> String {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(std::process::id());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    hasher.write_u128(nanos);
    let hash = hasher.finish();
    format!("{hash:016x}")[..12].to_owned()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn generated_ids_are_short_hex_and_distinct() {
        let a = gen_id();
        let b = gen_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn workdir_stays_under_merged_root() {
        let merged = Path::new("/state/containers/abc/merged");
        assert_eq!(workdir_in(merged, None), merged);
        assert_eq!(workdir_in(merged, Some("")), merged);
        assert_eq!(workdir_in(merged, Some("/app")), merged.join("app"));
        assert_eq!(workdir_in(merged, Some("srv/www")), merged.join("srv/www"));
    }

    #[test]
    fn explicit_command_replaces_image_default() {
        let mut config = ImageConfig::default();
        config.entrypoint = Some(vec!["/docker-entrypoint.sh".into()]);
        config.cmd = Some(vec!["nginx".into()]);

        let explicit = vec!["/bin/sh".to_owned()];
        assert_eq!(resolve_argv(&explicit, &config).unwrap(), explicit);
        assert_eq!(
            resolve_argv(&[], &config).unwrap(),
            vec!["/docker-entrypoint.sh", "nginx"]
        );
        assert!(matches!(
            resolve_argv(&[], &ImageConfig::default()),
            Err(Error::NoCommand)
        ));
    }

    #[test]
    fn run_requires_a_materialized_rootfs() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::at(temp.path());
        let runtime = Runtime::new(&layout);
        let id = ImageId::compute(b"never pulled");

        let err = runtime.run(&id, &["/bin/true".to_owned()]).unwrap_err();
        assert!(matches!(err, Error::MissingRootfs(_)));
    }

    #[test]
    fn teardown_of_unknown_container_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::at(temp.path());
        let runtime = Runtime::new(&layout);

        runtime.teardown("000000000000").unwrap();
    }
}
