//! overlayfs mount management.
//!
//! The image root filesystem is the read-only lower layer; container
//! writes land in a per-container upper layer. Mounting is idempotent:
//! an already-mounted merged directory is left alone, so a crashed run
//! can be retried without an `EBUSY` failure.

use std::fs;
use std::io;
use std::path::Path;

use nix::mount::{MsFlags, mount, umount};
use tracing::debug;

use crate::{Error, Result};

/// Mounts an overlay at `merged` unless one is already there.
pub(crate) fn mount_overlay(lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    if is_mounted(merged)? {
        debug!(merged = %merged.display(), "overlay already mounted");
        return Ok(());
    }

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|errno| Error::Mount {
        op: "mount",
        merged: merged.to_path_buf(),
        source: io::Error::from(errno),
    })
}

/// Unmounts the overlay at `merged`.
pub(crate) fn unmount(merged: &Path) -> Result<()> {
    umount(merged).map_err(|errno| Error::Mount {
        op: "umount",
        merged: merged.to_path_buf(),
        source: io::Error::from(errno),
    })
}

/// Returns `true` if `target` appears as a mount point in `/proc/mounts`.
pub(crate) fn is_mounted(target: &Path) -> Result<bool> {
    let mounts = fs::read_to_string("/proc/mounts")?;
    Ok(lists_mount_point(&mounts, target))
}

/// Scans mount-table text for `target` in the mount-point column.
fn lists_mount_point(mounts: &str, target: &Path) -> bool {
    let needle = target.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|point| point == needle)
}
