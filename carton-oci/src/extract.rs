//! Tar archive extraction with path containment.
//!
//! Materializes directory, regular-file, and symlink entries beneath a
//! target directory. Every destination path is verified to stay inside
//! the target; an escaping entry aborts the whole extraction with
//! [`Error::PathEscape`]. Other entry types (devices, hardlinks, fifos)
//! are skipped.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::debug;

use crate::{Error, Result};

/// Extracts a tar archive file, gunzipping when the name ends in `.gz`
/// or `.tgz`.
pub fn extract_tar_file(archive: &Path, target: &Path) -> Result<()> {
    let file = BufReader::new(File::open(archive)?);
    if archive
        .extension()
        .is_some_and(|ext| ext == "gz" || ext == "tgz")
    {
        extract_tar(GzDecoder::new(file), target)
    } else {
        extract_tar(file, target)
    }
}

/// Extracts a tar byte stream into `target`.
///
/// Entries already written before a failure are left in place; nothing
/// is ever written outside `target`.
pub fn extract_tar(reader: impl Read, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let dest = contained_join(target, &rel)?;
        let mode = entry.header().mode().unwrap_or(0o755) & 0o7777;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&dest)?;
                io::copy(&mut entry, &mut out)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let link = entry.link_name()?.ok_or_else(|| {
                    Error::Store(format!("symlink entry without target: {}", rel.display()))
                })?;
                // A later layer may replace an earlier entry at this path.
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)?;
                }
                symlink(&link, &dest)?;
            }
            other => {
                debug!(entry = %rel.display(), ?other, "skipping unsupported entry type");
            }
        }
    }

    Ok(())
}

/// Joins `rel` onto `root` lexically and verifies containment.
///
/// `.` and `..` components are resolved without touching the filesystem,
/// then the result is checked component-wise against `root`, so a
/// sibling of `root` whose name shares a prefix does not pass. Absolute
/// entry paths are rejected outright.
fn contained_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut dest = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => dest.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                dest.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape {
                    entry: rel.to_path_buf(),
                });
            }
        }
    }

    if dest.starts_with(root) {
        Ok(dest)
    } else {
        Err(Error::PathEscape {
            entry: rel.to_path_buf(),
        })
    }
}
