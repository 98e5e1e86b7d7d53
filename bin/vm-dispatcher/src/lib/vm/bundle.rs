// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem operations on VM bundles.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use uuid::Uuid;

const PROBE_SUFFIX_LEN: usize = 6;

/// Empty marker files a source drops next to a VM's data so the target can
/// tell whether it sees the same storage.
///
/// Every probe created through this set is removed when it is dropped.
pub struct ProbeFiles {
    log: Logger,
    paths: Vec<PathBuf>,
}

impl ProbeFiles {
    pub fn new(log: &Logger) -> Self {
        ProbeFiles { log: log.clone(), paths: Vec::new() }
    }

    /// Creates `<vm_uuid>.XXXXXX` in `dir` and returns its full path.
    pub fn create(&mut self, dir: &Path, vm_uuid: Uuid) -> io::Result<PathBuf> {
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(PROBE_SUFFIX_LEN)
                .map(char::from)
                .collect();
            let path = dir.join(format!("{vm_uuid}.{suffix}"));
            match OpenOptions::new().write(true).create_new(true).open(&path)
            {
                Ok(_) => {
                    self.paths.push(path.clone());
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Best-effort removal of every probe created so far.
    pub fn remove_all(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(self.log, "failed to remove probe file";
                          "path" => %path.display(), "error" => %e);
                }
            }
        }
    }
}

impl Drop for ProbeFiles {
    fn drop(&mut self) {
        self.remove_all();
    }
}

/// The permission bits of `path`.
pub fn permissions(path: &Path) -> io::Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

pub fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
pub fn free_space(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs is plain old data, so all-zeroes is a valid value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Walks up from `path` to the nearest ancestor that exists.
pub fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// Total size of the regular files below `path`. Symlinks are not followed.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += dir_size(&entry?.path())?;
    }
    Ok(total)
}

/// Removes a bundle directory and everything in it. A missing bundle is not
/// an error.
pub fn remove_bundle(log: &Logger, path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!(log, "removed bundle"; "path" => %path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes the given files, returning the ones that could not be removed.
pub fn remove_files(log: &Logger, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut failed = Vec::new();
    for path in paths {
        let res = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match res {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(log, "failed to remove file";
                      "path" => %path.display(), "error" => %e);
                failed.push(path.clone());
            }
        }
    }
    failed
}

/// Contents of the pointer file a suspended VM keeps next to its config.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct SavedState {
    /// File name of the memory image.
    pub memory_file: String,
    /// Directory holding the memory image. `None` means the bundle itself.
    #[serde(default)]
    pub memory_dir: Option<PathBuf>,
}

impl SavedState {
    pub fn load(path: &Path) -> io::Result<SavedState> {
        let text = fs::read_to_string(path)?;
        ron::de::from_str(&text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = ron::ser::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }

    /// Absolute path of the memory image for a VM whose bundle is `home`.
    pub fn memory_image(&self, home: &Path) -> PathBuf {
        self.memory_dir.as_deref().unwrap_or(home).join(&self.memory_file)
    }
}

/// Writes `<sav><suffix>`, a copy of the saved-state pointer at `sav` that
/// points at `memory_dir` instead, and returns its path.
pub fn rewrite_saved_state(
    sav: &Path,
    suffix: &str,
    memory_dir: Option<&Path>,
) -> io::Result<PathBuf> {
    let mut state = SavedState::load(sav)?;
    state.memory_dir = memory_dir.map(Path::to_path_buf);
    let mut name = sav.as_os_str().to_owned();
    name.push(suffix);
    let copy = PathBuf::from(name);
    state.save(&copy)?;
    Ok(copy)
}

/// Replaces `sav` by `replacement`, keeping the original at `backup`.
pub fn swap_in_saved_state(
    sav: &Path,
    replacement: &Path,
    backup: &Path,
) -> io::Result<()> {
    fs::rename(sav, backup)?;
    if let Err(e) = fs::rename(replacement, sav) {
        let _ = fs::rename(backup, sav);
        return Err(e);
    }
    Ok(())
}
