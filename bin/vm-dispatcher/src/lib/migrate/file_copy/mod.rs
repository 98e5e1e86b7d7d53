// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming copy of a VM's files to a peer dispatcher.
//!
//! The sender walks an ordered [`CopyPlan`]: one FirstRequest announcing the
//! byte total, then every directory, then every file followed by its data
//! chunks, then Finish. Requests are acknowledged one at a time; chunks are
//! not. The receiver replays the same sequence below its roots and reports
//! the entries it created so the caller can decide what to roll back.

use std::path::{Path, PathBuf};

use dispatcher_api_types::ErrorCode;
use thiserror::Error;

use super::MigrateError;

pub mod enumerate;
pub mod source;
pub mod target;

/// Size of the data chunks files are sent in.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Bytes the sender lets queue up in the connection before it waits.
pub(crate) const QUEUE_HIGH_WATER: usize = 4 * CHUNK_SIZE;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("file copy cancelled")]
    Cancelled,

    #[error(transparent)]
    Migrate(MigrateError),

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("symbolic link {0} leads back to the copy root")]
    SymlinkLoop(PathBuf),

    #[error("{0} is outside the copy root")]
    EscapesRoot(PathBuf),

    #[error("peer rejected the copy: {0}")]
    Rejected(String),

    #[error("unexpected file copy message: {0}")]
    Protocol(String),

    #[error("{0} changed size during the copy")]
    SizeMismatch(PathBuf),
}

impl From<MigrateError> for CopyError {
    fn from(err: MigrateError) -> Self {
        match err {
            MigrateError::Cancelled => CopyError::Cancelled,
            other => CopyError::Migrate(other),
        }
    }
}

impl CopyError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        CopyError::Io(path.to_path_buf(), err)
    }

    /// The code sent to the peer when this error aborts a receive.
    pub(crate) fn code(&self) -> ErrorCode {
        match self {
            CopyError::Cancelled => ErrorCode::Cancelled,
            CopyError::Migrate(e) => e.code(),
            _ => ErrorCode::InternalMigrationError,
        }
    }
}

/// One entry to copy: where it is here and what the peer calls it.
///
/// Relative destinations are resolved against the receiver's bundle;
/// absolute ones must fall inside one of its external roots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyEntry {
    pub source: PathBuf,
    pub dest: String,
}

/// Ordered directory and file lists plus the bytes they hold.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyPlan {
    pub dirs: Vec<CopyEntry>,
    pub files: Vec<CopyEntry>,
    pub total_bytes: u64,
}

impl CopyPlan {
    pub fn extend(&mut self, other: CopyPlan) {
        self.dirs.extend(other.dirs);
        self.files.extend(other.files);
        self.total_bytes += other.total_bytes;
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    /// Drops the files read from any of `sources`.
    pub fn exclude(&mut self, sources: &[PathBuf]) {
        let total = &mut self.total_bytes;
        self.files.retain(|f| {
            if !sources.contains(&f.source) {
                return true;
            }
            let len = std::fs::metadata(&f.source).map_or(0, |m| m.len());
            *total -= len.min(*total);
            false
        });
    }

    /// Sends `replacement` wherever `original` would have been sent, adding
    /// it under `dest` if `original` was not in the plan.
    pub fn substitute(
        &mut self,
        original: &Path,
        replacement: &Path,
        dest: &str,
    ) -> Result<(), CopyError> {
        let new_size = std::fs::metadata(replacement)
            .map_err(|e| CopyError::io(replacement, e))?
            .len();
        match self.files.iter_mut().find(|f| f.source == original) {
            Some(entry) => {
                let old_size = std::fs::metadata(original)
                    .map(|m| m.len())
                    .unwrap_or(0);
                self.total_bytes -= old_size.min(self.total_bytes);
                entry.source = replacement.to_path_buf();
            }
            None => self.files.push(CopyEntry {
                source: replacement.to_path_buf(),
                dest: dest.to_string(),
            }),
        }
        self.total_bytes += new_size;
        Ok(())
    }
}

/// Tracks integer percentages so progress is only reported on change.
pub(crate) struct Progress {
    total: u64,
    done: u64,
    last: Option<u8>,
}

impl Progress {
    pub(crate) fn new(total: u64) -> Self {
        Progress { total, done: 0, last: None }
    }

    /// Adds `bytes` and returns the new percentage if it changed.
    pub(crate) fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.done += bytes;
        let pct = if self.total == 0 {
            100
        } else {
            (self.done.min(self.total) * 100 / self.total) as u8
        };
        if self.last == Some(pct) {
            return None;
        }
        self.last = Some(pct);
        Some(pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_reports_only_changes() {
        let mut p = Progress::new(1000);
        assert_eq!(p.advance(0), Some(0));
        assert_eq!(p.advance(5), None);
        assert_eq!(p.advance(5), Some(1));
        assert_eq!(p.advance(990), Some(100));
        assert_eq!(p.advance(10), None);

        let mut empty = Progress::new(0);
        assert_eq!(empty.advance(0), Some(100));
    }

    #[test]
    fn substitute_replaces_or_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sav = dir.path().join("vm.sav");
        let copy = dir.path().join("vm.sav.migrate");
        std::fs::write(&sav, [0u8; 10]).unwrap();
        std::fs::write(&copy, [0u8; 4]).unwrap();

        let mut plan = CopyPlan {
            dirs: vec![],
            files: vec![CopyEntry {
                source: sav.clone(),
                dest: "vm.sav".into(),
            }],
            total_bytes: 10,
        };
        plan.substitute(&sav, &copy, "vm.sav").unwrap();
        assert_eq!(plan.files.len(), 1);
        assert_eq!(plan.files[0].source, copy);
        assert_eq!(plan.files[0].dest, "vm.sav");
        assert_eq!(plan.total_bytes, 4);

        let mut empty = CopyPlan::default();
        empty.substitute(&sav, &copy, "vm.sav").unwrap();
        assert_eq!(empty.files[0].dest, "vm.sav");
        assert_eq!(empty.total_bytes, 4);
    }
}
