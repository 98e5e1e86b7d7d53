// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the ordered copy plan for a VM bundle and its external disks.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use dispatcher_config::BundleLayout;

use super::{CopyEntry, CopyError, CopyPlan};

/// What to do with a top-level entry of a walked tree.
enum Disposition {
    Copy,
    Skip,
    Rename(String),
}

fn path_str(path: &Path) -> Result<&str, CopyError> {
    path.to_str().ok_or_else(|| {
        CopyError::Protocol(format!("non-UTF-8 path {}", path.display()))
    })
}

/// A directory waiting to be read, with the canonical paths of every
/// directory above it, itself included.
struct Pending {
    dir: PathBuf,
    rel: String,
    ancestors: Vec<PathBuf>,
}

/// Breadth-first walk of `root`. Destinations are `dest_root` joined with
/// the entry's path relative to `root`, '/'-separated.
///
/// A directory that resolves to one of its own ancestors is a loop.
fn walk(
    root: &Path,
    dest_root: Option<&str>,
    top_level: impl Fn(&str) -> Disposition,
    plan: &mut CopyPlan,
) -> Result<(), CopyError> {
    let canonical_root =
        root.canonicalize().map_err(|e| CopyError::io(root, e))?;
    let mut queue = VecDeque::new();
    queue.push_back(Pending {
        dir: root.to_path_buf(),
        rel: String::new(),
        ancestors: vec![canonical_root.clone()],
    });

    while let Some(Pending { dir, rel: rel_dir, ancestors }) =
        queue.pop_front()
    {
        let mut entries = fs::read_dir(&dir)
            .map_err(|e| CopyError::io(&dir, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CopyError::io(&dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name();
            let name = path_str(Path::new(&name))?.to_string();

            let canonical =
                path.canonicalize().map_err(|e| CopyError::io(&path, e))?;
            if ancestors.contains(&canonical) {
                return Err(CopyError::SymlinkLoop(path));
            }
            if !canonical.starts_with(&canonical_root) {
                return Err(CopyError::EscapesRoot(path));
            }

            let mut rel = if rel_dir.is_empty() {
                name.clone()
            } else {
                format!("{rel_dir}/{name}")
            };
            if rel_dir.is_empty() {
                match top_level(&name) {
                    Disposition::Copy => {}
                    Disposition::Skip => continue,
                    Disposition::Rename(new) => rel = new,
                }
            }
            let dest = match dest_root {
                Some(prefix) => format!("{prefix}/{rel}"),
                None => rel.clone(),
            };

            let meta =
                fs::metadata(&path).map_err(|e| CopyError::io(&path, e))?;
            if meta.is_dir() {
                plan.dirs.push(CopyEntry { source: path.clone(), dest });
                let mut below = ancestors.clone();
                below.push(canonical);
                queue.push_back(Pending { dir: path, rel, ancestors: below });
            } else if meta.is_file() {
                plan.total_bytes += meta.len();
                plan.files.push(CopyEntry { source: path, dest });
            }
        }
    }
    Ok(())
}

/// Everything in a bundle that travels with the VM, with destinations
/// relative to the target bundle.
///
/// The config, its backup and the product log are rewritten or recreated by
/// the target and never sent. The statistics log is sent under its
/// migration name so the target can merge it.
pub fn bundle_entries(
    home: &Path,
    layout: &BundleLayout,
) -> Result<CopyPlan, CopyError> {
    let skip = [
        layout.config_file.clone(),
        layout.config_backup(),
        layout.log_file.clone(),
    ];
    let stats_name = layout.stats_migrate_name();
    let mut plan = CopyPlan::default();
    walk(
        home,
        None,
        |name| {
            if skip.iter().any(|s| s == name) {
                Disposition::Skip
            } else if name == layout.stats_file {
                Disposition::Rename(stats_name.clone())
            } else {
                Disposition::Copy
            }
        },
        &mut plan,
    )?;
    Ok(plan)
}

/// External disks that live in directories the target cannot see, with
/// absolute destinations.
///
/// Each directory in `non_shared_dirs` is recreated on the target, followed
/// by the disks of `disks` it holds. Disk images that are directories are
/// sent whole.
pub fn external_entries(
    disks: &[PathBuf],
    non_shared_dirs: &[PathBuf],
) -> Result<CopyPlan, CopyError> {
    let mut plan = CopyPlan::default();
    for dir in non_shared_dirs {
        let dest = path_str(dir)?.to_string();
        plan.dirs.push(CopyEntry { source: dir.clone(), dest });

        let held = disks.iter().filter(|d| d.parent() == Some(dir.as_path()));
        for disk in held {
            let dest = path_str(disk)?.to_string();
            let meta =
                fs::metadata(disk).map_err(|e| CopyError::io(disk, e))?;
            if meta.is_dir() {
                plan.dirs.push(CopyEntry {
                    source: disk.clone(),
                    dest: dest.clone(),
                });
                walk(disk, Some(&dest), |_| Disposition::Copy, &mut plan)?;
            } else {
                plan.total_bytes += meta.len();
                plan.files.push(CopyEntry { source: disk.clone(), dest });
            }
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BundleLayout {
        BundleLayout::default()
    }

    fn dests(entries: &[CopyEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.dest.as_str()).collect()
    }

    #[test]
    fn bundle_skips_config_and_renames_stats() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        let l = layout();
        fs::write(home.join(&l.config_file), "cfg").unwrap();
        fs::write(home.join(l.config_backup()), "old").unwrap();
        fs::write(home.join(&l.log_file), "log").unwrap();
        fs::write(home.join(&l.stats_file), "12345").unwrap();
        fs::write(home.join("disk.img"), [0u8; 100]).unwrap();
        fs::create_dir_all(home.join("snapshots/a")).unwrap();
        fs::write(home.join("snapshots/a/mem"), [0u8; 7]).unwrap();
        // Only top-level names are excluded.
        fs::write(home.join("snapshots").join(&l.log_file), "x").unwrap();

        let plan = bundle_entries(home, &l).unwrap();
        assert_eq!(dests(&plan.dirs), vec!["snapshots", "snapshots/a"]);
        assert_eq!(
            dests(&plan.files),
            vec![
                "disk.img",
                "vm.stats.migrate",
                "snapshots/vm.log",
                "snapshots/a/mem"
            ]
        );
        assert_eq!(plan.total_bytes, 100 + 5 + 1 + 7);
    }

    #[test]
    fn symlink_to_root_is_a_loop() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("vm.pvm");
        fs::create_dir_all(home.join("sub")).unwrap();
        std::os::unix::fs::symlink(&home, home.join("sub/back")).unwrap();
        assert!(matches!(
            bundle_entries(&home, &layout()),
            Err(CopyError::SymlinkLoop(_))
        ));
    }

    #[test]
    fn symlink_to_inner_ancestor_is_a_loop() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("vm.pvm");
        fs::create_dir_all(home.join("sub/deeper")).unwrap();
        fs::write(home.join("sub/deeper/data"), "x").unwrap();
        std::os::unix::fs::symlink(
            home.join("sub"),
            home.join("sub/deeper/back"),
        )
        .unwrap();
        assert!(matches!(
            bundle_entries(&home, &layout()),
            Err(CopyError::SymlinkLoop(p)) if p.ends_with("deeper/back")
        ));

        // A link to the directory holding it loops as well.
        let other = dir.path().join("other.pvm");
        fs::create_dir_all(other.join("sub")).unwrap();
        std::os::unix::fs::symlink(other.join("sub"), other.join("sub/back"))
            .unwrap();
        assert!(matches!(
            bundle_entries(&other, &layout()),
            Err(CopyError::SymlinkLoop(_))
        ));
    }

    #[test]
    fn symlink_to_sibling_is_not_a_loop() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("vm.pvm");
        fs::create_dir_all(home.join("a")).unwrap();
        fs::write(home.join("a/f"), [0u8; 2]).unwrap();
        std::os::unix::fs::symlink(home.join("a"), home.join("b")).unwrap();
        let plan = bundle_entries(&home, &layout()).unwrap();
        assert_eq!(dests(&plan.files), vec!["a/f", "b/f"]);
    }

    #[test]
    fn symlink_out_of_root_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("vm.pvm");
        fs::create_dir_all(&home).unwrap();
        fs::write(dir.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret"), home.join("s"))
            .unwrap();
        assert!(matches!(
            bundle_entries(&home, &layout()),
            Err(CopyError::EscapesRoot(_))
        ));
    }

    #[test]
    fn external_disks_keep_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ext = dir.path().join("ext");
        fs::create_dir_all(ext.join("b.hdd")).unwrap();
        fs::write(ext.join("a.img"), [0u8; 3]).unwrap();
        fs::write(ext.join("b.hdd/data"), [0u8; 4]).unwrap();
        fs::write(ext.join("unrelated"), [0u8; 50]).unwrap();

        let disks = vec![ext.join("a.img"), ext.join("b.hdd")];
        let plan = external_entries(&disks, &[ext.clone()]).unwrap();
        let ext_s = ext.to_str().unwrap();
        assert_eq!(
            dests(&plan.dirs),
            vec![ext_s.to_string(), format!("{ext_s}/b.hdd")]
        );
        assert_eq!(
            dests(&plan.files),
            vec![format!("{ext_s}/a.img"), format!("{ext_s}/b.hdd/data")]
        );
        assert_eq!(plan.total_bytes, 7);

        assert!(external_entries(&disks, &[]).unwrap().is_empty());
    }
}
