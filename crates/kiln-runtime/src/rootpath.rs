//! Resolution of container paths against a root filesystem on the host.
//!
//! Every component is resolved in turn with `lstat`; symbolic links are
//! followed with the root as `/`, so an absolute link target stays inside the
//! root. A `..` that would climb above the root is an error rather than being
//! clamped, because a path that tries to leave the root is a broken step
//! definition, not something to paper over.

use crate::RuntimeError;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Maximum symlinks followed while resolving one path, matching Linux's
/// `MAXSYMLINKS`.
pub const MAX_SYMLINKS: usize = 255;

fn split(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}

/// Resolve `unsafe_path` (interpreted as an absolute path inside the
/// container) to a host path below `root`.
///
/// Components that do not exist yet are appended literally, so the result can
/// be used to create missing directories.
pub fn resolve_in_root(root: &Path, unsafe_path: &str) -> Result<PathBuf, RuntimeError> {
    let escapes = || RuntimeError::PathEscapes {
        path: unsafe_path.to_owned(),
        root: root.to_path_buf(),
    };

    let mut resolved = PathBuf::new();
    let mut pending = split(Path::new(unsafe_path));
    let mut followed = 0usize;

    while let Some(component) = pending.pop_front() {
        if component == ".." {
            if !resolved.pop() {
                return Err(escapes());
            }
            continue;
        }

        let candidate = root.join(&resolved).join(&component);
        let meta = match std::fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                resolved.push(&component);
                continue;
            }
            Err(e) => return Err(RuntimeError::Io(e)),
        };

        if !meta.file_type().is_symlink() {
            resolved.push(&component);
            continue;
        }

        followed += 1;
        if followed > MAX_SYMLINKS {
            return Err(RuntimeError::SymlinkLoop(unsafe_path.to_owned()));
        }

        let target = std::fs::read_link(&candidate)?;
        if target.is_absolute() {
            resolved.clear();
        }
        let mut expanded = split(&target);
        expanded.extend(pending);
        pending = expanded;
    }

    Ok(root.join(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        std::fs::create_dir_all(dir.path().join("work/src")).unwrap();
        dir
    }

    #[test]
    fn plain_paths_resolve_under_root() {
        let root = rootfs();
        let r = root.path();
        assert_eq!(resolve_in_root(r, "/").unwrap(), r.to_path_buf());
        assert_eq!(resolve_in_root(r, "").unwrap(), r.to_path_buf());
        assert_eq!(resolve_in_root(r, "/usr/lib").unwrap(), r.join("usr/lib"));
        assert_eq!(resolve_in_root(r, "work/./src").unwrap(), r.join("work/src"));
    }

    #[test]
    fn missing_components_are_kept() {
        let root = rootfs();
        assert_eq!(
            resolve_in_root(root.path(), "/new/dir").unwrap(),
            root.path().join("new/dir")
        );
    }

    #[test]
    fn dotdot_inside_root_is_fine() {
        let root = rootfs();
        assert_eq!(
            resolve_in_root(root.path(), "/work/src/../../usr").unwrap(),
            root.path().join("usr")
        );
    }

    #[test]
    fn dotdot_above_root_is_rejected() {
        let root = rootfs();
        assert!(matches!(
            resolve_in_root(root.path(), "/../etc"),
            Err(RuntimeError::PathEscapes { .. })
        ));
        assert!(matches!(
            resolve_in_root(root.path(), "/work/../../.."),
            Err(RuntimeError::PathEscapes { .. })
        ));
    }

    #[test]
    fn absolute_symlink_is_rerooted() {
        let root = rootfs();
        symlink("/usr/lib", root.path().join("lib")).unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "/lib").unwrap(),
            root.path().join("usr/lib")
        );
    }

    #[test]
    fn relative_symlink_is_followed() {
        let root = rootfs();
        symlink("../usr", root.path().join("work/up")).unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "/work/up/lib").unwrap(),
            root.path().join("usr/lib")
        );
    }

    #[test]
    fn escaping_relative_symlink_is_rejected() {
        let root = rootfs();
        symlink("../../../../../../../tmp", root.path().join("work/out")).unwrap();
        assert!(matches!(
            resolve_in_root(root.path(), "/work/out"),
            Err(RuntimeError::PathEscapes { .. })
        ));
    }

    #[test]
    fn symlink_loop_is_rejected() {
        let root = rootfs();
        symlink("/b", root.path().join("a")).unwrap();
        symlink("/a", root.path().join("b")).unwrap();
        assert!(matches!(
            resolve_in_root(root.path(), "/a"),
            Err(RuntimeError::SymlinkLoop(_))
        ));
    }
}
