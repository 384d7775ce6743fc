//! Path sandboxing, identity resolution and executable discovery

use crate::error::{Error, Result};
use nix::unistd::{Gid, Group, Uid, User, getgid, getuid};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.`, fold `..` onto its parent
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join a caller path under `root` without letting absolute paths escape it
fn join_under(root: &Path, path: &str) -> PathBuf {
    clean_path(&root.join(path.trim_start_matches('/')))
}

/// Validate and canonicalize the root directory
pub fn resolve_root(root: &Path) -> Result<PathBuf> {
    if root.as_os_str().is_empty() {
        return Err(Error::bad_parameter("kernel root is empty"));
    }
    let canonical = fs::canonicalize(root)
        .map_err(|e| Error::io_context(format!("kernel root {}", root.display()), e))?;
    if !canonical.is_dir() {
        return Err(Error::bad_parameter(format!(
            "kernel root {} is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Resolve an executable path under `root`
///
/// The lexically cleaned path must stay under the root, and so must its
/// canonical form once symlinks are followed. The target must be a regular
/// file. A missing file surfaces as an I/O error.
pub fn resolve_executable(root: &Path, path: &str) -> Result<PathBuf> {
    if path.trim().is_empty() {
        return Err(Error::bad_parameter("executable path is empty"));
    }
    let joined = join_under(root, path);
    if !joined.starts_with(root) || joined == root {
        return Err(Error::bad_parameter(format!(
            "path {path:?} is outside {}",
            root.display()
        )));
    }

    let canonical = fs::canonicalize(&joined)
        .map_err(|e| Error::io_context(format!("executable {}", joined.display()), e))?;
    if !canonical.starts_with(root) {
        return Err(Error::bad_parameter(format!(
            "path {path:?} resolves outside {}",
            root.display()
        )));
    }

    let metadata = fs::metadata(&canonical)
        .map_err(|e| Error::io_context(format!("executable {}", canonical.display()), e))?;
    if !metadata.is_file() {
        return Err(Error::bad_parameter(format!(
            "{} is not a regular file",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Resolve the working directory for a process
///
/// Empty means the root. Relative paths are joined under the root and must
/// stay inside it; absolute paths are taken as given.
pub fn resolve_cwd(root: &Path, cwd: &str) -> Result<PathBuf> {
    let dir = if cwd.is_empty() {
        root.to_path_buf()
    } else if Path::new(cwd).is_absolute() {
        clean_path(Path::new(cwd))
    } else {
        let joined = join_under(root, cwd);
        if !joined.starts_with(root) {
            return Err(Error::bad_parameter(format!(
                "working directory {cwd:?} is outside {}",
                root.display()
            )));
        }
        joined
    };

    if !dir.is_dir() {
        return Err(Error::bad_parameter(format!(
            "working directory {} is not a directory",
            dir.display()
        )));
    }
    Ok(dir)
}

/// Resolve a user name or numeric uid; empty means the current uid
pub fn resolve_user(user: &str) -> Result<Uid> {
    if user.is_empty() {
        return Ok(getuid());
    }
    let found = match user.parse::<u32>() {
        Ok(raw) => User::from_uid(Uid::from_raw(raw))?,
        Err(_) => User::from_name(user)?,
    };
    found
        .map(|u| u.uid)
        .ok_or_else(|| Error::bad_parameter(format!("unknown user {user:?}")))
}

/// Resolve a group name or numeric gid; empty means the current gid
pub fn resolve_group(group: &str) -> Result<Gid> {
    if group.is_empty() {
        return Ok(getgid());
    }
    let found = match group.parse::<u32>() {
        Ok(raw) => Group::from_gid(Gid::from_raw(raw))?,
        Err(_) => Group::from_name(group)?,
    };
    found
        .map(|g| g.gid)
        .ok_or_else(|| Error::bad_parameter(format!("unknown group {group:?}")))
}

fn is_executable(metadata: &fs::Metadata) -> bool {
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

/// List root-relative paths of executable regular files
///
/// Symlinks are not followed. Results are sorted.
pub fn find_executables(root: &Path, recursive: bool) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::io_context(format!("read directory {}", dir.display()), e))?;
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let path = entry.path();
            if metadata.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if is_executable(&metadata) {
                if let Ok(relative) = path.strip_prefix(root) {
                    found.push(relative.to_string_lossy().into_owned());
                }
            }
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn make_executable(path: &Path) {
        File::create(path).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/a/../../etc")), PathBuf::from("/etc"));
        assert_eq!(clean_path(Path::new("a/../../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_resolve_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_root(dir.path()).is_ok());
        assert!(resolve_root(Path::new("")).unwrap_err().is_bad_parameter());
        assert!(matches!(
            resolve_root(&dir.path().join("missing")),
            Err(Error::Io(_))
        ));
        let file = dir.path().join("file");
        File::create(&file).unwrap();
        assert!(resolve_root(&file).unwrap_err().is_bad_parameter());
    }

    #[test]
    fn test_resolve_executable_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_root(dir.path()).unwrap();
        make_executable(&root.join("tool"));
        fs::create_dir(root.join("sub")).unwrap();

        assert_eq!(resolve_executable(&root, "tool").unwrap(), root.join("tool"));
        assert_eq!(resolve_executable(&root, "/tool").unwrap(), root.join("tool"));
        assert!(resolve_executable(&root, "../etc/passwd").unwrap_err().is_bad_parameter());
        assert!(resolve_executable(&root, "sub").unwrap_err().is_bad_parameter());
        assert!(resolve_executable(&root, "").unwrap_err().is_bad_parameter());
        assert!(matches!(resolve_executable(&root, "nope"), Err(Error::Io(_))));
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let outside = tempfile::tempdir().unwrap();
        make_executable(&outside.path().join("evil"));
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_root(dir.path()).unwrap();
        std::os::unix::fs::symlink(outside.path().join("evil"), root.join("link")).unwrap();

        assert!(resolve_executable(&root, "link").unwrap_err().is_bad_parameter());
    }

    #[test]
    fn test_resolve_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_root(dir.path()).unwrap();
        fs::create_dir(root.join("data")).unwrap();

        assert_eq!(resolve_cwd(&root, "").unwrap(), root);
        assert_eq!(resolve_cwd(&root, "data").unwrap(), root.join("data"));
        assert!(resolve_cwd(&root, "../..").unwrap_err().is_bad_parameter());
        assert!(resolve_cwd(&root, "missing").unwrap_err().is_bad_parameter());
        assert_eq!(resolve_cwd(&root, "/").unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn test_resolve_identity() {
        assert_eq!(resolve_user("").unwrap(), getuid());
        assert_eq!(resolve_group("").unwrap(), getgid());
        assert_eq!(resolve_user("0").unwrap(), Uid::from_raw(0));
        assert_eq!(resolve_user("root").unwrap(), Uid::from_raw(0));
        assert!(
            resolve_user("no-such-user-for-kernel-tests")
                .unwrap_err()
                .is_bad_parameter()
        );
        assert!(
            resolve_group("no-such-group-for-kernel-tests")
                .unwrap_err()
                .is_bad_parameter()
        );
    }

    #[test]
    fn test_find_executables() {
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_root(dir.path()).unwrap();
        make_executable(&root.join("b-tool"));
        make_executable(&root.join("a-tool"));
        File::create(root.join("readme.txt")).unwrap();
        fs::create_dir(root.join("nested")).unwrap();
        make_executable(&root.join("nested").join("inner"));

        assert_eq!(find_executables(&root, false).unwrap(), vec!["a-tool", "b-tool"]);
        assert_eq!(
            find_executables(&root, true).unwrap(),
            vec!["a-tool", "b-tool", "nested/inner"]
        );
    }
}
