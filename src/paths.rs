//! Path helpers shared by the producers, the apply engine and the CRUD layer.
//!
//! Change events carry root-relative, slash-separated paths with a leading
//! `/`. These helpers convert between that form and absolute filesystem
//! paths, and guarantee a resolved path never leaves its root.

use crate::error::{MirrorError, Result};
use std::path::{Component, Path, PathBuf};

/// Rewrites an absolute path under `root` into the `/a/b` event form.
///
/// Returns `None` if `path` is not under `root` or is the root itself.
pub fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                out.push('/');
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Returns `true` if any component of the root-relative `path` is dot-prefixed.
pub fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part.starts_with('.') && part != "." && part != "..")
}

/// Lexically resolves a root-relative path against `root`.
///
/// `.` segments are dropped and `..` pops one level; popping past the root is
/// a [`MirrorError::PathEscape`]. A path that resolves to the root itself is
/// [`MirrorError::EmptyPath`]. Nothing on disk is consulted.
pub fn join_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(MirrorError::PathEscape {
                        path: relative.to_string(),
                    });
                }
            }
            other => {
                // A drive prefix or similar would make the join absolute.
                if Path::new(other)
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
                {
                    return Err(MirrorError::PathEscape {
                        path: relative.to_string(),
                    });
                }
                parts.push(other);
            }
        }
    }
    if parts.is_empty() {
        return Err(MirrorError::EmptyPath);
    }
    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

/// Checks that the deepest existing ancestor of `candidate` still lives
/// inside `canonical_root` once symlinks are followed.
///
/// `canonical_root` must already be canonicalized.
pub fn ensure_contained(canonical_root: &Path, candidate: &Path, relative: &str) -> Result<()> {
    let mut ancestor = candidate;
    loop {
        match ancestor.canonicalize() {
            Ok(real) => {
                return if real.starts_with(canonical_root) {
                    Ok(())
                } else {
                    Err(MirrorError::PathEscape {
                        path: relative.to_string(),
                    })
                };
            }
            Err(_) => match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => {
                    return Err(MirrorError::PathEscape {
                        path: relative.to_string(),
                    })
                }
            },
        }
    }
}

/// Full containment check: lexical resolution followed by a symlink check.
pub fn resolve_within(canonical_root: &Path, relative: &str) -> Result<PathBuf> {
    let resolved = join_within(canonical_root, relative)?;
    ensure_contained(canonical_root, &resolved, relative)?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_form_has_leading_slash() {
        let root = Path::new("/srv/drop");
        assert_eq!(
            to_relative(root, Path::new("/srv/drop/notes/todo.txt")).as_deref(),
            Some("/notes/todo.txt")
        );
        assert_eq!(to_relative(root, Path::new("/srv/drop")), None);
        assert_eq!(to_relative(root, Path::new("/srv/other/x")), None);
    }

    #[test]
    fn hidden_components() {
        assert!(is_hidden("/.git/config"));
        assert!(is_hidden("/notes/.todo.txt.swp"));
        assert!(!is_hidden("/notes/todo.txt"));
    }

    #[test]
    fn join_rejects_escape() {
        let root = Path::new("/srv/drop");
        assert!(matches!(
            join_within(root, "/../etc/passwd"),
            Err(MirrorError::PathEscape { .. })
        ));
        assert!(matches!(
            join_within(root, "/a/../../b"),
            Err(MirrorError::PathEscape { .. })
        ));
        assert!(matches!(join_within(root, "/"), Err(MirrorError::EmptyPath)));
        assert!(matches!(join_within(root, "/a/.."), Err(MirrorError::EmptyPath)));
    }

    #[test]
    fn join_normalizes_inside_root() {
        let root = Path::new("/srv/drop");
        assert_eq!(
            join_within(root, "/a/./b/../c.txt").unwrap(),
            PathBuf::from("/srv/drop/a/c.txt")
        );
        assert_eq!(
            join_within(root, "notes/todo.txt").unwrap(),
            PathBuf::from("/srv/drop/notes/todo.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        assert!(matches!(
            resolve_within(&root, "/link/secret.txt"),
            Err(MirrorError::PathEscape { .. })
        ));
        assert!(resolve_within(&root, "/missing/dir/file.txt").is_ok());
    }
}
