//! Lexical path helpers shared by the planner, cache, and scheduler.
//!
//! None of these functions touch the filesystem; symlinks are not resolved.

use std::path::{Component, Path, PathBuf};

/// Normalizes a path lexically by dropping `.` components and folding `..`.
///
/// A leading `..` on a relative path is kept, since there is nothing to fold it into.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Returns `true` if one path is equal to or nested inside the other.
///
/// Two mutators whose subtrees overlap must never run at the same time.
pub fn subtrees_overlap(a: &Path, b: &Path) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    a.starts_with(&b) || b.starts_with(&a)
}

/// Resolves `path` against `base` unless it is already absolute.
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn overlap_is_component_wise() {
        assert!(subtrees_overlap(Path::new("/out/App.app"), Path::new("/out/App.app/Info.plist")));
        assert!(subtrees_overlap(Path::new("/out/App.app/"), Path::new("/out/App.app")));
        assert!(!subtrees_overlap(Path::new("/out/App.app"), Path::new("/out/App.appex")));
        assert!(!subtrees_overlap(Path::new("/out/a"), Path::new("/out/b")));
    }

    #[test]
    fn absolutize_relative_against_base() {
        assert_eq!(
            absolutize(Path::new("/work"), Path::new("src/../main.c")),
            PathBuf::from("/work/main.c")
        );
        assert_eq!(absolutize(Path::new("/work"), Path::new("/abs")), PathBuf::from("/abs"));
    }
}
