//! Canonical repository paths
//!
//! Paths are absolute, `/`-separated, without empty, `.` or `..`
//! components and without a trailing slash. The root is `/`.

use crate::error::{FsError, Result};

/// Canonicalize a repository path; a missing leading slash is added.
pub fn canonicalize(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/') {
        match component {
            "" => continue,
            "." | ".." => return Err(FsError::InvalidPath(path.to_string())),
            name => {
                if name.contains('\0') {
                    return Err(FsError::InvalidPath(path.to_string()));
                }
                out.push('/');
                out.push_str(name);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Components of a canonical path; the root has none
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split a canonical path into parent and final name; `None` for the root
pub fn split(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// `ancestor` is `path` itself or one of its parents
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Validate a single directory entry name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::InvalidPath(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("").unwrap(), "/");
        assert_eq!(canonicalize("/").unwrap(), "/");
        assert_eq!(canonicalize("A//foo/").unwrap(), "/A/foo");
        assert_eq!(canonicalize("/A/b c").unwrap(), "/A/b c");
        assert!(canonicalize("/A/../B").is_err());
        assert!(canonicalize("/./B").is_err());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split("/"), None);
        assert_eq!(split("/A"), Some(("/", "A")));
        assert_eq!(split("/A/foo"), Some(("/A", "foo")));
        assert_eq!(join("/", "A"), "/A");
        assert_eq!(join("/A", "foo"), "/A/foo");
        assert_eq!(components("/").count(), 0);
        assert_eq!(components("/A/foo").collect::<Vec<_>>(), vec!["A", "foo"]);
    }

    #[test]
    fn test_is_ancestor() {
        assert!(is_ancestor("/", "/A"));
        assert!(is_ancestor("/A", "/A"));
        assert!(is_ancestor("/A", "/A/foo"));
        assert!(!is_ancestor("/A", "/AB"));
        assert!(!is_ancestor("/A/foo", "/A"));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("foo").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
    }
}
