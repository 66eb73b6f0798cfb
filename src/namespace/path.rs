use crate::{Result, ShardError};

pub const SEPARATOR: char = '/';

/// Split an absolute path into its segments. `"/"` yields no segments.
/// Repeated and trailing separators are ignored.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with(SEPARATOR) {
        return Err(ShardError::InvalidPathFormat(path.to_string()));
    }
    let parts: Vec<&str> = path.split(SEPARATOR).filter(|s| !s.is_empty()).collect();
    for part in &parts {
        if *part == "." || *part == ".." {
            return Err(ShardError::InvalidPathFormat(path.to_string()));
        }
    }
    Ok(parts)
}

/// Canonical form: leading separator, no repeated or trailing separators.
pub fn normalize(path: &str) -> Result<String> {
    let parts = segments(path)?;
    Ok(format!("/{}", parts.join("/")))
}

/// Split a path into (parent path, final name). Fails for the root.
pub fn split_parent(path: &str) -> Result<(String, String)> {
    let mut parts = segments(path)?;
    let Some(name) = parts.pop() else {
        return Err(ShardError::InvalidPathFormat(path.to_string()));
    };
    Ok((format!("/{}", parts.join("/")), name.to_string()))
}

/// Final segment of a path, or `None` for the root.
pub fn file_name(path: &str) -> Option<&str> {
    path.rsplit(SEPARATOR).find(|s| !s.is_empty())
}

/// Join a directory path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches(SEPARATOR), name)
    }
}

/// Whether `path` is `ancestor` itself or lies underneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
}

/// A valid sibling name is non-empty, has no separator and is not a
/// relative component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(SEPARATOR) || name == "." || name == ".." {
        return Err(ShardError::InvalidPathFormat(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments() {
        assert!(segments("/").unwrap().is_empty());
        assert_eq!(segments("/home//a.txt/").unwrap(), vec!["home", "a.txt"]);
        assert!(segments("home/a.txt").is_err());
        assert!(segments("/home/../etc").is_err());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/home/a.txt").unwrap(),
            ("/home".to_string(), "a.txt".to_string())
        );
        assert_eq!(
            split_parent("/top").unwrap(),
            ("/".to_string(), "top".to_string())
        );
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn test_join_and_within() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert_eq!(file_name("/a/b/"), Some("b"));
        assert_eq!(file_name("/"), None);
    }
}
