//! Normalized object paths
//!
//! Every object the server exposes is addressed by an absolute,
//! `/`-separated path rooted at the export. Paths are normalized on
//! construction so that equal objects always compare equal.

use std::borrow::Borrow;
use std::fmt;

/// Absolute path of a backend object (`/` is the export root)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// The export root
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalize a path. Empty components and `.` are dropped,
    /// `..` pops a component (never above the root).
    pub fn parse(path: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        if parts.is_empty() {
            Self::root()
        } else {
            Self(format!("/{}", parts.join("/")))
        }
    }

    /// Check if this is the root
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Get the path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a single component. The caller validates `name`.
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(format!("/{}", name))
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    /// Parent directory (`None` for the root)
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final component (`None` for the root)
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Iterate over path components
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Component-wise prefix test (`/a` is an ancestor of `/a/b`, not of `/ab`)
    pub fn is_ancestor_of(&self, other: &ObjectPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Re-root `self` from `from` onto `to`. Returns `None` unless `self`
    /// equals `from` or lives below it.
    pub fn rebase(&self, from: &ObjectPath, to: &ObjectPath) -> Option<ObjectPath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        Some(to.join(rest))
    }

    /// Length of the encoded path in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Paths are never empty; present for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ObjectPath {
    fn default() -> Self {
        Self::root()
    }
}

impl Borrow<str> for ObjectPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(ObjectPath::parse("").as_str(), "/");
        assert_eq!(ObjectPath::parse("a//b/./c/").as_str(), "/a/b/c");
        assert_eq!(ObjectPath::parse("/a/../../b").as_str(), "/b");
    }

    #[test]
    fn test_parent_and_name() {
        let path = ObjectPath::parse("/dir/file.txt");
        assert_eq!(path.file_name(), Some("file.txt"));
        assert_eq!(path.parent().unwrap().as_str(), "/dir");
        assert_eq!(ObjectPath::parse("/top").parent().unwrap(), ObjectPath::root());
        assert!(ObjectPath::root().parent().is_none());
    }

    #[test]
    fn test_ancestry_is_component_wise() {
        let a = ObjectPath::parse("/a");
        assert!(a.is_ancestor_of(&ObjectPath::parse("/a/b")));
        assert!(!a.is_ancestor_of(&ObjectPath::parse("/ab")));
        assert!(!a.is_ancestor_of(&a));
        assert!(ObjectPath::root().is_ancestor_of(&a));
    }

    #[test]
    fn test_rebase() {
        let from = ObjectPath::parse("/old");
        let to = ObjectPath::parse("/new/place");
        assert_eq!(
            ObjectPath::parse("/old/x/y").rebase(&from, &to).unwrap().as_str(),
            "/new/place/x/y"
        );
        assert_eq!(from.rebase(&from, &to).unwrap(), to);
        assert!(ObjectPath::parse("/older").rebase(&from, &to).is_none());
    }
}
