// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! [`BlobPath`], the backend-agnostic path model used by the filesystem
//! abstraction (see `afs`).

use std::path::{Path, PathBuf};

/// An ordered, immutable sequence of non-empty path elements.
///
/// Two paths are equal iff their element sequences are equal; the
/// fully-qualified name is always `elements.join("/")`, independent of the
/// concrete backend a connector ultimately resolves it to.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlobPath {
    elements: Vec<String>,
}

impl BlobPath {
    /// Builds a path from an ordered list of elements.
    ///
    /// # Panics
    ///
    /// Panics if `elements` is empty or any element is empty.
    #[must_use]
    pub fn new<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let elements: Vec<String> = elements.into_iter().map(Into::into).collect();
        assert!(!elements.is_empty(), "BlobPath must have at least one element");
        assert!(
            elements.iter().all(|e| !e.is_empty()),
            "BlobPath elements must be non-empty"
        );
        Self { elements }
    }

    /// Parses a `/`-separated string into a path.
    ///
    /// # Panics
    ///
    /// Panics if the string is empty or contains empty segments (e.g. `a//b`).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        Self::new(s.split('/').filter(|e| !e.is_empty()))
    }

    /// Returns the ordered path elements.
    #[must_use]
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Returns the fully-qualified, `/`-joined name.
    #[must_use]
    pub fn fully_qualified_name(&self) -> String {
        self.elements.join("/")
    }

    /// Returns a new path with one more element appended.
    #[must_use]
    pub fn join<S: Into<String>>(&self, element: S) -> Self {
        let mut elements = self.elements.clone();
        elements.push(element.into());
        Self { elements }
    }

    /// Returns the final path element, e.g. the file or container name.
    #[must_use]
    pub fn last(&self) -> &str {
        self.elements.last().expect("BlobPath is never empty")
    }

    /// Returns the parent path, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.elements.len() <= 1 {
            None
        } else {
            Some(Self {
                elements: self.elements[..self.elements.len() - 1].to_vec(),
            })
        }
    }
}

impl std::fmt::Display for BlobPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fully_qualified_name())
    }
}

/// Resolves a [`BlobPath`] to a backend-native filesystem locator.
///
/// The local resolver joins elements with the platform separator and expands
/// a leading `~` element to the user's home directory.
pub fn resolve_local(root: &Path, path: &BlobPath) -> PathBuf {
    let mut out = PathBuf::new();
    let mut elements = path.elements().iter();

    if let Some(first) = path.elements().first() {
        if first == "~" {
            if let Some(home) = std::env::var_os("HOME") {
                out.push(home);
            } else {
                out.push(root);
            }
            elements.next();
        } else {
            out.push(root);
        }
    } else {
        out.push(root);
    }

    for element in elements {
        out.push(element);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_elements() {
        let a = BlobPath::new(["channel_000", "channel_000_file_000001.dat"]);
        let b = BlobPath::parse("channel_000/channel_000_file_000001.dat");
        assert_eq!(a, b);
        assert_eq!(a.fully_qualified_name(), "channel_000/channel_000_file_000001.dat");
    }

    #[test]
    fn join_and_parent() {
        let root = BlobPath::new(["storage"]);
        let child = root.join("channel_000");
        assert_eq!(child.fully_qualified_name(), "storage/channel_000");
        assert_eq!(child.parent(), Some(root));
    }

    #[test]
    fn tilde_expands_to_home() {
        let path = BlobPath::parse("~/nebula/storage");
        let resolved = resolve_local(Path::new("/unused"), &path);
        if let Some(home) = std::env::var_os("HOME") {
            assert!(resolved.starts_with(home));
        }
        assert!(resolved.ends_with("nebula/storage"));
    }
}
