//! Normalized request paths.
//!
//! A [`RequestPath`] is the key every stack node uses to talk about a file.
//! The relative form is normalized once at construction (separators unified,
//! `.` segments dropped, `..` folded where possible) so that hashing and
//! equality are cheap string operations on an `Arc<str>`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable, normalized relative path with cheap clone, hash and equality.
#[derive(Clone)]
pub struct RequestPath {
    relative: Arc<str>,
}

impl RequestPath {
    /// Creates a request path from any relative path-like string.
    ///
    /// # Example
    ///
    /// ```
    /// use streamer::request::RequestPath;
    ///
    /// let a = RequestPath::new("textures\\rock//./albedo.dds");
    /// let b = RequestPath::new("textures/rock/albedo.dds");
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_str(), "textures/rock/albedo.dds");
    /// ```
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            relative: Arc::from(normalize(path.as_ref())),
        }
    }

    /// Returns the normalized relative form.
    pub fn as_str(&self) -> &str {
        &self.relative
    }

    /// Resolves the path against a device root directory.
    pub fn resolve_against(&self, root: &Path) -> PathBuf {
        root.join(self.relative.as_ref())
    }

    /// Returns true if the normalized path is empty.
    pub fn is_empty(&self) -> bool {
        self.relative.is_empty()
    }
}

impl PartialEq for RequestPath {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.relative, &other.relative) || self.relative == other.relative
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.relative.hash(state);
    }
}

impl fmt::Debug for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestPath({})", self.relative)
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative)
    }
}

impl From<&str> for RequestPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RequestPath {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Normalizes a relative path string.
///
/// Backslashes become forward slashes, empty and `.` segments are removed,
/// and `..` pops the previous segment when there is one. Leading `..`
/// segments that cannot be folded are kept.
fn normalize(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    segments.join("/")
}
