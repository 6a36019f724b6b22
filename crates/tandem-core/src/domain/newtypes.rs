//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for record paths, store
//! identities and checksums. Each newtype ensures data validity at
//! construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::platform::Platform;

// ============================================================================
// DocPath
// ============================================================================

/// A normalized path relative to the synchronized root
///
/// DocPath ensures the path is:
/// - Relative (no leading separator)
/// - Separated by `/` with no empty components
/// - Free of `.` and `..` components
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath(String);

impl DocPath {
    /// Create a new DocPath
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is empty or contains
    /// a `.` or `..` component
    pub fn new(path: impl Into<String>) -> Result<Self, DomainError> {
        let raw = path.into();
        let mut parts = Vec::new();

        for component in raw.split('/') {
            match component {
                "" => {}
                "." | ".." => {
                    return Err(DomainError::InvalidPath(format!(
                        "Path contains a relative component: {raw}"
                    )));
                }
                c => parts.push(c),
            }
        }

        if parts.is_empty() {
            return Err(DomainError::InvalidPath(format!(
                "Path is empty: {raw:?}"
            )));
        }

        Ok(Self(parts.join("/")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last component
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The extension of the last component, including the leading dot
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx..]),
        }
    }

    /// The parent path, `None` for a top-level entry
    #[must_use]
    pub fn parent(&self) -> Option<DocPath> {
        self.0
            .rfind('/')
            .map(|idx| DocPath(self.0[..idx].to_string()))
    }

    /// All ancestors from the top-level folder down to the direct parent
    #[must_use]
    pub fn ancestors(&self) -> Vec<DocPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out.reverse();
        out
    }

    /// Number of components
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    /// Append a relative path
    ///
    /// # Errors
    /// Returns error if the component contains invalid sequences
    pub fn join(&self, rel: &str) -> Result<Self, DomainError> {
        Self::new(format!("{}/{}", self.0, rel))
    }

    /// Whether `self` strictly contains `other`
    #[must_use]
    pub fn is_ancestor_of(&self, other: &DocPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Move `self` from under `from` to under `to`
    ///
    /// Returns `None` when `self` is not `from` or one of its descendants.
    #[must_use]
    pub fn rebase(&self, from: &DocPath, to: &DocPath) -> Option<DocPath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        Some(DocPath(format!("{}{}", to.0, &self.0[from.0.len()..])))
    }

    /// Replace the last component
    ///
    /// # Errors
    /// Returns error if the new name is not a single valid component
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        if name.contains('/') {
            return Err(DomainError::InvalidPath(format!(
                "File name contains a separator: {name}"
            )));
        }
        match self.parent() {
            Some(parent) => parent.join(name),
            None => Self::new(name),
        }
    }
}

impl Display for DocPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DocPath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.0
    }
}

// ============================================================================
// RecordId
// ============================================================================

/// Store key of a record: its path folded under the platform naming rules
///
/// Two paths with the same `RecordId` cannot coexist on the local
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn for_path(path: &DocPath, platform: Platform) -> Self {
        Self(platform.fold_identity(path.as_str()))
    }

    /// Wrap an identity read back from storage
    #[must_use]
    pub fn from_stored(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` strictly contains `other`
    #[must_use]
    pub fn is_ancestor_of(&self, other: &RecordId) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Identity of the parent folder
    #[must_use]
    pub fn parent(&self) -> Option<RecordId> {
        self.0.rfind('/').map(|idx| RecordId(self.0[..idx].to_string()))
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// MD5 digest of a file's content, base64-encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Decoded length of an MD5 digest
    const DIGEST_LEN: usize = 16;

    /// Create a new Checksum
    ///
    /// # Errors
    /// Returns error if the value is not canonical base64 of a 16 byte digest
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let decoded = STANDARD
            .decode(value.as_bytes())
            .map_err(|e| DomainError::InvalidChecksum(format!("{value}: {e}")))?;

        if decoded.len() != Self::DIGEST_LEN {
            return Err(DomainError::InvalidChecksum(format!(
                "{value}: expected {} bytes, got {}",
                Self::DIGEST_LEN,
                decoded.len()
            )));
        }

        // Reject non-canonical padding bits so equal digests compare equal
        if STANDARD.encode(&decoded) != value {
            return Err(DomainError::InvalidChecksum(format!(
                "{value}: non-canonical encoding"
            )));
        }

        Ok(Self(value))
    }

    /// Encode a raw 16 byte digest
    #[must_use]
    pub fn from_digest(digest: [u8; 16]) -> Self {
        Self(STANDARD.encode(digest))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Checksum {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.0
    }
}
