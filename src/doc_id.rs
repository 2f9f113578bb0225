use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Longest identifier accepted from callers, matching the width of a
/// SHA-256 hex digest.
pub const MAX_ID_LEN: usize = 64;

/// A stable document identifier.
///
/// Derived identifiers are the SHA-256 of the document bytes in lower-case
/// hex, so identical content always maps to the same id. Callers may also
/// supply an explicit id, which is used verbatim; forcing two different
/// files under one id is then the caller's choice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Derive the content-addressed id for a document's bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use colpage::DocumentId;
    ///
    /// let a = DocumentId::from_content(b"hello");
    /// let b = DocumentId::from_content(b"hello");
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_str().len(), 64);
    /// ```
    pub fn from_content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut hex = String::with_capacity(MAX_ID_LEN);
        for byte in digest {
            use std::fmt::Write as _;
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Wrap an explicit caller-supplied identifier.
    pub fn new(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::InvalidArgument(
                "document id must not be empty".into(),
            ));
        }
        if id.len() > MAX_ID_LEN {
            return Err(Error::InvalidArgument(format!(
                "document id exceeds {MAX_ID_LEN} characters"
            )));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidArgument(
                "document id must not contain whitespace or control characters"
                    .into(),
            ));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters for compact human-readable output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = DocumentId::from_content(b"same bytes");
        let b = DocumentId::from_content(b"same bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_differs() {
        let a = DocumentId::from_content(b"one");
        let b = DocumentId::from_content(b"two");
        assert_ne!(a, b);
    }

    #[test]
    fn derived_id_is_64_hex_chars() {
        let id = DocumentId::from_content(b"anything");
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn explicit_id_used_verbatim() {
        let id = DocumentId::new("my-custom-doc-id").unwrap();
        assert_eq!(id.as_str(), "my-custom-doc-id");
    }

    #[test]
    fn empty_id_rejected() {
        assert!(DocumentId::new("").is_err());
    }

    #[test]
    fn overlong_id_rejected() {
        let long = "x".repeat(65);
        assert!(DocumentId::new(&long).is_err());
    }

    #[test]
    fn whitespace_rejected() {
        assert!(DocumentId::new("has space").is_err());
        assert!(DocumentId::new("has\ttab").is_err());
    }

    #[test]
    fn short_is_twelve_chars() {
        let id = DocumentId::from_content(b"doc");
        assert_eq!(id.short().len(), 12);
        assert!(id.as_str().starts_with(id.short()));
    }

    #[test]
    fn short_of_tiny_id_is_whole_id() {
        let id = DocumentId::new("tiny").unwrap();
        assert_eq!(id.short(), "tiny");
    }
}
