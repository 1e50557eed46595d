//! Core type definitions for SQLWard.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Caller-assigned identifier used to correlate databases.
///
/// SQLWard never interprets a tag and enforces no uniqueness; it is carried
/// along so that several `Database` values pointing at related files can be
/// grouped by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tag(pub i64);

impl Tag {
    /// The tag every database starts with.
    pub const INVALID: Tag = Tag(0);

    /// Creates a new tag.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw tag value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns whether this is [`Tag::INVALID`].
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{}", self.0)
    }
}

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a `Database` value and its clones.
///
/// Used as the key of the per-thread handle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatabaseId(u64);

impl DatabaseId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db:{}", self.0)
    }
}

/// Process-unique identity of a [`crate::Handle`].
///
/// IDs are never reused, so a reopened pool always yields new IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle:{}", self.0)
    }
}

/// An opaque SQL statement.
///
/// SQLWard does not build or parse SQL; statements are handed to the engine
/// as-is. A statement may contain several `;`-separated commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement(String);

impl Statement {
    /// Wraps SQL text.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    /// Returns the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self(sql)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_defaults_to_invalid() {
        assert!(Tag::default().is_invalid());
        assert!(!Tag::new(7).is_invalid());
        assert_eq!(Tag::new(7).to_string(), "tag:7");
    }

    #[test]
    fn ids_are_unique() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert_ne!(DatabaseId::next(), DatabaseId::next());
    }

    #[test]
    fn statement_conversions() {
        let from_str: Statement = "SELECT 1".into();
        let from_string: Statement = String::from("SELECT 1").into();
        assert_eq!(from_str, from_string);
        assert_eq!(from_str.sql(), "SELECT 1");
    }
}
