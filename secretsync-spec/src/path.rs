use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum byte length of a single path segment.
pub const MAX_SEGMENT_BYTES: usize = 1024;

/// A normalized, forward-slash-delimited logical secret path.
///
/// A parsed path contains no empty segments, no `.`/`..` traversal, no NUL
/// bytes, and no leading or trailing slash. Parsing is idempotent: the
/// string form of a `SecretPath` parses back to the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretPath {
    joined: String,
}

impl SecretPath {
    /// Normalize and validate `input` with the default segment limit.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with_limit(input, MAX_SEGMENT_BYTES)
    }

    /// Normalize and validate `input`, capping each segment at `max_segment`
    /// bytes.
    pub fn parse_with_limit(input: &str, max_segment: usize) -> Result<Self> {
        let trimmed = input.strip_prefix('/').unwrap_or(input);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

        if trimmed.is_empty() {
            return Err(invalid(input, "path must contain at least one segment"));
        }

        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(invalid(input, "empty path segment"));
            }
            if segment == "." || segment == ".." {
                return Err(invalid(input, "traversal segments are not allowed"));
            }
            if segment.contains('\0') {
                return Err(invalid(input, "segment contains a NUL byte"));
            }
            if segment.len() > max_segment {
                return Err(invalid(input, "segment exceeds the byte limit"));
            }
        }

        Ok(Self {
            joined: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.joined
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.joined.split('/')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn last_segment(&self) -> &str {
        self.joined.rsplit('/').next().unwrap_or(&self.joined)
    }

    /// Append `suffix`, re-normalizing the combined path.
    pub fn join(&self, suffix: &str) -> Result<SecretPath> {
        SecretPath::parse(&format!("{}/{}", self.joined, suffix))
    }

    /// Segment-wise prefix test: `a/b` is a prefix of `a/b/c` but not of
    /// `a/bc`.
    pub fn is_prefix_of(&self, other: &SecretPath) -> bool {
        let mut mine = self.segments();
        let mut theirs = other.segments();
        loop {
            match (mine.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a == b => continue,
                _ => return false,
            }
        }
    }

    /// Remove `prefix` from the front of this path, when it is a proper
    /// segment-wise prefix.
    pub fn strip_prefix(&self, prefix: &SecretPath) -> Option<SecretPath> {
        if !prefix.is_prefix_of(self) || prefix == self {
            return None;
        }
        let remainder = &self.joined[prefix.joined.len() + 1..];
        Some(SecretPath {
            joined: remainder.to_string(),
        })
    }
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::PathInvalid {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined)
    }
}

impl FromStr for SecretPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SecretPath::parse(s)
    }
}

impl TryFrom<&str> for SecretPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        SecretPath::parse(value)
    }
}

impl Serialize for SecretPath {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.joined)
    }
}

impl<'de> Deserialize<'de> for SecretPath {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        SecretPath::parse(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_single_leading_and_trailing_slash() {
        let path = SecretPath::parse("/apps/web/api-key/").expect("parse");
        assert_eq!(path.as_str(), "apps/web/api-key");
        assert_eq!(path.depth(), 3);
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let once = SecretPath::parse("/a/b/c").expect("parse");
        let twice = SecretPath::parse(once.as_str()).expect("reparse");
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_traversal_and_nul() {
        assert!(SecretPath::parse("a/../b").is_err());
        assert!(SecretPath::parse("a//b").is_err());
        assert!(SecretPath::parse("a/\0/b").is_err());
        assert!(SecretPath::parse("a/./b").is_err());
        assert!(SecretPath::parse("").is_err());
        assert!(SecretPath::parse("/").is_err());
    }

    #[test]
    fn rejects_oversized_segment() {
        let long = "x".repeat(MAX_SEGMENT_BYTES + 1);
        assert!(SecretPath::parse(&long).is_err());
        assert!(SecretPath::parse_with_limit("abcdef", 3).is_err());
    }

    #[test]
    fn prefix_is_segment_wise() {
        let a = SecretPath::parse("a/b").unwrap();
        let abc = SecretPath::parse("a/b/c").unwrap();
        let abc2 = SecretPath::parse("a/bc").unwrap();
        assert!(a.is_prefix_of(&abc));
        assert!(!a.is_prefix_of(&abc2));
        assert!(a.is_prefix_of(&a));
    }

    #[test]
    fn strip_prefix_returns_remainder() {
        let root = SecretPath::parse("apps").unwrap();
        let leaf = SecretPath::parse("apps/web/token").unwrap();
        let rel = leaf.strip_prefix(&root).expect("strip");
        assert_eq!(rel.as_str(), "web/token");
        assert!(root.strip_prefix(&leaf).is_none());
        assert!(root.strip_prefix(&root).is_none());
    }

    #[test]
    fn join_renormalizes() {
        let root = SecretPath::parse("apps").unwrap();
        let joined = root.join("/web/token/").expect("join");
        assert_eq!(joined.as_str(), "apps/web/token");
        assert!(root.join("../escape").is_err());
    }
}
