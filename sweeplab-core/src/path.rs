//! Dotted configuration paths (`optimizer.lr_scheduler.scheduler`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SchemaError;

/// Characters that may not appear inside a path segment. `.` separates
/// segments; the rest are reserved by the run identity encoding.
const RESERVED: [char; 5] = ['.', ',', '=', '/', '%'];

/// A validated dotted path. Ordering is lexicographic by segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigPath {
    segments: Vec<String>,
}

impl ConfigPath {
    /// Parse a dotted path, rejecting empty or reserved segments.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        if text.is_empty() {
            return Err(SchemaError::MalformedPath {
                path: text.to_string(),
                reason: "path is empty".into(),
            });
        }
        let segments = text.split('.').map(str::to_string).collect();
        Self::from_segments(segments).map_err(|reason| SchemaError::MalformedPath {
            path: text.to_string(),
            reason,
        })
    }

    pub(crate) fn from_segments(segments: Vec<String>) -> Result<Self, String> {
        if segments.is_empty() {
            return Err("path is empty".into());
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    /// Segments already validated by the tree they were read from.
    pub(crate) fn from_trusted(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last segment (the leaf name).
    pub fn leaf(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Extend this path by one segment.
    pub fn child(&self, segment: &str) -> Result<Self, SchemaError> {
        validate_segment(segment).map_err(|reason| SchemaError::MalformedPath {
            path: format!("{self}.{segment}"),
            reason,
        })?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// True if `self` equals `other` or lies underneath it.
    pub fn starts_with(&self, other: &ConfigPath) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// True if either path is a prefix of the other.
    pub fn overlaps(&self, other: &ConfigPath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

pub(crate) fn validate_segment(segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err("empty segment".into());
    }
    if let Some(c) = segment
        .chars()
        .find(|c| RESERVED.contains(c) || c.is_whitespace())
    {
        return Err(format!("segment '{segment}' contains reserved character {c:?}"));
    }
    Ok(())
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for ConfigPath {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ConfigPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConfigPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
