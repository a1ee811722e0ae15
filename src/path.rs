//! Group Paths
//!
//! Validated hierarchical paths and the sequence-numbered node names
//! the coordination service assigns beneath them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Width of the zero-padded sequence suffix appended by the coordination service
pub const SEQUENCE_WIDTH: usize = 10;

/// A validated, absolute path in the coordination service namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupPath(String);

impl GroupPath {
    /// Validate and wrap a path
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path)?;
        Ok(Self(path))
    }

    /// Get the path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if this is the namespace root
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Full path of a direct child node
    pub fn child(&self, name: &str) -> String {
        if self.is_root() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.0, name)
        }
    }
}

fn validate(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Config("path cannot be empty".into()));
    }
    if !path.starts_with('/') {
        return Err(Error::Config(format!("path must be absolute: {:?}", path)));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(Error::Config(format!("path must not end with '/': {:?}", path)));
    }

    for segment in path[1..].split('/') {
        match segment {
            "" => {
                return Err(Error::Config(format!("empty path segment in {:?}", path)));
            }
            "." | ".." => {
                return Err(Error::Config(format!("relative segment in {:?}", path)));
            }
            s if s.chars().any(|c| c.is_control()) => {
                return Err(Error::Config(format!("control character in {:?}", path)));
            }
            _ => {}
        }
    }

    Ok(())
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for GroupPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for GroupPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for GroupPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<GroupPath> for String {
    fn from(path: GroupPath) -> Self {
        path.0
    }
}

/// Parse the sequence number out of a child name carrying `prefix`.
///
/// Returns `None` for children that belong to another prefix or whose
/// suffix is not a plain decimal number.
pub fn parse_sequence(name: &str, prefix: &str) -> Option<u64> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Format the name the coordination service gives a sequential child
pub fn sequential_name(prefix: &str, sequence: u64) -> String {
    format!("{}{:0width$}", prefix, sequence, width = SEQUENCE_WIDTH)
}

/// Last segment of a full node path
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
