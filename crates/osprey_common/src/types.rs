use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a node process, e.g. `host_3001` or
/// `osprey-17.example.com_16020`.
///
/// Server names are embedded into recovered replication queue ids with `-` as
/// the separator, so they must not contain `-` themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName(pub String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
