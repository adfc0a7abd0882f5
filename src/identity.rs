//! Container identities: the cheap fingerprint that decides whether a
//! persisted index can be reused.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::container::{ContainerLocation, ContainerProvider};
use crate::error::ScanResult;

/// What goes into an identity besides size and modification time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityPolicy {
    /// Size and modification time only.
    #[default]
    TimestampSize,
    /// Size, modification time and a content digest.
    ContentDigest,
}

impl FromStr for IdentityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" | "timestamp-size" | "stat" => Ok(Self::TimestampSize),
            "digest" | "content-digest" | "sha256" => Ok(Self::ContentDigest),
            other => Err(format!("unknown identity policy: {other}")),
        }
    }
}

impl fmt::Display for IdentityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimestampSize => f.write_str("timestamp-size"),
            Self::ContentDigest => f.write_str("content-digest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerIdentity {
    /// Logical path, including the `!/` entry for nested archives.
    pub path: String,
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    pub last_modified: u64,
    pub digest: Option<String>,
}

impl ContainerIdentity {
    /// Short form for logs: `size@mtime` plus the first digest bytes.
    pub fn stamp(&self) -> String {
        match &self.digest {
            Some(d) => format!("{}@{}#{}", self.size, self.last_modified, &d[..d.len().min(12)]),
            None => format!("{}@{}", self.size, self.last_modified),
        }
    }
}

pub fn resolve(
    provider: &dyn ContainerProvider,
    location: &ContainerLocation,
    policy: IdentityPolicy,
) -> ScanResult<ContainerIdentity> {
    let stat = provider.stat(location)?;
    let digest = match policy {
        IdentityPolicy::TimestampSize => None,
        IdentityPolicy::ContentDigest => Some(provider.digest(location)?),
    };
    Ok(ContainerIdentity {
        path: location.logical_path(),
        size: stat.size,
        last_modified: stat.last_modified,
        digest,
    })
}

/// A stored identity is valid only if every component matches, so switching
/// the identity policy invalidates existing entries.
pub fn is_valid(stored: &ContainerIdentity, current: &ContainerIdentity) -> bool {
    stored == current
}

/// Store key for a container: hex SHA-256 of its logical path.
pub fn cache_key(location: &ContainerLocation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(location.logical_path().as_bytes());
    hex::encode(hasher.finalize())
}
