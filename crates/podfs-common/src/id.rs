//! Pod and image identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PodfsError, PodfsResult};

/// A validated pod ID.
///
/// Pod IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodId(String);

impl PodId {
    /// Maximum length of a pod ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new pod ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> PodfsResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random pod ID (a UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the pod ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> PodfsResult<()> {
        let invalid = || PodfsError::InvalidPodId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }
        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PodId {
    type Err = PodfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PodId {
    type Error = PodfsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PodId> for String {
    fn from(id: PodId) -> Self {
        id.0
    }
}

impl AsRef<str> for PodId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content-addressed image ID such as `sha512-8d3c...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId {
    /// The hash algorithm (e.g., "sha512").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl ImageId {
    /// Create a new image ID.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Directory prefix used to shard the tree store: the algorithm and the
    /// first two characters of the hash.
    #[must_use]
    pub fn block_prefix(&self) -> [&str; 2] {
        [&self.algorithm, self.hash.get(..2).unwrap_or(&self.hash)]
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, self.hash)
    }
}

impl FromStr for ImageId {
    type Err = PodfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PodfsError::InvalidImageId { id: s.to_string() };
        let (algorithm, hash) = s.split_once('-').ok_or_else(invalid)?;
        if algorithm.is_empty()
            || !algorithm.chars().all(|c| c.is_ascii_alphanumeric())
            || hash.len() < 2
            || !hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(invalid());
        }
        Ok(Self::new(algorithm, hash))
    }
}

impl TryFrom<String> for ImageId {
    type Error = PodfsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.to_string()
    }
}
