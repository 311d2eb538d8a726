//! Identifiers: postgres major versions, extension names and remote object keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A postgres major version (`v14`, `v15`, ...).
///
/// Parsed from either `v15` or `15`; always displayed with the `v` prefix,
/// which is also the first path component of both remote keys and the local
/// cache layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PgMajorVersion(u16);

impl PgMajorVersion {
    /// Oldest major version we accept.
    pub const MIN: u16 = 10;

    /// Create from a numeric major version.
    pub fn new(major: u16) -> crate::Result<Self> {
        if major < Self::MIN {
            return Err(crate::Error::InvalidVersion(format!(
                "major version must be >= {}, got {major}",
                Self::MIN
            )));
        }
        Ok(Self(major))
    }

    /// Numeric major version.
    pub fn major(&self) -> u16 {
        self.0
    }

    /// Path component form (`v15`).
    pub fn as_dir(&self) -> String {
        format!("v{}", self.0)
    }
}

impl FromStr for PgMajorVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let digits = s.strip_prefix('v').unwrap_or(s);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(crate::Error::InvalidVersion(format!(
                "expected `v<major>` or `<major>`, got {s:?}"
            )));
        }
        let major = digits
            .parse::<u16>()
            .map_err(|e| crate::Error::InvalidVersion(format!("{s:?}: {e}")))?;
        Self::new(major)
    }
}

impl fmt::Debug for PgMajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgMajorVersion({self})")
    }
}

impl fmt::Display for PgMajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Serialize for PgMajorVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_dir())
    }
}

impl<'de> Deserialize<'de> for PgMajorVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A database extension name, safe to use as a single directory component.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtensionName(String);

impl ExtensionName {
    /// Maximum length of an extension name (postgres NAMEDATALEN - 1).
    pub const MAX_LEN: usize = 63;

    /// Create from a string, validating format.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidExtensionName(
                "name cannot be empty".to_string(),
            ));
        }
        if name.len() > Self::MAX_LEN {
            return Err(crate::Error::InvalidExtensionName(format!(
                "name longer than {} chars: {name}",
                Self::MAX_LEN
            )));
        }
        if name.starts_with('.') {
            return Err(crate::Error::InvalidExtensionName(format!(
                "name cannot start with '.': {name}"
            )));
        }
        for c in name.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.') {
                return Err(crate::Error::InvalidExtensionName(format!(
                    "invalid character in name {name:?}: {c}"
                )));
            }
        }
        Ok(Self(name))
    }

    /// Get the name string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ExtensionName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl FromStr for ExtensionName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

impl From<ExtensionName> for String {
    fn from(value: ExtensionName) -> Self {
        value.0
    }
}

impl fmt::Debug for ExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionName({})", self.0)
    }
}

impl fmt::Display for ExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a single object in the remote store (e.g. `v15/share/extension/test_ext.control`).
///
/// Keys are relative, `/`-separated and contain no empty, `.` or `..`
/// segments, so the final segment can be used directly as a local file name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteObjectKey(String);

impl RemoteObjectKey {
    /// Create from a string, validating format.
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(crate::Error::InvalidKey("key cannot be empty".to_string()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(crate::Error::InvalidKey(format!(
                "key must be a relative '/'-separated path: {key}"
            )));
        }
        for segment in key.split('/') {
            match segment {
                "" => {
                    return Err(crate::Error::InvalidKey(format!(
                        "key contains an empty segment: {key}"
                    )));
                }
                "." | ".." => {
                    return Err(crate::Error::InvalidKey(format!(
                        "key contains a relative segment: {key}"
                    )));
                }
                _ => {}
            }
        }
        Ok(Self(key))
    }

    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment, used as the local file name.
    pub fn file_name(&self) -> &str {
        // Validation guarantees at least one non-empty segment.
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Whether this key names an extension control descriptor.
    pub fn is_control_file(&self) -> bool {
        self.file_name().ends_with(".control")
    }
}

impl TryFrom<String> for RemoteObjectKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<RemoteObjectKey> for String {
    fn from(value: RemoteObjectKey) -> Self {
        value.0
    }
}

impl fmt::Debug for RemoteObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteObjectKey({})", self.0)
    }
}

impl fmt::Display for RemoteObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
