//! Content hashes and remote object fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidFingerprint(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidFingerprint(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidFingerprint(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifies one version of a remote object.
///
/// `Sha256` is verified against the downloaded bytes; `ETag` is compared with
/// the ETag the store reports for the object that was actually downloaded.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Sha256(ContentHash),
    ETag(String),
}

impl Fingerprint {
    const SHA256_PREFIX: &'static str = "sha256:";

    /// Build an ETag fingerprint, dropping the surrounding quotes S3 returns.
    pub fn etag(raw: &str) -> Self {
        Self::ETag(raw.trim_matches('"').to_string())
    }

    /// Verify downloaded content against this fingerprint.
    ///
    /// `remote_etag` is the ETag returned alongside `data`, if the store
    /// provided one.
    pub fn verify(&self, data: &[u8], remote_etag: Option<&Fingerprint>) -> crate::Result<()> {
        match self {
            Self::Sha256(expected) => {
                let actual = ContentHash::compute(data);
                if &actual != expected {
                    return Err(crate::Error::FingerprintMismatch {
                        expected: self.to_string(),
                        actual: Self::Sha256(actual).to_string(),
                    });
                }
                Ok(())
            }
            Self::ETag(_) => match remote_etag {
                Some(actual) if actual == self => Ok(()),
                Some(actual) => Err(crate::Error::FingerprintMismatch {
                    expected: self.to_string(),
                    actual: actual.to_string(),
                }),
                None => Err(crate::Error::FingerprintMismatch {
                    expected: self.to_string(),
                    actual: "<no etag>".to_string(),
                }),
            },
        }
    }
}

impl FromStr for Fingerprint {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if let Some(hex) = s.strip_prefix(Self::SHA256_PREFIX) {
            return Ok(Self::Sha256(ContentHash::from_hex(hex)?));
        }
        let etag = s.trim_matches('"');
        if etag.is_empty() {
            return Err(crate::Error::InvalidFingerprint(
                "fingerprint cannot be empty".to_string(),
            ));
        }
        Ok(Self::ETag(etag.to_string()))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(hash) => write!(f, "{}{}", Self::SHA256_PREFIX, hash),
            Self::ETag(etag) => f.write_str(etag),
        }
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
