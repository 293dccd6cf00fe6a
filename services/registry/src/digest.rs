//! Content digests.
//!
//! Every blob and manifest is addressed by the SHA-256 of its bytes, written in
//! the canonical `sha256:<64 lowercase hex>` form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const SHA256_HEX_LEN: usize = 64;

/// Reasons a digest string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// No `algorithm:` prefix.
    #[error("digest is missing an algorithm prefix: {0}")]
    Malformed(String),

    /// Any algorithm other than `sha256`.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The encoded part is not 64 characters long.
    #[error("sha256 digest must have {SHA256_HEX_LEN} hex characters, got {0}")]
    InvalidLength(usize),

    /// The encoded part is not lowercase hex.
    #[error("digest contains non-hex characters")]
    InvalidHex,
}

/// Hash algorithms accepted for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256
    Sha256,
}

impl Algorithm {
    /// The algorithm name used in the canonical form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// The SHA-256 digest of `content`.
    pub fn compute(content: &[u8]) -> Self {
        Self::from_hash(Sha256::digest(content).as_slice())
    }

    /// Parse and validate a digest string.
    pub fn parse(value: &str) -> Result<Self, DigestError> {
        let (algorithm, encoded) = value
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(value.to_owned()))?;

        if algorithm != Algorithm::Sha256.as_str() {
            return Err(DigestError::UnsupportedAlgorithm(algorithm.to_owned()));
        }

        if encoded.len() != SHA256_HEX_LEN {
            return Err(DigestError::InvalidLength(encoded.len()));
        }

        if !encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidHex);
        }

        Ok(Self {
            algorithm: Algorithm::Sha256,
            hex: encoded.to_owned(),
        })
    }

    fn from_hash(hash: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(hash),
        }
    }

    /// Whether `content` hashes to this digest.
    pub fn verify(&self, content: &[u8]) -> bool {
        Digest::compute(content) == *self
    }

    /// The hash algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoding of the hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Incremental SHA-256 over content that arrives in pieces.
#[derive(Clone, Default)]
pub struct DigestWriter {
    hasher: Sha256,
    written: u64,
}

impl fmt::Debug for DigestWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestWriter")
            .field("written", &self.written)
            .finish()
    }
}

impl DigestWriter {
    /// Start an empty hash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
    }

    /// Bytes fed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The digest of everything fed so far, leaving the writer usable.
    pub fn digest(&self) -> Digest {
        self.clone().finalize()
    }

    /// Consume the writer and produce the digest.
    pub fn finalize(self) -> Digest {
        Digest::from_hash(self.hasher.finalize().as_slice())
    }
}
