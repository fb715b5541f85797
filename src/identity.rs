//! Document identity strategies
//!
//! An [`Identifier`] derives a stable id for a root document and for each
//! document embedded in it. Three strategies are available:
//!
//! - **path**: the path string itself. Cheap and readable, but two runs over
//!   identical paths on different machines collide.
//! - **path-digest**: a digest of the path string.
//! - **digest**: the content digest computed once during extraction and
//!   stored in metadata under `content-digest:<ALGORITHM>`. Never re-reads
//!   file bytes.
//!
//! Embedded documents that share identical bytes (the same logo attached to
//! two mails, say) would collide on content alone, so the digest strategy
//! derives embed ids from the embed's hash, its parent's id, and its
//! relationship id and resource name when present.

use crate::document::{Document, Metadata, RELATIONSHIP_ID, RESOURCE_NAME};
use crate::error::{IdentityError, IdentityResult};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Separator between composite digest inputs
const FIELD_SEPARATOR: u8 = 0;

/// Supported content digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
    Blake3,
}

impl DigestAlgorithm {
    /// Canonical algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Blake3 => "BLAKE3",
        }
    }

    /// Metadata key under which extraction stores this digest
    pub fn metadata_key(&self) -> String {
        format!("content-digest:{}", self.name())
    }

    /// Hex-encoded digest of `data`
    pub fn digest_hex(&self, data: &[u8]) -> String {
        self.digest_parts(&[data])
    }

    /// Hex-encoded digest of several fields joined by a NUL separator
    fn digest_parts(&self, parts: &[&[u8]]) -> String {
        match self {
            DigestAlgorithm::Sha256 => hex::encode(sha2_parts::<Sha256>(parts)),
            DigestAlgorithm::Sha384 => hex::encode(sha2_parts::<Sha384>(parts)),
            DigestAlgorithm::Sha512 => hex::encode(sha2_parts::<Sha512>(parts)),
            DigestAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        hasher.update(&[FIELD_SEPARATOR]);
                    }
                    hasher.update(part);
                }
                hasher.finalize().to_hex().to_string()
            }
        }
    }
}

fn sha2_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

impl FromStr for DigestAlgorithm {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();

        match normalized.as_str() {
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            "BLAKE3" => Ok(DigestAlgorithm::Blake3),
            _ => Err(IdentityError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Strategy deriving document ids
///
/// Implementations must be pure: the same inputs always give the same id.
pub trait Identifier: Send + Sync + fmt::Debug {
    /// Id of a root document
    fn generate(&self, doc: &Document) -> IdentityResult<String>;

    /// Id of a document embedded under `parent_id`
    ///
    /// `ordinal` is the embed's position among its siblings, for strategies
    /// that need a fallback key when the embed carries no name.
    fn generate_for_embed(
        &self,
        parent_id: &str,
        metadata: &Metadata,
        ordinal: usize,
    ) -> IdentityResult<String>;
}

/// Lookup key of an embed: relationship id, then resource name
pub fn embed_key(metadata: &Metadata) -> Option<&str> {
    metadata
        .get(RELATIONSHIP_ID)
        .and_then(|v| v.first())
        .or_else(|| metadata.get(RESOURCE_NAME).and_then(|v| v.first()))
}

fn embed_path_key(metadata: &Metadata, ordinal: usize) -> String {
    embed_key(metadata)
        .map(str::to_string)
        .unwrap_or_else(|| format!("embedded-{}", ordinal))
}

/// Id is the document path
#[derive(Debug, Default, Clone, Copy)]
pub struct PathIdentifier;

impl Identifier for PathIdentifier {
    fn generate(&self, doc: &Document) -> IdentityResult<String> {
        Ok(doc.path().to_string_lossy().into_owned())
    }

    fn generate_for_embed(
        &self,
        parent_id: &str,
        metadata: &Metadata,
        ordinal: usize,
    ) -> IdentityResult<String> {
        Ok(format!("{}/{}", parent_id, embed_path_key(metadata, ordinal)))
    }
}

/// Id is a digest of the document path
#[derive(Debug, Default, Clone, Copy)]
pub struct PathDigestIdentifier {
    algorithm: DigestAlgorithm,
}

impl PathDigestIdentifier {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl Identifier for PathDigestIdentifier {
    fn generate(&self, doc: &Document) -> IdentityResult<String> {
        let path = doc.path().to_string_lossy();
        Ok(self.algorithm.digest_hex(path.as_bytes()))
    }

    fn generate_for_embed(
        &self,
        parent_id: &str,
        metadata: &Metadata,
        ordinal: usize,
    ) -> IdentityResult<String> {
        let key = embed_path_key(metadata, ordinal);
        Ok(self
            .algorithm
            .digest_parts(&[parent_id.as_bytes(), key.as_bytes()]))
    }
}

/// Id is the content digest recorded in metadata during extraction
#[derive(Debug, Clone)]
pub struct DigestIdentifier {
    algorithm: DigestAlgorithm,
    key: String,
}

impl DigestIdentifier {
    /// Fails with [`IdentityError::UnsupportedAlgorithm`] for unknown names
    pub fn new(algorithm: &str) -> IdentityResult<Self> {
        Ok(Self::with_algorithm(algorithm.parse()?))
    }

    pub fn with_algorithm(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            key: algorithm.metadata_key(),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }
}

impl Identifier for DigestIdentifier {
    fn generate(&self, doc: &Document) -> IdentityResult<String> {
        doc.metadata()
            .get(&self.key)
            .and_then(|v| v.first())
            .map(str::to_string)
            .ok_or_else(|| IdentityError::MissingDigest {
                path: doc.path().to_path_buf(),
                key: self.key.clone(),
            })
    }

    fn generate_for_embed(
        &self,
        parent_id: &str,
        metadata: &Metadata,
        _ordinal: usize,
    ) -> IdentityResult<String> {
        let hash = metadata
            .get(&self.key)
            .and_then(|v| v.first())
            .ok_or_else(|| IdentityError::MissingDigest {
                path: PathBuf::from(parent_id),
                key: self.key.clone(),
            })?;

        let mut parts: Vec<&[u8]> = vec![hash.as_bytes(), parent_id.as_bytes()];
        if let Some(rel) = metadata.get(RELATIONSHIP_ID).and_then(|v| v.first()) {
            parts.push(rel.as_bytes());
        }
        if let Some(name) = metadata.get(RESOURCE_NAME).and_then(|v| v.first()) {
            parts.push(name.as_bytes());
        }

        Ok(self.algorithm.digest_parts(&parts))
    }
}

/// Identification method selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdMethod {
    #[default]
    Path,
    PathDigest,
    Digest,
}

impl FromStr for IdMethod {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "path" => Ok(IdMethod::Path),
            "path-digest" | "pathdigest" => Ok(IdMethod::PathDigest),
            "digest" | "content-digest" => Ok(IdMethod::Digest),
            _ => Err(IdentityError::UnknownMethod(s.to_string())),
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOptions {
    pub method: IdMethod,
    pub algorithm: DigestAlgorithm,
}

impl IdentityOptions {
    /// Parse method and algorithm names, failing before any work starts
    pub fn parse(method: &str, algorithm: &str) -> IdentityResult<Self> {
        Ok(Self {
            method: method.parse()?,
            algorithm: algorithm.parse()?,
        })
    }

    /// Build the configured identifier
    pub fn build(&self) -> Arc<dyn Identifier> {
        match self.method {
            IdMethod::Path => Arc::new(PathIdentifier),
            IdMethod::PathDigest => Arc::new(PathDigestIdentifier::new(self.algorithm)),
            IdMethod::Digest => Arc::new(DigestIdentifier::with_algorithm(self.algorithm)),
        }
    }
}
