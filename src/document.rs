//! Documents and their embedded sub-documents
//!
//! A [`Document`] is one file found by the scanner. Parts discovered inside
//! it during extraction (attachments, embedded images) live in an arena
//! owned by the root document and are addressed by [`EmbedId`]. Every embed
//! records its parent's id string and arena slot rather than a reference, so
//! the tree has no ownership cycles and can be shipped across processes as
//! plain data.
//!
//! Only the root's [`DocumentRecord`] travels through queues; embeds are
//! rediscovered by extraction on the consuming side.

use crate::error::{IdentityError, IdentityResult};
use crate::identity::{embed_key, Identifier};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Metadata key holding an embed's relationship id within its parent
pub const RELATIONSHIP_ID: &str = "embedded-relationship-id";

/// Metadata key holding an embed's resource (file) name
pub const RESOURCE_NAME: &str = "resource-name";

/// Metadata key for the detected content type
pub const CONTENT_TYPE: &str = "content-type";

/// Metadata key for the extracted content length in bytes
pub const CONTENT_LENGTH: &str = "content-length";

/// A metadata value: one string or several
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Single(String),
    List(Vec<String>),
}

impl MetadataValue {
    /// First value, if any
    pub fn first(&self) -> Option<&str> {
        match self {
            MetadataValue::Single(s) => Some(s),
            MetadataValue::List(values) => values.first().map(String::as_str),
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            MetadataValue::Single(s) => std::slice::from_ref(s),
            MetadataValue::List(values) => values,
        }
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Single(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Single(value.to_string())
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(values: Vec<String>) -> Self {
        MetadataValue::List(values)
    }
}

/// Ordered document metadata
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Arena slot of an embedded document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmbedId(usize);

impl EmbedId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A document discovered inside another document
#[derive(Debug, Clone)]
pub struct Embed {
    id: String,
    parent: Option<EmbedId>,
    parent_id: String,
    metadata: Metadata,
    children: Vec<EmbedId>,
    lookup: HashMap<String, EmbedId>,
}

impl Embed {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parent slot, `None` when the parent is the root document
    pub fn parent(&self) -> Option<EmbedId> {
        self.parent
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn children(&self) -> &[EmbedId] {
        &self.children
    }
}

/// Wire form of a root document, as stored in queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_id: Option<String>,
}

/// A unit of work: one file and everything extracted from it
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    size: Option<u64>,
    foreign_id: Option<String>,
    metadata: Metadata,
    identifier: Arc<dyn Identifier>,
    id: OnceLock<String>,
    embeds: Vec<Embed>,
    children: Vec<EmbedId>,
    lookup: HashMap<String, EmbedId>,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, size: Option<u64>, identifier: Arc<dyn Identifier>) -> Self {
        Self {
            path: path.into(),
            size,
            foreign_id: None,
            metadata: Metadata::new(),
            identifier,
            id: OnceLock::new(),
            embeds: Vec::new(),
            children: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn foreign_id(&self) -> Option<&str> {
        self.foreign_id.as_deref()
    }

    pub fn set_foreign_id(&mut self, foreign_id: impl Into<String>) {
        self.foreign_id = Some(foreign_id.into());
    }

    /// Document id, derived on first successful call and memoized
    ///
    /// Content-digest ids fail until extraction has recorded the digest.
    pub fn id(&self) -> IdentityResult<&str> {
        if let Some(id) = self.id.get() {
            return Ok(id);
        }
        let id = self.identifier.generate(self)?;
        Ok(self.id.get_or_init(|| id))
    }

    /// The id when derivable, the path otherwise
    pub fn identity(&self) -> Cow<'_, str> {
        match self.id() {
            Ok(id) => Cow::Borrowed(id),
            Err(_) => self.path.to_string_lossy(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Add an embedded document under `parent` (`None` for the root)
    ///
    /// The embed's id is derived immediately from its parent's id, so the
    /// parent must be identifiable at this point.
    pub fn add_embed(&mut self, parent: Option<EmbedId>, metadata: Metadata) -> IdentityResult<EmbedId> {
        let (parent_id, ordinal) = match parent {
            None => (self.id()?.to_string(), self.children.len()),
            Some(slot) => {
                let node = self
                    .embeds
                    .get(slot.0)
                    .ok_or(IdentityError::UnknownEmbed(slot.0))?;
                (node.id.clone(), node.children.len())
            }
        };

        let id = self
            .identifier
            .generate_for_embed(&parent_id, &metadata, ordinal)?;
        let key = embed_key(&metadata).map(str::to_string);

        let slot = EmbedId(self.embeds.len());
        self.embeds.push(Embed {
            id,
            parent,
            parent_id,
            metadata,
            children: Vec::new(),
            lookup: HashMap::new(),
        });

        let (children, lookup) = match parent {
            None => (&mut self.children, &mut self.lookup),
            Some(p) => {
                let node = &mut self.embeds[p.0];
                (&mut node.children, &mut node.lookup)
            }
        };
        children.push(slot);
        if let Some(key) = key {
            lookup.entry(key).or_insert(slot);
        }

        Ok(slot)
    }

    pub fn embed(&self, slot: EmbedId) -> Option<&Embed> {
        self.embeds.get(slot.0)
    }

    /// Direct children of `parent` (`None` for the root), in insertion order
    pub fn children(&self, parent: Option<EmbedId>) -> &[EmbedId] {
        match parent {
            None => &self.children,
            Some(slot) => self
                .embeds
                .get(slot.0)
                .map(|e| e.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    /// Find a child of `parent` by relationship id or resource name
    pub fn lookup(&self, parent: Option<EmbedId>, key: &str) -> Option<EmbedId> {
        match parent {
            None => self.lookup.get(key).copied(),
            Some(slot) => self.embeds.get(slot.0)?.lookup.get(key).copied(),
        }
    }

    /// All embeds, in discovery order
    pub fn embeds(&self) -> impl Iterator<Item = (EmbedId, &Embed)> {
        self.embeds.iter().enumerate().map(|(i, e)| (EmbedId(i), e))
    }

    pub fn embed_count(&self) -> usize {
        self.embeds.len()
    }

    /// Wire form for queue backends
    pub fn to_record(&self) -> DocumentRecord {
        DocumentRecord {
            path: self.path.clone(),
            size: self.size,
            foreign_id: self.foreign_id.clone(),
        }
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Document {}

/// Creates documents bound to the configured identifier
#[derive(Debug, Clone)]
pub struct DocumentFactory {
    identifier: Arc<dyn Identifier>,
}

impl DocumentFactory {
    pub fn new(identifier: Arc<dyn Identifier>) -> Self {
        Self { identifier }
    }

    pub fn create(&self, path: impl Into<PathBuf>, size: Option<u64>) -> Document {
        Document::new(path, size, Arc::clone(&self.identifier))
    }

    /// Rebuild a document from its queued form
    pub fn restore(&self, record: DocumentRecord) -> Document {
        let mut doc = self.create(record.path, record.size);
        doc.foreign_id = record.foreign_id;
        doc
    }

    pub fn identifier(&self) -> &Arc<dyn Identifier> {
        &self.identifier
    }
}

impl Default for DocumentFactory {
    fn default() -> Self {
        Self::new(Arc::new(crate::identity::PathIdentifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DigestAlgorithm, DigestIdentifier, PathIdentifier};

    fn named(name: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(RESOURCE_NAME.to_string(), name.into());
        metadata
    }

    #[test]
    fn test_id_is_memoized() {
        let factory = DocumentFactory::default();
        let doc = factory.create("/data/a.txt", Some(5));
        let first = doc.id().unwrap().as_ptr();
        let second = doc.id().unwrap().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn test_equality_follows_id() {
        let factory = DocumentFactory::default();
        let a = factory.create("/data/a.txt", Some(5));
        let b = factory.create("/data/a.txt", None);
        let c = factory.create("/data/c.txt", Some(5));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_embed_tree() {
        let mut doc = Document::new("/mail/1.eml", None, Arc::new(PathIdentifier));

        let attachment = doc.add_embed(None, named("report.zip")).unwrap();
        let inner = doc.add_embed(Some(attachment), named("q3.xlsx")).unwrap();
        let logo = doc.add_embed(None, named("logo.png")).unwrap();

        assert_eq!(doc.children(None), &[attachment, logo]);
        assert_eq!(doc.children(Some(attachment)), &[inner]);
        assert_eq!(doc.lookup(None, "logo.png"), Some(logo));
        assert_eq!(doc.lookup(Some(attachment), "q3.xlsx"), Some(inner));

        let inner = doc.embed(inner).unwrap();
        assert_eq!(inner.id(), "/mail/1.eml/report.zip/q3.xlsx");
        assert_eq!(inner.parent(), Some(attachment));
        assert_eq!(inner.parent_id(), "/mail/1.eml/report.zip");
    }

    #[test]
    fn test_lookup_prefers_relationship_id() {
        let mut doc = Document::new("/doc.docx", None, Arc::new(PathIdentifier));
        let mut metadata = named("image1.png");
        metadata.insert(RELATIONSHIP_ID.to_string(), "rId7".into());

        let slot = doc.add_embed(None, metadata).unwrap();
        assert_eq!(doc.lookup(None, "rId7"), Some(slot));
        assert_eq!(doc.lookup(None, "image1.png"), None);
    }

    #[test]
    fn test_embed_requires_identifiable_parent() {
        let identifier = Arc::new(DigestIdentifier::with_algorithm(DigestAlgorithm::Sha256));
        let mut doc = Document::new("/a.bin", None, identifier);
        assert!(doc.add_embed(None, named("x")).is_err());
        assert!(matches!(
            doc.add_embed(Some(EmbedId(4)), named("x")),
            Err(IdentityError::UnknownEmbed(4))
        ));
    }

    #[test]
    fn test_record_restore() {
        let factory = DocumentFactory::default();
        let mut doc = factory.create("/data/b.txt", Some(42));
        doc.set_foreign_id("ext-1");

        let json = serde_json::to_string(&doc.to_record()).unwrap();
        let restored = factory.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.path(), Path::new("/data/b.txt"));
        assert_eq!(restored.size(), Some(42));
        assert_eq!(restored.foreign_id(), Some("ext-1"));
        assert_eq!(restored, doc);
    }

    #[test]
    fn test_metadata_value_serde() {
        let mut metadata = Metadata::new();
        metadata.insert("author".into(), "ada".into());
        metadata.insert("tags".into(), vec!["a".to_string(), "b".to_string()].into());

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"author":"ada","tags":["a","b"]}"#);
        assert_eq!(metadata["tags"].first(), Some("a"));
    }
}
