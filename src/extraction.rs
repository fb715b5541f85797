//! Extraction and spew capabilities
//!
//! An [`Extractor`] turns a queued document into a content reader, filling
//! in the document's metadata (and any embedded parts) as a side effect. A
//! [`Spewer`] ships that content somewhere. Real parsers and sinks live
//! outside this crate; the plain-text extractor and the print spewer here
//! are enough to run the pipeline end to end.

use crate::document::{Document, CONTENT_LENGTH, CONTENT_TYPE};
use crate::error::{ExtractionError, ExtractionErrorKind, SpewError};
use crate::identity::DigestAlgorithm;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

/// Result type alias for ExtractionError
pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;

/// Extracted content, read by the spewer
pub type ContentReader = Box<dyn Read + Send>;

/// Number of leading bytes used to sniff binary formats
const SNIFF_LEN: usize = 8192;

/// Text/metadata extraction capability
pub trait Extractor: Send + Sync {
    /// Extract `doc`, recording its metadata and embeds on the document
    fn extract(&self, doc: &mut Document) -> ExtractionResult<ContentReader>;
}

/// Content sink capability
pub trait Spewer: Send + Sync {
    fn write(&self, doc: &Document, content: &mut dyn Read) -> Result<(), SpewError>;

    fn write_metadata(&self, doc: &Document) -> Result<(), SpewError>;
}

/// Reads UTF-8 text files
///
/// The content digest is computed here, once, from the bytes already in
/// memory; digest-based identifiers read it back from metadata.
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor {
    algorithm: DigestAlgorithm,
    max_bytes: Option<u64>,
}

impl PlainTextExtractor {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            max_bytes: None,
        }
    }

    /// Refuse files larger than `max_bytes`
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    fn read(&self, path: &Path) -> ExtractionResult<Vec<u8>> {
        if let Some(max) = self.max_bytes {
            let len = fs::metadata(path)
                .map_err(|e| ExtractionError::from_io(path, &e))?
                .len();
            if len > max {
                return Err(ExtractionError::new(
                    ExtractionErrorKind::UnsupportedFormat,
                    path,
                    format!("{} bytes exceeds the {} byte limit", len, max),
                ));
            }
        }
        fs::read(path).map_err(|e| ExtractionError::from_io(path, &e))
    }
}

impl Extractor for PlainTextExtractor {
    fn extract(&self, doc: &mut Document) -> ExtractionResult<ContentReader> {
        let bytes = self.read(doc.path())?;

        let header = &bytes[..bytes.len().min(SNIFF_LEN)];
        if let Some(kind) = infer::get(header).filter(|k| k.matcher_type() != infer::MatcherType::Text) {
            return Err(ExtractionError::new(
                ExtractionErrorKind::UnsupportedFormat,
                doc.path(),
                format!("binary content ({})", kind.mime_type()),
            ));
        }

        if let Err(e) = std::str::from_utf8(&bytes) {
            return Err(ExtractionError::new(
                ExtractionErrorKind::Parse,
                doc.path(),
                format!("not valid UTF-8: {}", e),
            ));
        }

        doc.set_metadata(self.algorithm.metadata_key(), self.algorithm.digest_hex(&bytes));
        doc.set_metadata(CONTENT_TYPE, "text/plain; charset=UTF-8");
        doc.set_metadata(CONTENT_LENGTH, bytes.len().to_string());

        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Writes each document as an `id<TAB>path` header followed by its text
pub struct PrintSpewer<W: Write + Send> {
    out: Mutex<W>,
}

impl PrintSpewer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> PrintSpewer<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn spew_err(doc: &Document, source: io::Error) -> SpewError {
        SpewError {
            path: doc.path().to_path_buf(),
            source,
        }
    }
}

impl<W: Write + Send> Spewer for PrintSpewer<W> {
    fn write(&self, doc: &Document, content: &mut dyn Read) -> Result<(), SpewError> {
        // Read before locking so one slow document doesn't stall other writers
        let mut text = Vec::new();
        content
            .read_to_end(&mut text)
            .map_err(|e| Self::spew_err(doc, e))?;

        write_text(&mut *self.out.lock(), doc, &text).map_err(|e| Self::spew_err(doc, e))
    }

    fn write_metadata(&self, doc: &Document) -> Result<(), SpewError> {
        write_metadata_block(&mut *self.out.lock(), doc).map_err(|e| Self::spew_err(doc, e))
    }
}

fn write_header(out: &mut impl Write, doc: &Document) -> io::Result<()> {
    writeln!(out, "{}\t{}", doc.identity(), doc.path().display())
}

fn write_text(out: &mut impl Write, doc: &Document, text: &[u8]) -> io::Result<()> {
    write_header(out, doc)?;
    out.write_all(text)?;
    if !text.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    out.flush()
}

fn write_metadata_block(out: &mut impl Write, doc: &Document) -> io::Result<()> {
    write_header(out, doc)?;
    for (key, value) in doc.metadata() {
        writeln!(out, "  {}: {}", key, value.values().join(", "))?;
    }
    for (_, embed) in doc.embeds() {
        writeln!(out, "  embedded: {} (parent {})", embed.id(), embed.parent_id())?;
    }
    out.flush()
}

/// Reads and discards content; for dry runs and benchmarks
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSpewer;

impl Spewer for DiscardSpewer {
    fn write(&self, doc: &Document, content: &mut dyn Read) -> Result<(), SpewError> {
        io::copy(content, &mut io::sink())
            .map(|_| ())
            .map_err(|source| SpewError {
                path: doc.path().to_path_buf(),
                source,
            })
    }

    fn write_metadata(&self, _doc: &Document) -> Result<(), SpewError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFactory;
    use crate::identity::DigestIdentifier;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_extract_records_digest_once() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.txt", b"hello docsweep\n");

        let algorithm = DigestAlgorithm::Sha256;
        let factory = DocumentFactory::new(Arc::new(DigestIdentifier::with_algorithm(algorithm)));
        let mut doc = factory.create(&path, Some(15));
        assert!(doc.id().is_err());

        let mut content = PlainTextExtractor::new(algorithm).extract(&mut doc).unwrap();
        let mut text = String::new();
        content.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello docsweep\n");

        let expected = algorithm.digest_hex(b"hello docsweep\n");
        assert_eq!(doc.id().unwrap(), expected);
        assert_eq!(
            doc.metadata().get(CONTENT_LENGTH).and_then(|v| v.first()),
            Some("15")
        );
    }

    #[test]
    fn test_extract_failure_kinds() {
        let dir = TempDir::new().unwrap();
        let extractor = PlainTextExtractor::default();
        let factory = DocumentFactory::default();

        let mut missing = factory.create(dir.path().join("gone.txt"), None);
        let err = extractor.extract(&mut missing).err().unwrap();
        assert_eq!(err.kind, ExtractionErrorKind::NotFound);

        let bad_utf8 = write(&dir, "latin1.txt", &[0x63, 0x61, 0x66, 0xE9, 0x0A]);
        let err = extractor.extract(&mut factory.create(bad_utf8, None)).err().unwrap();
        assert_eq!(err.kind, ExtractionErrorKind::Parse);

        let png = write(&dir, "img.txt", &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
        let err = extractor.extract(&mut factory.create(png, None)).err().unwrap();
        assert_eq!(err.kind, ExtractionErrorKind::UnsupportedFormat);
        assert!(err.message.contains("image/png"));
    }

    #[test]
    fn test_extract_size_limit() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "big.txt", &[b'x'; 64]);
        let extractor = PlainTextExtractor::default().with_max_bytes(16);

        let err = extractor
            .extract(&mut DocumentFactory::default().create(path, None))
            .err()
            .unwrap();
        assert_eq!(err.kind, ExtractionErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_print_spewer_output() {
        let spewer = PrintSpewer::new(Vec::new());
        let doc = DocumentFactory::default().create("/data/a.txt", None);

        spewer.write(&doc, &mut Cursor::new(b"line one".to_vec())).unwrap();
        let out = String::from_utf8(spewer.into_inner()).unwrap();
        assert_eq!(out, "/data/a.txt\t/data/a.txt\nline one\n");
    }

    #[test]
    fn test_print_spewer_metadata() {
        let spewer = PrintSpewer::new(Vec::new());
        let mut doc = DocumentFactory::default().create("/data/a.txt", None);
        doc.set_metadata(CONTENT_TYPE, "text/plain");

        spewer.write_metadata(&doc).unwrap();
        let out = String::from_utf8(spewer.into_inner()).unwrap();
        assert!(out.contains("  content-type: text/plain\n"));
    }
}
