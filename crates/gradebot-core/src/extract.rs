//! Content extraction for uploaded submissions.
//!
//! [`FileFormat`] classifies uploads by extension (case-insensitive),
//! [`ContentExtractor`] is the seam for format parsers, and
//! [`ExtractorSet`] dispatches a scratch file to the extractor
//! registered for its format. The default set covers the three allowed
//! formats; deployments can swap any of them through
//! [`register`](ExtractorSet::register).
//!
//! PDF and DOCX parsing is CPU-bound and runs under `spawn_blocking` so
//! other conversations keep progressing during extraction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::debug;

use crate::error::CoreError;

// ── File formats ─────────────────────────────────────────────

/// Submission formats accepted for grading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Pdf,
    Docx,
    Txt,
}

impl FileFormat {
    /// All accepted formats.
    pub const ALL: [FileFormat; 3] = [FileFormat::Pdf, FileFormat::Docx, FileFormat::Txt];

    /// Classify a file by the extension of its name, case-insensitive.
    /// Returns `None` for anything outside the allow-list.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let extension = Path::new(name).extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Txt),
            _ => None,
        }
    }

    /// Canonical lowercase extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Txt => "txt",
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

// ── Extractor seam ───────────────────────────────────────────

/// Turns a file on disk into plain text.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Extract the text content of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Extraction` when the file cannot be parsed.
    async fn extract(&self, path: &Path) -> Result<String, CoreError>;
}

/// Registry mapping formats to their extractors.
#[derive(Default)]
pub struct ExtractorSet {
    extractors: HashMap<FileFormat, Box<dyn ContentExtractor>>,
}

impl ExtractorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set with the built-in txt / pdf / docx extractors.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(FileFormat::Txt, Box::new(PlainTextExtractor));
        set.register(FileFormat::Pdf, Box::new(PdfExtractor));
        set.register(FileFormat::Docx, Box::new(DocxExtractor));
        set
    }

    /// Register (or replace) the extractor for a format.
    pub fn register(&mut self, format: FileFormat, extractor: Box<dyn ContentExtractor>) {
        self.extractors.insert(format, extractor);
    }

    /// Extract text from `path` using the extractor registered for
    /// `format`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Extraction` if no extractor is registered
    /// for the format or the extractor itself fails.
    pub async fn extract(&self, format: FileFormat, path: &Path) -> Result<String, CoreError> {
        let extractor = self
            .extractors
            .get(&format)
            .ok_or_else(|| CoreError::Extraction(format!("no extractor registered for {format}")))?;

        debug!(format = %format, path = %path.display(), "extracting submission text");
        extractor.extract(path).await
    }
}

impl std::fmt::Debug for ExtractorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut formats: Vec<&FileFormat> = self.extractors.keys().collect();
        formats.sort_by_key(|format| format.extension());
        f.debug_struct("ExtractorSet")
            .field("formats", &formats)
            .finish()
    }
}

// ── Built-in extractors ──────────────────────────────────────

/// Reads the file as text, tolerating non-UTF-8 bytes (lossy).
struct PlainTextExtractor;

#[async_trait]
impl ContentExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String, CoreError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CoreError::Extraction(format!("failed to read text file: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Extracts PDF text with `pdf-extract` on the blocking pool.
struct PdfExtractor;

#[async_trait]
impl ContentExtractor for PdfExtractor {
    async fn extract(&self, path: &Path) -> Result<String, CoreError> {
        let path = path.to_path_buf();
        run_blocking(move || {
            pdf_extract::extract_text(&path)
                .map_err(|e| CoreError::Extraction(format!("failed to extract PDF text: {e}")))
        })
        .await
    }
}

/// Extracts DOCX text by walking `word/document.xml` on the blocking
/// pool: `w:t` runs are collected, `w:p` ends become line breaks.
struct DocxExtractor;

#[async_trait]
impl ContentExtractor for DocxExtractor {
    async fn extract(&self, path: &Path) -> Result<String, CoreError> {
        let path = path.to_path_buf();
        run_blocking(move || extract_docx_text(&path)).await
    }
}

/// Run a blocking extraction closure on the blocking pool, flattening
/// the join error into the extraction error.
async fn run_blocking<F>(f: F) -> Result<String, CoreError>
where
    F: FnOnce() -> Result<String, CoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::Extraction(format!("extraction task failed: {e}")))?
}

fn extract_docx_text(path: &PathBuf) -> Result<String, CoreError> {
    let file = std::fs::File::open(path)
        .map_err(|e| CoreError::Extraction(format!("failed to open DOCX file: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::Extraction(format!("not a valid DOCX archive: {e}")))?;

    let mut xml_content = String::new();
    {
        let mut document = archive
            .by_name("word/document.xml")
            .map_err(|_| CoreError::Extraction("missing word/document.xml".to_owned()))?;
        std::io::Read::read_to_string(&mut document, &mut xml_content)
            .map_err(|e| CoreError::Extraction(format!("failed to read document.xml: {e}")))?;
    }

    let mut reader = Reader::from_str(&xml_content);
    reader.config_mut().trim_text(true);

    let mut content = String::new();
    let mut buf = Vec::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Ok(Event::Text(e)) if in_text_run => {
                let text = e
                    .xml_content()
                    .map_err(|err| CoreError::Extraction(format!("XML decode error: {err}")))?;
                content.push_str(&text);
                content.push(' ');
            }
            Ok(Event::End(ref e)) => {
                match e.name().as_ref() {
                    b"w:t" => in_text_run = false,
                    b"w:p" => content.push('\n'),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CoreError::Extraction(format!("XML parsing error: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(content)
}
