//! Grading pipeline implementation.
//!
//! Takes an uploaded submission through the full workflow: size and
//! format checks, a scratch copy on disk, text extraction, prompt
//! assembly, the remote completion call, markup stripping, and
//! pagination into gateway-sized chunks.
//!
//! Every failure comes back as a typed [`CoreError`]; the dispatch
//! layer turns it into a user-facing message, so a bad submission or a
//! dead remote endpoint never takes the process down.
//!
//! # Edge cases
//!
//! - **Declared size vs. actual size**: the ceiling is checked against
//!   the size the gateway declared, before any bytes touch disk.
//! - **Whitespace-only extraction**: treated the same as empty.
//! - **Result of exactly the chunk size**: delivered as one chunk; one
//!   character more makes two.
//! - **Scratch cleanup**: the scratch guard drops on every exit path,
//!   including extraction and remote-call failures.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::completion::{CompletionClient, CompletionRequest};
use crate::config::{LimitsConfig, ModelSettings};
use crate::error::CoreError;
use crate::events::DocumentUpload;
use crate::extract::{ExtractorSet, FileFormat};
use crate::scratch::ScratchFile;

/// Tag-like substrings (`<...>`) stripped from remote output before it
/// reaches the rendering surface.
static MARKUP_TAG: Lazy<Regex> = Lazy::new(|| {
    // The pattern is a literal constant; it always compiles.
    Regex::new(r"<[^>]+>").unwrap_or_else(|e| panic!("invalid markup pattern: {e}"))
});

/// Header label under which the submission text is appended to the
/// rubric.
const CONTENT_LABEL: &str = "SUBMISSION CONTENT:";

/// Outcome of a successful grading run.
#[derive(Debug, Clone)]
pub struct GradeReport {
    /// File name as submitted.
    pub file_name: String,

    /// Declared upload size, in bytes.
    pub byte_size: u64,

    /// Number of characters extracted from the submission.
    pub char_count: usize,

    /// Model that produced the evaluation.
    pub model: String,

    /// Sanitized evaluation text, split into ordered chunks of at most
    /// the configured size. Concatenating the chunks reproduces the
    /// sanitized text exactly.
    pub chunks: Vec<String>,
}

/// Run the full grading pipeline for one uploaded submission.
///
/// `rubric` is the effective grading prompt (the session override when
/// one is set, the deployment default otherwise); `settings` is the
/// configuration snapshot taken when the upload arrived; later
/// configuration changes do not affect this call.
///
/// # Errors
///
/// Returns the pipeline error taxonomy: `FileTooLarge`,
/// `UnsupportedFormat`, `Extraction`, `EmptyContent`, `RemoteCall`.
#[instrument(skip_all, fields(file = %upload.file_name, declared_size = upload.declared_size))]
pub(crate) async fn grade_submission(
    upload: &DocumentUpload,
    rubric: &str,
    settings: &ModelSettings,
    limits: &LimitsConfig,
    extractors: &ExtractorSet,
    client: &dyn CompletionClient,
) -> Result<GradeReport, CoreError> {
    // Size check against the declared size, before anything else.
    if upload.declared_size > limits.max_file_bytes {
        return Err(CoreError::FileTooLarge {
            size: upload.declared_size,
            limit: limits.max_file_bytes,
        });
    }

    // Format check on the extension allow-list.
    let format = FileFormat::from_file_name(&upload.file_name).ok_or_else(|| {
        let extension = upload
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_else(|| "(none)".to_owned());
        CoreError::UnsupportedFormat(extension)
    })?;

    // Scratch copy for the extractor. The guard lives to the end of
    // this function, so the file is removed on every exit path below.
    let scratch = ScratchFile::write(&upload.bytes, format.extension())?;
    debug!(scratch = %scratch.path().display(), "wrote scratch copy");

    let text = extractors.extract(format, scratch.path()).await?;
    if text.trim().is_empty() {
        return Err(CoreError::EmptyContent);
    }
    let char_count = text.chars().count();
    info!(chars = char_count, format = %format, "extracted submission text");

    // Assemble the prompt and call the remote model with the snapshot
    // taken at submission time.
    let prompt = assemble_prompt(rubric, &text);
    let raw = client
        .complete(CompletionRequest {
            model: settings.active_model.clone(),
            prompt,
            params: settings.sampling.clone(),
        })
        .await?;

    let sanitized = sanitize(&raw);
    let chunks = paginate(&sanitized, limits.chunk_chars);
    info!(
        result_chars = sanitized.chars().count(),
        chunks = chunks.len(),
        "grading completed"
    );

    Ok(GradeReport {
        file_name: upload.file_name.clone(),
        byte_size: upload.declared_size,
        char_count,
        model: settings.active_model.clone(),
        chunks,
    })
}

/// Concatenate the rubric with the submission text under the content
/// label.
fn assemble_prompt(rubric: &str, text: &str) -> String {
    format!("{rubric}\n\n{CONTENT_LABEL}\n{text}")
}

/// Strip tag-like substrings and surrounding whitespace from remote
/// output.
pub(crate) fn sanitize(raw: &str) -> String {
    MARKUP_TAG.replace_all(raw, "").trim().to_owned()
}

/// Split `text` into ordered chunks of at most `chunk_chars`
/// characters. Chunks are contiguous and non-overlapping; their
/// concatenation equals `text`. A text within the limit (including the
/// empty string) yields exactly one chunk.
pub(crate) fn paginate(text: &str, chunk_chars: usize) -> Vec<String> {
    if chunk_chars == 0 || text.chars().count() <= chunk_chars {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == chunk_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::SamplingParams;

    /// Test double that records requests and replies with a canned
    /// result (or error).
    struct FakeClient {
        reply: Result<String, String>,
        calls: AtomicUsize,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl FakeClient {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_owned()),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        fn failing(reason: &str) -> Self {
            Self {
                reply: Err(reason.to_owned()),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for FakeClient {
        async fn complete(&self, request: CompletionRequest) -> Result<String, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().expect("lock should not poison") = Some(request);
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(reason) => Err(CoreError::RemoteCall(reason.clone())),
            }
        }
    }

    fn settings() -> ModelSettings {
        ModelSettings {
            active_model: "qwen/qwen3-235b-a22b:free".to_owned(),
            sampling: SamplingParams::default(),
            rubric: "RUBRIC".to_owned(),
        }
    }

    fn txt_upload(content: &str) -> DocumentUpload {
        DocumentUpload {
            file_name: "lab1.txt".to_owned(),
            declared_size: content.len() as u64,
            bytes: content.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_should_reject_oversized_file_before_extraction() {
        let client = FakeClient::replying("unused");
        let upload = DocumentUpload {
            file_name: "big.pdf".to_owned(),
            declared_size: 21 * 1024 * 1024,
            bytes: Vec::new(),
        };

        let result = grade_submission(
            &upload,
            "RUBRIC",
            &settings(),
            &LimitsConfig::default(),
            &ExtractorSet::with_defaults(),
            &client,
        )
        .await;

        assert!(matches!(result, Err(CoreError::FileTooLarge { .. })));
        assert_eq!(client.call_count(), 0, "remote call must not happen");
    }

    #[tokio::test]
    async fn test_should_reject_unsupported_extension() {
        let client = FakeClient::replying("unused");
        let upload = DocumentUpload {
            file_name: "archive.ZIP".to_owned(),
            declared_size: 10,
            bytes: b"0123456789".to_vec(),
        };

        let result = grade_submission(
            &upload,
            "RUBRIC",
            &settings(),
            &LimitsConfig::default(),
            &ExtractorSet::with_defaults(),
            &client,
        )
        .await;

        assert!(matches!(result, Err(CoreError::UnsupportedFormat(ext)) if ext == ".ZIP"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_should_reject_whitespace_only_content() {
        let client = FakeClient::replying("unused");
        let upload = txt_upload("  \n\t  \n");

        let result = grade_submission(
            &upload,
            "RUBRIC",
            &settings(),
            &LimitsConfig::default(),
            &ExtractorSet::with_defaults(),
            &client,
        )
        .await;

        assert!(matches!(result, Err(CoreError::EmptyContent)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_should_grade_txt_submission_end_to_end() {
        let client = FakeClient::replying("<b>Score: 85</b>");
        let upload = txt_upload("print('hi')");

        let report = grade_submission(
            &upload,
            "RUBRIC",
            &settings(),
            &LimitsConfig::default(),
            &ExtractorSet::with_defaults(),
            &client,
        )
        .await
        .expect("grading should succeed");

        assert_eq!(report.file_name, "lab1.txt");
        assert_eq!(report.byte_size, 11);
        assert_eq!(report.char_count, 11);
        assert_eq!(report.model, "qwen/qwen3-235b-a22b:free");
        assert_eq!(report.chunks, vec!["Score: 85".to_owned()]);
        assert_eq!(client.call_count(), 1);

        // The prompt carries the rubric followed by the literal text.
        let request = client
            .last_request
            .lock()
            .expect("lock should not poison")
            .clone()
            .expect("request should be recorded");
        assert!(request.prompt.starts_with("RUBRIC"));
        assert!(request.prompt.contains(CONTENT_LABEL));
        assert!(request.prompt.ends_with("print('hi')"));
    }

    #[tokio::test]
    async fn test_should_surface_remote_failure_as_error_value() {
        let client = FakeClient::failing("connection refused");
        let upload = txt_upload("print('hi')");

        let result = grade_submission(
            &upload,
            "RUBRIC",
            &settings(),
            &LimitsConfig::default(),
            &ExtractorSet::with_defaults(),
            &client,
        )
        .await;

        assert!(matches!(result, Err(CoreError::RemoteCall(_))));
    }

    #[tokio::test]
    async fn test_should_paginate_long_results_in_order() {
        let long = "x".repeat(4100);
        let client = FakeClient::replying(&long);
        let upload = txt_upload("print('hi')");

        let report = grade_submission(
            &upload,
            "RUBRIC",
            &settings(),
            &LimitsConfig::default(),
            &ExtractorSet::with_defaults(),
            &client,
        )
        .await
        .expect("grading should succeed");

        assert_eq!(report.chunks.len(), 2);
        assert_eq!(report.chunks[0].chars().count(), 4000);
        assert_eq!(report.chunks[1].chars().count(), 100);
        assert_eq!(report.chunks.concat(), long);
    }

    #[test]
    fn test_should_strip_markup_tags() {
        assert_eq!(sanitize("<b>Score: 85</b>"), "Score: 85");
        assert_eq!(sanitize("plain text"), "plain text");
        assert_eq!(sanitize("  <i>x</i> and <br/> y  "), "x and  y");
        // A lone angle bracket with no closing partner survives.
        assert_eq!(sanitize("5 < 10"), "5 < 10");
    }

    #[test]
    fn test_should_keep_exact_limit_in_one_chunk() {
        let text = "a".repeat(4000);
        let chunks = paginate(&text, 4000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn test_should_split_one_char_over_limit_into_two_chunks() {
        let text = "a".repeat(4001);
        let chunks = paginate(&text, 4000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4000);
        assert_eq!(chunks[1].chars().count(), 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_should_paginate_by_characters_not_bytes() {
        // Multi-byte characters must not be split mid-codepoint.
        let text = "д".repeat(4001);
        let chunks = paginate(&text, 4000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4000);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_should_return_single_chunk_for_empty_text() {
        assert_eq!(paginate("", 4000), vec![String::new()]);
    }
}
