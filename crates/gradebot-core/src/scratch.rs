//! Scratch storage for uploaded bytes.
//!
//! Uploaded files are written to a named temp file so the extractors
//! can read them from disk. [`ScratchFile`] owns the underlying
//! `NamedTempFile`, so removal is guaranteed when the guard drops:
//! on the success path and on every failure path alike.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::CoreError;

/// RAII guard over a scratch copy of an upload.
#[derive(Debug)]
pub(crate) struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    /// Write `bytes` to a fresh temp file carrying the given extension
    /// (extractors dispatch on it).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Io` if the file cannot be created or
    /// written.
    pub(crate) fn write(bytes: &[u8], extension: &str) -> Result<Self, CoreError> {
        let mut file = tempfile::Builder::new()
            .prefix("gradebot-")
            .suffix(&format!(".{extension}"))
            .tempfile()?;

        file.write_all(bytes)?;
        file.flush()?;

        Ok(Self { file })
    }

    /// Path of the scratch copy, valid until the guard drops.
    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }
}
