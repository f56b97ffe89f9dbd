use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("submission contains no readable text")]
    EmptyContent,

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("remote call failed: {0}")]
    RemoteCall(String),

    #[error("not a number: {0:?}")]
    InvalidNumberFormat(String),

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("missing credential: {0} is not set")]
    MissingCredentials(&'static str),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("prompt error: {0}")]
    Prompt(#[from] gradebot_pm::PmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("session error: {0}")]
    Session(String),
}

impl CoreError {
    /// Render this error as a chat message: name the problem and
    /// suggest a next action. Every grading-pipeline failure goes
    /// through here instead of crashing the process.
    pub fn user_message(&self) -> String {
        match self {
            Self::FileTooLarge { size, limit } => format!(
                "File too large: {:.1} MiB (the limit is {} MiB). \
                 Try compressing the file or sending a smaller one.",
                *size as f64 / 1024.0 / 1024.0,
                limit / 1024 / 1024,
            ),
            Self::UnsupportedFormat(ext) => format!(
                "Unsupported format: {ext}. \
                 Convert the file to PDF, DOCX, or TXT and resend it."
            ),
            Self::EmptyContent => {
                "The file is empty or contains no readable text. \
                 Check the file and send it again."
                    .to_owned()
            }
            Self::Extraction(reason) => format!(
                "Could not read the file contents: {reason}. \
                 Try exporting the document again and resending it."
            ),
            Self::RemoteCall(reason) => format!(
                "The grading service did not respond: {reason}. \
                 Try again in a few minutes."
            ),
            Self::InvalidNumberFormat(input) => format!(
                "{input:?} is not a number. \
                 Send a numeric value (for example, 0.7 or 1024)."
            ),
            Self::UnknownParameter(name) => format!(
                "There is no parameter named {name}. \
                 Pick one from the parameter menu."
            ),
            other => format!("Something went wrong: {other}. Please try again."),
        }
    }
}
