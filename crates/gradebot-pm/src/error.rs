use thiserror::Error;

#[derive(Debug, Error)]
pub enum PmError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("render failed for {name}: {reason}")]
    Render { name: String, reason: String },

    #[error("invalid template {name}: {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
