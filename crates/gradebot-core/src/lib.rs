mod completion;
mod config;
mod engine;
mod error;
mod events;
mod extract;
mod grade;
mod router;
mod scratch;
mod session;

pub use completion::{CompletionClient, CompletionRequest, HttpCompletionClient};
pub use config::{
    BotConfig, ConfigStore, EngineSettings, LimitsConfig, ModelSettings, ModelsConfig,
    PARAM_NAMES, RemoteConfig, SamplingParams, SessionsConfig, load_bot_config,
};
pub use engine::Engine;
pub use error::CoreError;
pub use events::{
    BotHandle, CallbackAction, Command, ConversationId, DocumentUpload, InboundEvent,
    InboundMessage, MenuButton, OutboundMessage,
};
pub use extract::{ContentExtractor, ExtractorSet, FileFormat};
pub use grade::GradeReport;
pub use session::{Session, SessionMode, SessionStore};
