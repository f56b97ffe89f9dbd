//! Event types exchanged with the messaging gateway.
//!
//! The gateway (Telegram adapter, console driver, tests) talks to the
//! engine exclusively through [`BotHandle`]: inbound chat events go in
//! via [`submit()`](BotHandle::submit), outbound messages come back via
//! [`next()`](BotHandle::next). Transport framing, delivery, and
//! rendering stay on the gateway side.

use tokio::sync::mpsc;

use crate::error::CoreError;

// ── Identifiers ──────────────────────────────────────────────

/// Opaque identifier of one conversation (chat) on the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub i64);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Inbound events ───────────────────────────────────────────

/// A chat event delivered by the gateway.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A slash command.
    Command(Command),

    /// A button press carrying the opaque payload the button was
    /// created with (see [`CallbackAction`]).
    Callback(String),

    /// A free-text message.
    Text(String),

    /// A file upload.
    Document(DocumentUpload),
}

/// Recognized chat commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Greeting and usage summary.
    Start,
    /// Detailed help.
    Help,
    /// Show the model menu.
    ChooseModel,
    /// Show the parameter menu.
    ChooseParams,
    /// Show the current grading prompt with an edit button.
    EditPrompt,
    /// Drop any pending input-awaiting state.
    Cancel,
}

/// An uploaded file: name, the size the gateway declared, and the
/// retrieved bytes.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    /// File name as shown by the sender.
    pub file_name: String,

    /// Size declared by the gateway, in bytes. Checked against the
    /// configured ceiling before anything else happens.
    pub declared_size: u64,

    /// The retrieved file content.
    pub bytes: Vec<u8>,
}

/// An inbound event together with the conversation it belongs to.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Conversation the event arrived on.
    pub conversation: ConversationId,

    /// The event itself.
    pub event: InboundEvent,
}

// ── Callback payloads ────────────────────────────────────────

/// Typed form of a button payload.
///
/// Menus encode an action into the opaque payload string and the
/// gateway echoes it back on press; [`decode`](CallbackAction::decode)
/// recovers the action. Payloads the engine never produced decode to
/// `None` and are answered with a polite error instead of a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    /// Show help.
    Help,
    /// Start editing the grading prompt.
    EditPrompt,
    /// Switch the active model.
    Model(String),
    /// Start editing the named sampling parameter.
    Parameter(String),
}

impl CallbackAction {
    /// Encode this action into a button payload string.
    pub fn encode(&self) -> String {
        match self {
            Self::Help => "help".to_owned(),
            Self::EditPrompt => "edit-prompt".to_owned(),
            Self::Model(id) => format!("model:{id}"),
            Self::Parameter(name) => format!("param:{name}"),
        }
    }

    /// Decode a button payload string back into an action.
    pub fn decode(raw: &str) -> Option<Self> {
        if raw == "help" {
            return Some(Self::Help);
        }
        if raw == "edit-prompt" {
            return Some(Self::EditPrompt);
        }
        if let Some(id) = raw.strip_prefix("model:") {
            return Some(Self::Model(id.to_owned()));
        }
        if let Some(name) = raw.strip_prefix("param:") {
            return Some(Self::Parameter(name.to_owned()));
        }
        None
    }
}

// ── Outbound messages ────────────────────────────────────────

/// One button in an inline menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuButton {
    /// Text shown on the button.
    pub label: String,

    /// Opaque payload echoed back in a [`InboundEvent::Callback`].
    pub payload: String,
}

impl MenuButton {
    /// Build a button for a typed callback action.
    pub fn for_action(label: impl Into<String>, action: &CallbackAction) -> Self {
        Self {
            label: label.into(),
            payload: action.encode(),
        }
    }
}

/// A message for the gateway to deliver.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Conversation to deliver to.
    pub conversation: ConversationId,

    /// Message body (plain text; markup has been stripped upstream).
    pub body: String,

    /// Optional inline menu, one button per row.
    pub menu: Option<Vec<MenuButton>>,
}

impl OutboundMessage {
    /// Plain text message.
    pub fn text(conversation: ConversationId, body: impl Into<String>) -> Self {
        Self {
            conversation,
            body: body.into(),
            menu: None,
        }
    }

    /// Text message with an inline menu.
    pub fn with_menu(
        conversation: ConversationId,
        body: impl Into<String>,
        menu: Vec<MenuButton>,
    ) -> Self {
        Self {
            conversation,
            body: body.into(),
            menu: Some(menu),
        }
    }
}

// ── Gateway handle ───────────────────────────────────────────

/// Handle for the messaging gateway.
///
/// The gateway pushes inbound chat events with
/// [`submit()`](BotHandle::submit) and drains outbound messages with
/// [`next()`](BotHandle::next). Dropping the handle shuts the
/// dispatcher down once its queues drain.
#[derive(Debug)]
pub struct BotHandle {
    /// Sender for inbound events to the dispatcher.
    event_tx: mpsc::Sender<InboundMessage>,

    /// Receiver for outbound messages from the dispatcher.
    reply_rx: mpsc::Receiver<OutboundMessage>,
}

impl BotHandle {
    /// Create a new handle with the given channels.
    pub(crate) fn new(
        event_tx: mpsc::Sender<InboundMessage>,
        reply_rx: mpsc::Receiver<OutboundMessage>,
    ) -> Self {
        Self { event_tx, reply_rx }
    }

    /// Submit an inbound chat event.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Session` if the dispatcher has shut down and
    /// the event channel is closed.
    pub async fn submit(
        &self,
        conversation: ConversationId,
        event: InboundEvent,
    ) -> Result<(), CoreError> {
        self.event_tx
            .send(InboundMessage {
                conversation,
                event,
            })
            .await
            .map_err(|e| CoreError::Session(format!("failed to submit event: {e}")))
    }

    /// Get the next outbound message.
    ///
    /// Returns `None` when the dispatcher has shut down and the reply
    /// channel has been closed.
    pub async fn next(&mut self) -> Option<OutboundMessage> {
        self.reply_rx.recv().await
    }
}
