//! Event dispatch and conversation handlers.
//!
//! The [`Dispatcher`] fans inbound events out to one worker task per
//! conversation, each with its own queue: events within a conversation
//! run strictly in arrival order, while other conversations keep
//! progressing even when one of them is waiting on the remote model.
//! Idle sessions (and their workers) are swept on a timer.
//!
//! The handlers implement the session state machine: commands and
//! button presses move a session between `Idle`, `AwaitingPrompt`, and
//! `AwaitingParameterValue`; free text is interpreted according to the
//! current mode; uploads run the grading pipeline. Every pipeline
//! error becomes a chat message; nothing here unwinds past the
//! worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::completion::CompletionClient;
use crate::config::{BotConfig, ConfigStore, PARAM_NAMES};
use crate::events::{
    CallbackAction, Command, ConversationId, DocumentUpload, InboundEvent, InboundMessage,
    MenuButton, OutboundMessage,
};
use crate::extract::ExtractorSet;
use crate::grade::{GradeReport, grade_submission};
use crate::session::{SessionMode, SessionStore};

/// Longest interval between idle-session sweeps.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Shared state every conversation worker operates on.
pub(crate) struct HandlerCtx {
    /// Deployment-global model / sampling / rubric configuration.
    pub(crate) config: ConfigStore,

    /// Per-conversation sessions.
    pub(crate) sessions: SessionStore,

    /// Extractors for the allowed submission formats.
    pub(crate) extractors: ExtractorSet,

    /// Remote completion client.
    pub(crate) client: Arc<dyn CompletionClient>,

    /// Static deployment configuration (menus, limits).
    pub(crate) bot: BotConfig,
}

/// Routes inbound events to per-conversation workers.
pub(crate) struct Dispatcher {
    ctx: Arc<HandlerCtx>,
    event_rx: mpsc::Receiver<InboundMessage>,
    reply_tx: mpsc::Sender<OutboundMessage>,
    workers: HashMap<ConversationId, mpsc::UnboundedSender<InboundEvent>>,
}

impl Dispatcher {
    pub(crate) fn new(
        ctx: Arc<HandlerCtx>,
        event_rx: mpsc::Receiver<InboundMessage>,
        reply_tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            ctx,
            event_rx,
            reply_tx,
            workers: HashMap::new(),
        }
    }

    /// Process events until the gateway side drops its handle.
    pub(crate) async fn run(mut self) {
        let ttl = Duration::from_secs(self.ctx.bot.sessions.idle_evict_secs);
        let mut sweep = tokio::time::interval(ttl.min(MAX_SWEEP_PERIOD));

        loop {
            tokio::select! {
                inbound = self.event_rx.recv() => {
                    let Some(InboundMessage { conversation, event }) = inbound else {
                        break;
                    };
                    self.route(conversation, event);
                }
                _ = sweep.tick() => {
                    self.evict_idle(ttl).await;
                }
            }
        }

        info!("gateway handle dropped, dispatcher shutting down");
    }

    /// Hand the event to the conversation's worker, spawning one on
    /// first contact or after eviction.
    fn route(&mut self, conversation: ConversationId, event: InboundEvent) {
        let sender = self
            .workers
            .entry(conversation)
            .or_insert_with(|| spawn_worker(conversation, Arc::clone(&self.ctx), self.reply_tx.clone()));

        if sender.send(event).is_err() {
            // The worker only exits when the reply channel is gone,
            // i.e. the whole bot is shutting down.
            warn!(conversation = %conversation, "worker gone, dropping event");
            self.workers.remove(&conversation);
        }
    }

    /// Evict idle sessions and drop their workers' queues so the tasks
    /// terminate.
    async fn evict_idle(&mut self, ttl: Duration) {
        for conversation in self.ctx.sessions.evict_idle(ttl).await {
            self.workers.remove(&conversation);
        }
    }
}

/// Spawn the worker task for one conversation.
///
/// The queue is unbounded: a bounded queue filling up while the worker
/// awaits a remote call would stall the dispatcher and with it every
/// other conversation.
fn spawn_worker(
    conversation: ConversationId,
    ctx: Arc<HandlerCtx>,
    reply_tx: mpsc::Sender<OutboundMessage>,
) -> mpsc::UnboundedSender<InboundEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        debug!(conversation = %conversation, "worker started");
        while let Some(event) = rx.recv().await {
            if handle_event(&ctx, conversation, event, &reply_tx)
                .await
                .is_err()
            {
                // Reply channel closed; the gateway is gone.
                break;
            }
        }
        debug!(conversation = %conversation, "worker stopped");
    });

    tx
}

// ── Event handlers ───────────────────────────────────────────

/// Handle one inbound event, sending any replies.
///
/// Returns `Err(())` only when the reply channel is closed.
#[instrument(skip(ctx, event, out), fields(conversation = %conversation))]
async fn handle_event(
    ctx: &HandlerCtx,
    conversation: ConversationId,
    event: InboundEvent,
    out: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    match event {
        InboundEvent::Command(command) => handle_command(ctx, conversation, command, out).await,
        InboundEvent::Callback(raw) => handle_callback(ctx, conversation, &raw, out).await,
        InboundEvent::Text(text) => handle_text(ctx, conversation, &text, out).await,
        InboundEvent::Document(upload) => handle_document(ctx, conversation, upload, out).await,
    }
}

async fn handle_command(
    ctx: &HandlerCtx,
    conversation: ConversationId,
    command: Command,
    out: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    match command {
        Command::Start => {
            let limit_mib = ctx.bot.limits.max_file_bytes / 1024 / 1024;
            let body = format!(
                "Hi! I grade lab submissions with an AI model.\n\n\
                 Just send me a file with your work.\n\
                 Supported: PDF, DOCX, TXT (up to {limit_mib} MiB)."
            );
            let menu = vec![MenuButton::for_action("Help", &CallbackAction::Help)];
            send(out, OutboundMessage::with_menu(conversation, body, menu)).await
        }
        Command::Help => send_help(ctx, conversation, out).await,
        Command::ChooseModel => {
            let snapshot = ctx.config.snapshot().await;
            let menu = ctx
                .bot
                .models
                .menu
                .iter()
                .map(|id| {
                    MenuButton::for_action(
                        short_model_name(id),
                        &CallbackAction::Model(id.clone()),
                    )
                })
                .collect();
            let body = format!(
                "Current model:\n{}\n\nPick a new model:",
                snapshot.active_model
            );
            send(out, OutboundMessage::with_menu(conversation, body, menu)).await
        }
        Command::ChooseParams => {
            let listing = ctx
                .config
                .list_parameters()
                .await
                .into_iter()
                .map(|(name, value)| format!("• {name} = {value}"))
                .collect::<Vec<_>>()
                .join("\n");
            let menu = PARAM_NAMES
                .iter()
                .map(|name| {
                    MenuButton::for_action(*name, &CallbackAction::Parameter((*name).to_owned()))
                })
                .collect();
            let body = format!("Current model parameters:\n{listing}\n\nPick one to change:");
            send(out, OutboundMessage::with_menu(conversation, body, menu)).await
        }
        Command::EditPrompt => {
            let snapshot = ctx.config.snapshot().await;
            let current = ctx
                .sessions
                .update(conversation, |session| session.prompt_override.clone())
                .await
                .unwrap_or(snapshot.rubric);
            let menu = vec![MenuButton::for_action(
                "Rewrite prompt",
                &CallbackAction::EditPrompt,
            )];
            let body = format!("Your current grading prompt:\n\n{current}");
            send(out, OutboundMessage::with_menu(conversation, body, menu)).await
        }
        Command::Cancel => {
            let was_pending = ctx
                .sessions
                .update(conversation, |session| {
                    let pending = session.mode != SessionMode::Idle;
                    session.mode = SessionMode::Idle;
                    pending
                })
                .await;
            let body = if was_pending {
                "Cancelled. Nothing is pending now."
            } else {
                "Nothing was pending."
            };
            send(out, OutboundMessage::text(conversation, body)).await
        }
    }
}

async fn handle_callback(
    ctx: &HandlerCtx,
    conversation: ConversationId,
    raw: &str,
    out: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    let Some(action) = CallbackAction::decode(raw) else {
        debug!(payload = raw, "unrecognized callback payload");
        return send(
            out,
            OutboundMessage::text(
                conversation,
                "That button is not recognized. Use the menu commands again.",
            ),
        )
        .await;
    };

    match action {
        CallbackAction::Help => send_help(ctx, conversation, out).await,
        CallbackAction::Model(id) => {
            ctx.config.set_active_model(id.clone()).await;
            info!(model = %id, "active model switched");
            let body = format!("Model switched to:\n{}", short_model_name(&id));
            send(out, OutboundMessage::text(conversation, body)).await
        }
        CallbackAction::Parameter(name) => {
            if !PARAM_NAMES.contains(&name.as_str()) {
                let body = crate::error::CoreError::UnknownParameter(name).user_message();
                return send(out, OutboundMessage::text(conversation, body)).await;
            }
            let current = ctx
                .config
                .snapshot()
                .await
                .sampling
                .get(&name)
                .unwrap_or_default();
            ctx.sessions
                .update(conversation, |session| {
                    session.mode = SessionMode::AwaitingParameterValue(name.clone());
                })
                .await;
            let body = format!("Send a new value for {name} (current: {current}).");
            send(out, OutboundMessage::text(conversation, body)).await
        }
        CallbackAction::EditPrompt => {
            ctx.sessions
                .update(conversation, |session| {
                    session.mode = SessionMode::AwaitingPrompt;
                })
                .await;
            send(
                out,
                OutboundMessage::text(conversation, "Send the new grading prompt text."),
            )
            .await
        }
    }
}

async fn handle_text(
    ctx: &HandlerCtx,
    conversation: ConversationId,
    text: &str,
    out: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    let mode = ctx
        .sessions
        .update(conversation, |session| session.mode.clone())
        .await;

    match mode {
        SessionMode::AwaitingPrompt => {
            ctx.sessions
                .update(conversation, |session| {
                    session.prompt_override = Some(text.to_owned());
                    session.mode = SessionMode::Idle;
                })
                .await;
            info!("personal grading prompt updated");
            send(
                out,
                OutboundMessage::text(conversation, "Your personal grading prompt is updated."),
            )
            .await
        }
        SessionMode::AwaitingParameterValue(name) => {
            match ctx.config.set_parameter(&name, text).await {
                Ok(value) => {
                    ctx.sessions
                        .update(conversation, |session| {
                            session.mode = SessionMode::Idle;
                        })
                        .await;
                    info!(parameter = %name, value, "sampling parameter updated");
                    let body = format!("Parameter {name} set to {value}.");
                    send(out, OutboundMessage::text(conversation, body)).await
                }
                // Bad input keeps the awaiting mode so the user can
                // retry.
                Err(e) => send(out, OutboundMessage::text(conversation, e.user_message())).await,
            }
        }
        SessionMode::Idle => {
            send(
                out,
                OutboundMessage::text(
                    conversation,
                    "Send me a file to grade!\n\n\
                     I don't analyze plain messages, so attach your \
                     submission instead.\nSupported: PDF, DOCX, TXT.",
                ),
            )
            .await
        }
    }
}

async fn handle_document(
    ctx: &HandlerCtx,
    conversation: ConversationId,
    upload: DocumentUpload,
    out: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    let status = format!(
        "Checking your submission...\nFile: {}\n\nThis usually takes a minute or two.",
        upload.file_name
    );
    send(out, OutboundMessage::text(conversation, status)).await?;

    // Snapshot the global configuration now; concurrent changes land
    // in later submissions.
    let snapshot = ctx.config.snapshot().await;
    let prompt_override = ctx
        .sessions
        .update(conversation, |session| session.prompt_override.clone())
        .await;
    let rubric = prompt_override.as_deref().unwrap_or(&snapshot.rubric);

    let outcome = grade_submission(
        &upload,
        rubric,
        &snapshot,
        &ctx.bot.limits,
        &ctx.extractors,
        ctx.client.as_ref(),
    )
    .await;

    match outcome {
        Ok(report) => {
            for message in report_messages(conversation, &report) {
                send(out, message).await?;
            }
            Ok(())
        }
        Err(e) => {
            warn!(file = %upload.file_name, error = %e, "grading failed");
            send(out, OutboundMessage::text(conversation, e.user_message())).await
        }
    }
}

// ── Reply helpers ────────────────────────────────────────────

/// Forward a message, reporting a closed reply channel as `Err(())`.
async fn send(out: &mpsc::Sender<OutboundMessage>, message: OutboundMessage) -> Result<(), ()> {
    out.send(message).await.map_err(|_| ())
}

async fn send_help(
    ctx: &HandlerCtx,
    conversation: ConversationId,
    out: &mpsc::Sender<OutboundMessage>,
) -> Result<(), ()> {
    let limit_mib = ctx.bot.limits.max_file_bytes / 1024 / 1024;
    let body = format!(
        "How it works:\n\
         1. Send me a file with your submission\n\
         2. Wait while the model reviews it (1-2 minutes)\n\
         3. Get a detailed evaluation with a score\n\n\
         Supported formats: PDF, DOCX, TXT (up to {limit_mib} MiB)\n\n\
         Commands:\n\
         /newmodel - switch the grading model\n\
         /newparams - tune the sampling parameters\n\
         /newprompt - view or rewrite the grading prompt\n\
         /cancel - drop a pending edit"
    );
    send(out, OutboundMessage::text(conversation, body)).await
}

/// Format a grade report as outbound messages: a summary, then the
/// evaluation in one message per chunk (numbered when there are
/// several).
fn report_messages(conversation: ConversationId, report: &GradeReport) -> Vec<OutboundMessage> {
    let mut messages = vec![OutboundMessage::text(
        conversation,
        format!(
            "Done!\nFile: {}\nSize: {:.1} KiB\nCharacters: {}\nModel: {}",
            report.file_name,
            report.byte_size as f64 / 1024.0,
            report.char_count,
            short_model_name(&report.model),
        ),
    )];

    let total = report.chunks.len();
    for (index, chunk) in report.chunks.iter().enumerate() {
        let body = if total == 1 {
            format!("Evaluation:\n\n{chunk}")
        } else if index == 0 {
            format!("Evaluation (part 1/{total}):\n\n{chunk}")
        } else {
            format!("Continued ({}/{total}):\n\n{chunk}", index + 1)
        };
        messages.push(OutboundMessage::text(conversation, body));
    }

    messages
}

/// Short display name for a model id: the part after the vendor prefix
/// and before any `:variant` suffix.
fn short_model_name(id: &str) -> &str {
    let tail = id.rsplit_once('/').map_or(id, |(_, tail)| tail);
    tail.split_once(':').map_or(tail, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::completion::CompletionRequest;
    use crate::config::{ModelSettings, SamplingParams};
    use crate::error::CoreError;

    /// Replies with canned text for every completion call.
    struct StaticClient(String);

    #[async_trait]
    impl CompletionClient for StaticClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, CoreError> {
            Ok(self.0.clone())
        }
    }

    fn ctx(reply: &str) -> HandlerCtx {
        let bot = BotConfig::default();
        HandlerCtx {
            config: ConfigStore::new(ModelSettings {
                active_model: bot.models.initial.clone(),
                sampling: bot.sampling.clone(),
                rubric: "RUBRIC".to_owned(),
            }),
            sessions: SessionStore::new(),
            extractors: ExtractorSet::with_defaults(),
            client: Arc::new(StaticClient(reply.to_owned())),
            bot,
        }
    }

    /// Run one event through the handler and collect its replies.
    async fn drive(
        ctx: &HandlerCtx,
        conversation: ConversationId,
        event: InboundEvent,
    ) -> Vec<OutboundMessage> {
        let (tx, mut rx) = mpsc::channel(64);
        handle_event(ctx, conversation, event, &tx)
            .await
            .expect("reply channel should stay open");
        drop(tx);

        let mut replies = Vec::new();
        while let Some(message) = rx.recv().await {
            replies.push(message);
        }
        replies
    }

    #[tokio::test]
    async fn test_should_offer_model_menu_with_short_names() {
        let ctx = ctx("ok");
        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Command(Command::ChooseModel),
        )
        .await;

        assert_eq!(replies.len(), 1);
        let menu = replies[0].menu.as_ref().expect("should carry a menu");
        assert_eq!(menu.len(), 4);
        assert_eq!(menu[0].label, "llama-4-maverick");
        assert_eq!(menu[0].payload, "model:meta-llama/llama-4-maverick:free");
    }

    #[tokio::test]
    async fn test_should_switch_model_through_callback() {
        let ctx = ctx("ok");
        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Callback("model:deepseek/deepseek-chat-v3-0324:free".to_owned()),
        )
        .await;

        assert!(replies[0].body.contains("deepseek-chat-v3-0324"));
        assert_eq!(
            ctx.config.snapshot().await.active_model,
            "deepseek/deepseek-chat-v3-0324:free"
        );
    }

    #[tokio::test]
    async fn test_should_update_parameter_and_return_to_idle() {
        let ctx = ctx("ok");
        let conversation = ConversationId(1);

        drive(
            &ctx,
            conversation,
            InboundEvent::Callback("param:temperature".to_owned()),
        )
        .await;
        let replies = drive(&ctx, conversation, InboundEvent::Text("0.7".to_owned())).await;

        assert!(replies[0].body.contains("temperature set to 0.7"));
        assert_eq!(ctx.config.snapshot().await.sampling.temperature, 0.7);

        let session = ctx.sessions.get(conversation).await.expect("should exist");
        assert_eq!(session.mode, SessionMode::Idle);
    }

    #[tokio::test]
    async fn test_should_keep_awaiting_mode_on_invalid_number() {
        let ctx = ctx("ok");
        let conversation = ConversationId(1);

        drive(
            &ctx,
            conversation,
            InboundEvent::Callback("param:temperature".to_owned()),
        )
        .await;
        let replies = drive(&ctx, conversation, InboundEvent::Text("abc".to_owned())).await;

        assert!(replies[0].body.contains("not a number"));
        // Value untouched, mode still awaiting so the user can retry.
        assert_eq!(ctx.config.snapshot().await.sampling.temperature, 0.1);
        let session = ctx.sessions.get(conversation).await.expect("should exist");
        assert_eq!(
            session.mode,
            SessionMode::AwaitingParameterValue("temperature".to_owned())
        );

        // A corrected value then succeeds.
        let replies = drive(&ctx, conversation, InboundEvent::Text("0.5".to_owned())).await;
        assert!(replies[0].body.contains("set to 0.5"));
        assert_eq!(ctx.config.snapshot().await.sampling.temperature, 0.5);
    }

    #[tokio::test]
    async fn test_should_store_prompt_override_per_conversation() {
        let ctx = ctx("ok");

        // Conversation 1 edits its prompt; conversation 2 is waiting on
        // a parameter value at the same time.
        drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Callback("edit-prompt".to_owned()),
        )
        .await;
        drive(
            &ctx,
            ConversationId(2),
            InboundEvent::Callback("param:top_p".to_owned()),
        )
        .await;

        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Text("Grade strictly.".to_owned()),
        )
        .await;
        assert!(replies[0].body.contains("updated"));

        let one = ctx.sessions.get(ConversationId(1)).await.expect("exists");
        assert_eq!(one.prompt_override.as_deref(), Some("Grade strictly."));
        assert_eq!(one.mode, SessionMode::Idle);

        // Conversation 2 is untouched by conversation 1's text.
        let two = ctx.sessions.get(ConversationId(2)).await.expect("exists");
        assert_eq!(
            two.mode,
            SessionMode::AwaitingParameterValue("top_p".to_owned())
        );
        assert!(two.prompt_override.is_none());
    }

    #[tokio::test]
    async fn test_should_treat_idle_text_as_upload_notice() {
        let ctx = ctx("ok");
        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Text("hello bot".to_owned()),
        )
        .await;

        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.contains("Send me a file"));
    }

    #[tokio::test]
    async fn test_should_cancel_pending_edit() {
        let ctx = ctx("ok");
        let conversation = ConversationId(1);

        drive(
            &ctx,
            conversation,
            InboundEvent::Callback("edit-prompt".to_owned()),
        )
        .await;
        let replies = drive(
            &ctx,
            conversation,
            InboundEvent::Command(Command::Cancel),
        )
        .await;

        assert!(replies[0].body.contains("Cancelled"));
        let session = ctx.sessions.get(conversation).await.expect("exists");
        assert_eq!(session.mode, SessionMode::Idle);

        // Cancelling again reports that nothing was pending.
        let replies = drive(
            &ctx,
            conversation,
            InboundEvent::Command(Command::Cancel),
        )
        .await;
        assert!(replies[0].body.contains("Nothing was pending"));
    }

    #[tokio::test]
    async fn test_should_answer_unknown_callback_politely() {
        let ctx = ctx("ok");
        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Callback("np".to_owned()),
        )
        .await;

        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.contains("not recognized"));
    }

    #[tokio::test]
    async fn test_should_grade_document_and_report_result() {
        let ctx = ctx("<b>Score: 85</b>");
        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Document(DocumentUpload {
                file_name: "lab1.txt".to_owned(),
                declared_size: 11,
                bytes: b"print('hi')".to_vec(),
            }),
        )
        .await;

        // Status, summary, single evaluation message.
        assert_eq!(replies.len(), 3);
        assert!(replies[0].body.contains("Checking"));
        assert!(replies[1].body.contains("Characters: 11"));
        assert!(replies[2].body.contains("Score: 85"));
        assert!(!replies[2].body.contains("<b>"));
    }

    #[tokio::test]
    async fn test_should_report_grading_error_as_message() {
        let ctx = ctx("ok");
        let replies = drive(
            &ctx,
            ConversationId(1),
            InboundEvent::Document(DocumentUpload {
                file_name: "notes.exe".to_owned(),
                declared_size: 4,
                bytes: b"data".to_vec(),
            }),
        )
        .await;

        assert_eq!(replies.len(), 2);
        assert!(replies[1].body.contains("Unsupported format"));
    }

    #[tokio::test]
    async fn test_should_number_multipart_evaluations() {
        let report = GradeReport {
            file_name: "lab.txt".to_owned(),
            byte_size: 9,
            char_count: 9,
            model: "qwen/qwen3-235b-a22b:free".to_owned(),
            chunks: vec!["first".to_owned(), "second".to_owned()],
        };

        let messages = report_messages(ConversationId(1), &report);

        assert_eq!(messages.len(), 3);
        assert!(messages[1].body.starts_with("Evaluation (part 1/2):"));
        assert!(messages[2].body.starts_with("Continued (2/2):"));
    }

    #[test]
    fn test_should_shorten_model_names() {
        assert_eq!(
            short_model_name("meta-llama/llama-4-maverick:free"),
            "llama-4-maverick"
        );
        assert_eq!(short_model_name("gpt-4o"), "gpt-4o");
        assert_eq!(short_model_name("vendor/model"), "model");
    }
}
