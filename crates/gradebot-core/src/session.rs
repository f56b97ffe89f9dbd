//! Per-conversation session state.
//!
//! A [`Session`] tracks which input the conversation is waiting for
//! (the mode state machine) and an optional personal rubric override.
//! Sessions live in a [`SessionStore`], created lazily on first contact
//! and evicted after a configurable idle period so the map cannot grow
//! without bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::events::ConversationId;

/// What the conversation's next text message means.
///
/// At most one mode is active; entering an awaiting mode replaces any
/// previous pending selection, and every successful update (or an
/// explicit cancel) returns the session to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Nothing pending; free text gets the "send a file" notice.
    #[default]
    Idle,

    /// The next text message becomes the personal rubric override.
    AwaitingPrompt,

    /// The next text message is parsed as the new value for the named
    /// sampling parameter. Parse failure keeps this mode so the user
    /// can retry.
    AwaitingParameterValue(String),
}

/// Mutable per-conversation state.
#[derive(Debug, Clone)]
pub struct Session {
    /// Conversation this session belongs to.
    pub conversation: ConversationId,

    /// Current input-awaiting mode.
    pub mode: SessionMode,

    /// Personal rubric override; `None` means the deployment default.
    pub prompt_override: Option<String>,

    /// Last time an event touched this session, for idle eviction.
    last_activity: Instant,
}

impl Session {
    fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            mode: SessionMode::Idle,
            prompt_override: None,
            last_activity: Instant::now(),
        }
    }

    /// How long since this session last saw an event.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Mutex-guarded map of conversation id to session.
///
/// Sessions are created lazily by [`update`](SessionStore::update) and
/// never explicitly destroyed by handlers; [`evict_idle`]
/// (SessionStore::evict_idle) bounds memory growth instead.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<ConversationId, Session>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the conversation's session, creating it first if
    /// this is the conversation's first contact. The whole
    /// read-modify-write is atomic and refreshes the activity
    /// timestamp.
    pub async fn update<F, R>(&self, conversation: ConversationId, f: F) -> R
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.inner.lock().await;
        let session = sessions
            .entry(conversation)
            .or_insert_with(|| Session::new(conversation));
        session.last_activity = Instant::now();
        f(session)
    }

    /// Copy a session's state without refreshing its activity
    /// timestamp. Returns `None` for conversations never seen.
    pub async fn get(&self, conversation: ConversationId) -> Option<Session> {
        self.inner.lock().await.get(&conversation).cloned()
    }

    /// Remove sessions idle longer than `ttl`; returns the evicted
    /// conversation ids so the dispatcher can drop their workers too.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<ConversationId> {
        let mut sessions = self.inner.lock().await;
        let expired: Vec<ConversationId> = sessions
            .values()
            .filter(|s| s.idle_for() > ttl)
            .map(|s| s.conversation)
            .collect();

        for conversation in &expired {
            sessions.remove(conversation);
            debug!(conversation = %conversation, "evicted idle session");
        }
        expired
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
