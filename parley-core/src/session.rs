//! Session records and the in-memory session store.
//!
//! A session is a server-side conversation context keyed by an opaque
//! client-held token. The store owns every live session for its lifetime;
//! nothing outside it holds a session except by handle or identifier.
//!
//! # Locking discipline
//!
//! The directory (`RwLock<HashMap>`) is held only for lookup, insert, and
//! removal, never across an upstream call. Each session carries its own
//! `tokio::sync::Mutex`, which serializes overlapping requests for the
//! same session (e.g. a second browser tab) while leaving other sessions
//! untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Fixed system instruction, always the first turn
    System,
    /// User message
    User,
    /// Assistant (model) response
    Assistant,
}

impl Role {
    /// String form used on the upstream wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// An image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    /// Declared content type after normalization (e.g. `image/png`)
    pub content_type: String,
    /// Canonical encoded bytes
    pub data: Vec<u8>,
}

/// Turn content: plain text, or text plus an image for multimodal turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnContent {
    Text(String),
    Multimodal {
        text: String,
        image: ImageAttachment,
    },
}

impl TurnContent {
    /// The text portion of the content.
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) | Self::Multimodal { text, .. } => text,
        }
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

impl Turn {
    /// Create a plain-text turn.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text(text.into()),
        }
    }

    /// Create a multimodal user turn.
    pub fn multimodal(text: impl Into<String>, image: ImageAttachment) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Multimodal {
                text: text.into(),
                image,
            },
        }
    }
}

/// A conversation session.
///
/// Invariant: `turns[0]` is always the system turn, and the sequence is
/// append-only in exchange order.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    fn new(id: String, system_prompt: &str) -> Self {
        Self {
            id,
            turns: vec![Turn::text(Role::System, system_prompt)],
            last_activity: Utc::now(),
        }
    }

    /// Bump the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Per-session serialization primitive: all turn mutations go through
/// this lock.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Result of resolving a session token.
#[derive(Clone)]
pub struct ResolvedSession {
    pub id: String,
    pub handle: SessionHandle,
    /// True when a fresh session was allocated; the HTTP layer persists
    /// the new identifier in the client cookie.
    pub created: bool,
}

/// In-memory store mapping session identifiers to live sessions.
pub struct SessionStore {
    system_prompt: String,
    entries: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the live session named by `token`, or allocate a new one
    /// with a freshly generated identifier and a single system turn.
    pub async fn resolve_or_create(&self, token: Option<&str>) -> ResolvedSession {
        if let Some(token) = token {
            let entries = self.entries.read().await;
            if let Some(handle) = entries.get(token) {
                return ResolvedSession {
                    id: token.to_string(),
                    handle: Arc::clone(handle),
                    created: false,
                };
            }
        }

        let mut entries = self.entries.write().await;
        // uuid-v4 collisions are not a practical concern, but the insert
        // happens under the write lock so uniqueness holds regardless.
        let mut id = new_token();
        while entries.contains_key(&id) {
            id = new_token();
        }
        let handle = Arc::new(Mutex::new(Session::new(id.clone(), &self.system_prompt)));
        entries.insert(id.clone(), Arc::clone(&handle));
        tracing::debug!(session = %id, "Created session");

        ResolvedSession {
            id,
            handle,
            created: true,
        }
    }

    /// Look up a live session without creating one.
    pub async fn get(&self, token: &str) -> Option<SessionHandle> {
        self.entries.read().await.get(token).map(Arc::clone)
    }

    /// Update the last-activity timestamp of a session.
    pub async fn touch(&self, token: &str) {
        if let Some(handle) = self.get(token).await {
            handle.lock().await.touch();
        }
    }

    /// Remove a session immediately. Returns whether it existed.
    pub async fn destroy(&self, token: &str) -> bool {
        let removed = self.entries.write().await.remove(token).is_some();
        if removed {
            tracing::debug!(session = %token, "Destroyed session");
        }
        removed
    }

    /// Snapshot the identifiers of sessions idle longer than `ttl`.
    ///
    /// Sessions whose lock is currently held are mid-exchange and counted
    /// as active. The read lock is held only for the scan itself.
    pub async fn expired_ids(&self, ttl: Duration) -> Vec<String> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut expired = Vec::new();
        for (id, handle) in entries.iter() {
            let Ok(session) = handle.try_lock() else {
                continue;
            };
            let age = now.signed_duration_since(session.last_activity);
            if age.to_std().map(|age| age > ttl).unwrap_or(false) {
                expired.push(id.clone());
            }
        }
        expired
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}
