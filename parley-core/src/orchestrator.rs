//! Completion orchestration.
//!
//! Drives one chat exchange end to end: acquire the session's write
//! serialization, assemble the upstream context, call the model in
//! streaming or single-shot mode, and reconcile the finalized assistant
//! turn into history. History is only mutated after the upstream call
//! succeeds; a failed exchange appends nothing.

use std::sync::Arc;

use futures_util::StreamExt;
use parley_common::config::{LanguageConfig, UpstreamConfig};
use parley_common::Result;
use tokio::sync::mpsc;

use crate::conversation::{
    append_assistant_turn, append_user_turn, build_request_context, user_turn, HistoryPolicy,
};
use crate::language;
use crate::provider::{wire_messages, ChatMessage, CompletionBackend};
use crate::session::{ImageAttachment, ResolvedSession};

/// Events delivered to the HTTP layer during a streaming exchange.
///
/// A successful stream is any number of `Fragment`s followed by exactly
/// one `Done`; a failed stream ends with exactly one `Error` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Fragment(String),
    Done,
    Error(String),
}

/// Request lifecycle, traced per exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    BuildingRequest,
    AwaitingUpstream,
    Streaming,
    SingleShot,
    Finalizing,
    Done,
    Failed,
}

impl Phase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::BuildingRequest => "building_request",
            Self::AwaitingUpstream => "awaiting_upstream",
            Self::Streaming => "streaming",
            Self::SingleShot => "single_shot",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

fn enter(session: &str, phase: Phase) {
    tracing::trace!(session = %session, phase = phase.as_str(), "Request phase");
}

/// Orchestrates chat exchanges against the upstream model.
pub struct Orchestrator {
    backend: Arc<dyn CompletionBackend>,
    upstream: UpstreamConfig,
    policy: HistoryPolicy,
    language: LanguageConfig,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        upstream: UpstreamConfig,
        policy: HistoryPolicy,
        language: LanguageConfig,
    ) -> Self {
        Self {
            backend,
            upstream,
            policy,
            language,
        }
    }

    /// Assemble the wire context: stored history plus the pending user
    /// turn, which is not committed until the exchange succeeds.
    fn assemble(
        &self,
        session: &crate::session::Session,
        pending: &crate::session::Turn,
        lang: &str,
    ) -> Vec<ChatMessage> {
        let mut context = build_request_context(session, self.policy);
        context.push(pending.clone());
        wire_messages(&context, lang)
    }

    /// Run a text-only exchange in streaming mode.
    ///
    /// Returns immediately with the event receiver; a spawned producer
    /// holds the session lock for the duration of the exchange and
    /// forwards each upstream fragment the moment it arrives. Dropping
    /// the receiver (client disconnect) stops the producer and releases
    /// the lock without touching history.
    pub fn chat_stream(&self, session: ResolvedSession, text: String) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(16);
        let backend = Arc::clone(&self.backend);
        let model = self.upstream.model.clone();
        let max_tokens = self.upstream.max_tokens;
        let policy = self.policy;
        let language = self.language.clone();

        tokio::spawn(async move {
            let id = session.id;
            let mut guard = session.handle.lock_owned().await;

            enter(&id, Phase::BuildingRequest);
            let lang = language::detect(&text, &language);
            let pending = user_turn(&text, None);
            let messages = Orchestrator::assemble_static(&guard, &pending, &lang, policy);

            enter(&id, Phase::AwaitingUpstream);
            let stream = match backend.stream(&messages, &model, max_tokens).await {
                Ok(stream) => stream,
                Err(e) => {
                    enter(&id, Phase::Failed);
                    tracing::error!(session = %id, error = %e, "Upstream stream failed to open");
                    let _ = tx.send(ChatEvent::Error(e.to_string())).await;
                    return;
                }
            };

            enter(&id, Phase::Streaming);
            let mut stream = stream;
            let mut accumulated = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(fragment) => {
                        accumulated.push_str(&fragment);
                        if tx.send(ChatEvent::Fragment(fragment)).await.is_err() {
                            // Client went away: stop pulling from upstream
                            // and leave history untouched.
                            tracing::debug!(session = %id, "Client disconnected mid-stream");
                            return;
                        }
                    }
                    Err(e) => {
                        enter(&id, Phase::Failed);
                        tracing::error!(session = %id, error = %e, "Upstream stream failed mid-flight");
                        let _ = tx.send(ChatEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            enter(&id, Phase::Finalizing);
            append_user_turn(&mut guard, &text, None, policy);
            append_assistant_turn(&mut guard, &accumulated, policy);
            guard.touch();

            enter(&id, Phase::Done);
            let _ = tx.send(ChatEvent::Done).await;
        });

        rx
    }

    /// Run a multimodal exchange in single-shot mode with the vision
    /// model and its higher token budget. Returns the formatted
    /// assistant text; on failure nothing is appended to history.
    pub async fn chat_once(
        &self,
        session: &ResolvedSession,
        text: &str,
        image: ImageAttachment,
    ) -> Result<String> {
        let id = &session.id;
        let mut guard = Arc::clone(&session.handle).lock_owned().await;

        enter(id, Phase::BuildingRequest);
        let lang = language::detect(text, &self.language);
        let pending = user_turn(text, Some(image));
        let messages = self.assemble(&guard, &pending, &lang);

        enter(id, Phase::AwaitingUpstream);
        enter(id, Phase::SingleShot);
        let reply = match self
            .backend
            .complete(
                &messages,
                &self.upstream.vision_model,
                self.upstream.vision_max_tokens,
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                enter(id, Phase::Failed);
                tracing::error!(session = %id, error = %e, "Single-shot completion failed");
                return Err(e);
            }
        };

        enter(id, Phase::Finalizing);
        guard.turns.push(pending);
        let formatted = append_assistant_turn(&mut guard, &reply, self.policy);
        guard.touch();

        enter(id, Phase::Done);
        Ok(formatted)
    }

    // Free-function form of `assemble` for the spawned producer, which
    // cannot borrow `self`.
    fn assemble_static(
        session: &crate::session::Session,
        pending: &crate::session::Turn,
        lang: &str,
        policy: HistoryPolicy,
    ) -> Vec<ChatMessage> {
        let mut context = build_request_context(session, policy);
        context.push(pending.clone());
        wire_messages(&context, lang)
    }
}
