//! Parley Core - Conversation state and upstream model plumbing.
//!
//! This crate provides:
//! - Session records, the in-memory session store, and per-session locking
//! - Conversation history policies and response text normalization
//! - The in-memory image cache with validation and alpha flattening
//! - Input language detection
//! - The OpenAI-compatible chat completions client (blocking and streaming)
//! - The exchange orchestrator and the background expiry reaper

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod conversation;
pub mod image;
pub mod language;
pub mod orchestrator;
pub mod provider;
pub mod reaper;
pub mod session;

pub use conversation::{format_response, HistoryPolicy, IMAGE_PLACEHOLDER};
pub use image::{ImageCache, ImageRef};
pub use orchestrator::{ChatEvent, Orchestrator};
pub use provider::{ChatClient, ChatMessage, CompletionBackend};
pub use reaper::{Reaper, ReaperConfig, ReaperHandle, SweepStats};
pub use session::{
    ImageAttachment, ResolvedSession, Role, Session, SessionHandle, SessionStore, Turn,
    TurnContent,
};
