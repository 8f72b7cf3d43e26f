//! Conversation history management.
//!
//! Appends user and assistant turns under the session's write
//! serialization, bounds the history per the configured policy, and
//! assembles the turn sequence submitted upstream. Assistant text passes
//! through a deterministic, idempotent formatting pass before storage.

use std::str::FromStr;

use parley_common::Error;

use crate::session::{ImageAttachment, Role, Session, Turn};

/// Text attached to an image-only turn so the model has an instruction.
pub const IMAGE_PLACEHOLDER: &str = "Please describe this image.";

/// History bounding policy.
///
/// The three observed variants (unlimited, last-N, cap-at-100) are all
/// supported as configuration; none is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPolicy {
    /// Send the full history upstream, unbounded.
    Full,
    /// Send the system turn plus the most recent N turns.
    Recent(usize),
    /// Keep at most N turns total, evicting the oldest non-system turn
    /// when an append exceeds the cap.
    Cap(usize),
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self::Cap(100)
    }
}

impl FromStr for HistoryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "full" {
            return Ok(Self::Full);
        }
        let parse_count = |raw: &str, kind: &str| {
            raw.parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::Config(format!("invalid {kind} history count: {raw:?}")))
        };
        if let Some(raw) = s.strip_prefix("recent:") {
            return Ok(Self::Recent(parse_count(raw, "recent")?));
        }
        if let Some(raw) = s.strip_prefix("cap:") {
            // A cap below 2 could not hold the system turn plus an exchange.
            let n = parse_count(raw, "cap")?;
            if n < 3 {
                return Err(Error::Config(format!("history cap too small: {n}")));
            }
            return Ok(Self::Cap(n));
        }
        Err(Error::Config(format!("unknown history policy: {s:?}")))
    }
}

/// Build a user turn without committing it to the session.
///
/// Plain text when no image is attached; a two-part multimodal turn
/// (text or placeholder plus the image) otherwise.
pub fn user_turn(text: &str, image: Option<ImageAttachment>) -> Turn {
    match image {
        None => Turn::text(Role::User, text),
        Some(image) => {
            let text = if text.is_empty() {
                IMAGE_PLACEHOLDER
            } else {
                text
            };
            Turn::multimodal(text, image)
        }
    }
}

/// Append a user turn under the caller-held session lock.
pub fn append_user_turn(
    session: &mut Session,
    text: &str,
    image: Option<ImageAttachment>,
    policy: HistoryPolicy,
) {
    session.turns.push(user_turn(text, image));
    enforce_cap(session, policy);
}

/// Format and append the finalized assistant response. Returns the
/// stored (formatted) text.
pub fn append_assistant_turn(session: &mut Session, text: &str, policy: HistoryPolicy) -> String {
    let formatted = format_response(text);
    session.turns.push(Turn::text(Role::Assistant, &formatted));
    enforce_cap(session, policy);
    formatted
}

fn enforce_cap(session: &mut Session, policy: HistoryPolicy) {
    if let HistoryPolicy::Cap(max) = policy {
        // The system turn at index 0 is never evicted.
        while session.turns.len() > max {
            session.turns.remove(1);
        }
    }
}

/// Assemble the turn sequence to submit upstream.
///
/// The leading system turn is always retained; `Recent(n)` truncates the
/// tail to the most recent n turns. `Cap` is enforced at append time, so
/// it reads like `Full` here.
pub fn build_request_context(session: &Session, policy: HistoryPolicy) -> Vec<Turn> {
    match policy {
        HistoryPolicy::Full | HistoryPolicy::Cap(_) => session.turns.clone(),
        HistoryPolicy::Recent(n) => {
            let mut context = Vec::with_capacity(n + 1);
            context.push(session.turns[0].clone());
            let tail = &session.turns[1..];
            let skip = tail.len().saturating_sub(n);
            context.extend_from_slice(&tail[skip..]);
            context
        }
    }
}

/// Cosmetic normalization of upstream text.
///
/// Inserts missing whitespace at lower-to-upper boundaries, after
/// sentence-terminating punctuation, between concatenated capitalized
/// words, and after a leading "I" glued to a common auxiliary verb, then
/// collapses repeated whitespace. Idempotent: a second application is a
/// no-op.
pub fn format_response(text: &str) -> String {
    collapse_whitespace(&insert_word_breaks(text))
}

fn insert_word_breaks(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    // Whether a space was inserted before the previous character; a break
    // emitted earlier in this pass starts a new word just like one that
    // was already present in the input.
    let mut broke_before_prev = false;
    for (i, &c) in chars.iter().enumerate() {
        let broke = i > 0 && needs_break(&chars, i, broke_before_prev);
        if broke {
            out.push(' ');
        }
        out.push(c);
        broke_before_prev = broke;
    }
    out
}

fn needs_break(chars: &[char], i: usize, prev_is_word_start: bool) -> bool {
    let prev = chars[i - 1];
    let c = chars[i];
    if prev.is_whitespace() || c.is_whitespace() {
        return false;
    }
    // helloWorld -> hello World
    if prev.is_lowercase() && c.is_uppercase() {
        return true;
    }
    // end of sentence glued to the next word
    if matches!(prev, '.' | '!' | '?') && c.is_alphabetic() {
        return true;
    }
    // USAToday -> USA Today
    if prev.is_uppercase()
        && c.is_uppercase()
        && chars.get(i + 1).is_some_and(|n| n.is_lowercase())
    {
        return true;
    }
    // Iam / Iwill / Ihave at a word start
    if prev == 'I'
        && (prev_is_word_start || word_start(chars, i - 1))
        && starts_with_auxiliary(&chars[i..])
    {
        return true;
    }
    false
}

fn word_start(chars: &[char], i: usize) -> bool {
    i == 0 || !chars[i - 1].is_alphanumeric()
}

const AUXILIARIES: &[&str] = &[
    "am", "will", "have", "had", "can", "could", "would", "should", "was", "do", "did", "need",
    "want", "think",
];

fn starts_with_auxiliary(rest: &[char]) -> bool {
    AUXILIARIES.iter().any(|aux| {
        let len = aux.len();
        if rest.len() < len {
            return false;
        }
        if !rest[..len].iter().zip(aux.chars()).all(|(&a, b)| a == b) {
            return false;
        }
        // Must end the word; an uppercase continuation starts a new word.
        rest.get(len)
            .is_none_or(|next| !next.is_alphanumeric() || next.is_uppercase())
    })
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut iter = text.chars().peekable();
    while let Some(c) = iter.next() {
        if c.is_whitespace() {
            let mut run = 1;
            while iter.peek().is_some_and(|n| n.is_whitespace()) {
                iter.next();
                run += 1;
            }
            out.push(if run == 1 { c } else { ' ' });
        } else {
            out.push(c);
        }
    }
    out
}
