//! Assistant-reply detection for sidecar `.txt` files.
//!
//! Assistant replies are persisted as `message_<id>.txt` next to the
//! conversation. Those files already have a message record and must never be
//! imported again as new user messages. There is no explicit marker on disk,
//! so this is a heuristic built from small predicates.

use std::collections::HashMap;

use crate::store::Message;

/// Length of the id prefix compared by `id_prefix_match` (seconds-resolution
/// part of an epoch-ms id).
pub const ID_PREFIX_LEN: usize = 10;

/// Messages of one conversation keyed by id
pub struct MessageIndex<'a> {
    by_id: HashMap<&'a str, &'a Message>,
    messages: &'a [Message],
}

impl<'a> MessageIndex<'a> {
    pub fn new(messages: &'a [Message]) -> Self {
        Self {
            by_id: messages.iter().map(|m| (m.id.as_str(), m)).collect(),
            messages,
        }
    }

    pub fn get(&self, id: &str) -> Option<&'a Message> {
        self.by_id.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.by_id.keys().copied()
    }

    pub fn messages(&self) -> &'a [Message] {
        self.messages
    }
}

/// `message_<id>.txt` -> `<id>`
pub fn sidecar_message_id(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_prefix("message_")?;
    let dot = stem.len().checked_sub(4)?;
    if !stem.is_char_boundary(dot) || !stem[dot..].eq_ignore_ascii_case(".txt") {
        return None;
    }
    let id = &stem[..dot];
    (!id.is_empty()).then_some(id)
}

pub fn id_exact_match(id: &str, index: &MessageIndex) -> bool {
    index.get(id).is_some()
}

/// Both ids share the first `ID_PREFIX_LEN` characters
pub fn id_prefix_match(id: &str, index: &MessageIndex) -> bool {
    let Some(prefix) = id.get(..ID_PREFIX_LEN) else {
        return false;
    };
    index
        .ids()
        .any(|known| known.get(..ID_PREFIX_LEN) == Some(prefix))
}

/// Some message content mentions the file by name
pub fn content_contains_file_name(file_name: &str, index: &MessageIndex) -> bool {
    !file_name.is_empty() && index.messages().iter().any(|m| m.content.contains(file_name))
}

/// Texts shorter than this must equal a message's content, not just occur in it
pub const MIN_CONTAINED_TEXT_CHARS: usize = 16;

/// The file's text already is (part of) some message's content. Short texts
/// only match a message whose trimmed content is exactly that text.
pub fn content_matches_text(text: &str, index: &MessageIndex) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    if text.chars().count() < MIN_CONTAINED_TEXT_CHARS {
        return index.messages().iter().any(|m| m.content.trim() == text);
    }
    index.messages().iter().any(|m| m.content.contains(text))
}

/// Combined predicate. `text` is the file content when the caller has read it.
pub fn is_assistant_reply(file_name: &str, text: Option<&str>, index: &MessageIndex) -> bool {
    if let Some(id) = sidecar_message_id(file_name) {
        if id_exact_match(id, index) || id_prefix_match(id, index) {
            return true;
        }
    }
    if content_contains_file_name(file_name, index) {
        return true;
    }
    text.is_some_and(|t| content_matches_text(t, index))
}
