//! Message store - the `messages.json` document of one conversation folder.
//!
//! The document is a pretty-printed JSON array that is always rewritten
//! whole. Every mutation is a read-modify-write of the full list. The store
//! takes no locks; callers must not run two overlapping writes against the
//! same folder (see `library`, which serializes them).

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

use crate::ids::{self, Clock};
use crate::scanner::{MESSAGES_FILE, MESSAGES_TEMP_FILE};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed message document {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize messages: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("message {0} not found")]
    MessageNotFound(String),
    #[error("invalid update for message {id}: {reason}")]
    InvalidPatch { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Assistant,
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub path: String,
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sidecar text file backing a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxtFile {
    pub name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    pub path: String,
}

/// Image found by a web search; local copies use `file://` urls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchImage {
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One record of `messages.json`.
///
/// Fields the UI keeps for its own purposes (`history`, `reasoning_content`,
/// `generating`, ...) are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
    /// Absent on legacy and imported text messages
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileRef>>,
    #[serde(rename = "txtFile", default, skip_serializing_if = "Option::is_none")]
    pub txt_file: Option<TxtFile>,
    #[serde(rename = "searchImages", default, skip_serializing_if = "Option::is_none")]
    pub search_images: Option<Vec<SearchImage>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Older documents store `Date.now()` numbers for ids and timestamps
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!("expected a string or a number, found {}", other))),
    }
}

impl Message {
    pub fn new(id: impl Into<String>, content: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            timestamp: timestamp.into(),
            message_type: None,
            files: None,
            txt_file: None,
            search_images: None,
            extra: Map::new(),
        }
    }

    /// Shallow merge: every key of `patch` replaces the field of the same name.
    /// The id never changes.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Message, StoreError> {
        let invalid = |reason: String| StoreError::InvalidPatch {
            id: self.id.clone(),
            reason,
        };
        let mut value = serde_json::to_value(self)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| invalid("message is not an object".to_string()))?;
        for (key, val) in patch {
            if key == "id" {
                continue;
            }
            obj.insert(key.clone(), val.clone());
        }
        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
    }
}

/// Handle on one conversation folder's message document
#[derive(Debug, Clone)]
pub struct MessageStore {
    dir: PathBuf,
}

impl MessageStore {
    pub fn new(conversation_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: conversation_path.into(),
        }
    }

    pub fn document_path(&self) -> PathBuf {
        self.dir.join(MESSAGES_FILE)
    }

    /// Load the message list. A missing document is bootstrapped as `[]`.
    pub async fn load(&self) -> Result<Vec<Message>, StoreError> {
        let path = self.document_path();
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("Creating empty {}", path.display());
                self.write_document(&[]).await?;
                return Ok(Vec::new());
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|source| StoreError::Parse { path, source })
    }

    /// Overwrite the whole document. Duplicate ids are repaired first.
    pub async fn save(&self, messages: &mut [Message], clock: &dyn Clock) -> Result<(), StoreError> {
        let rewritten = ids::dedupe_ids(messages, clock);
        if rewritten > 0 {
            info!("Repaired {} duplicate ids in {}", rewritten, self.document_path().display());
        }
        self.write_document(messages).await
    }

    async fn write_document(&self, messages: &[Message]) -> Result<(), StoreError> {
        let path = self.document_path();
        let json = serde_json::to_string_pretty(messages)?;

        // write-then-rename so readers never see a half-written document
        let tmp = self.dir.join(MESSAGES_TEMP_FILE);
        fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|source| StoreError::Write { path: tmp.clone(), source })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Write { path: path.clone(), source })?;
        debug!("Saved {} messages to {}", messages.len(), path.display());
        Ok(())
    }

    pub async fn append(&self, message: Message, clock: &dyn Clock) -> Result<Vec<Message>, StoreError> {
        self.append_all(vec![message], clock).await
    }

    pub async fn append_all(&self, new: Vec<Message>, clock: &dyn Clock) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.load().await?;
        messages.extend(new);
        self.save(&mut messages, clock).await?;
        Ok(messages)
    }

    pub async fn update(
        &self,
        id: &str,
        patch: &Map<String, Value>,
        clock: &dyn Clock,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.load().await?;
        let slot = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::MessageNotFound(id.to_string()))?;
        *slot = slot.merged(patch)?;
        self.save(&mut messages, clock).await?;
        Ok(messages)
    }

    pub async fn delete(&self, id: &str, clock: &dyn Clock) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.load().await?;
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Err(StoreError::MessageNotFound(id.to_string()));
        }
        self.save(&mut messages, clock).await?;
        Ok(messages)
    }

    /// Put the listed ids first, in the given order. Unknown ids are ignored;
    /// unlisted messages follow in their current relative order.
    pub async fn reorder(&self, order: &[String], clock: &dyn Clock) -> Result<Vec<Message>, StoreError> {
        let messages = self.load().await?;
        let mut reordered = reorder_messages(messages, order);
        self.save(&mut reordered, clock).await?;
        Ok(reordered)
    }
}

pub fn reorder_messages(messages: Vec<Message>, order: &[String]) -> Vec<Message> {
    let mut remaining: Vec<Option<Message>> = messages.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(remaining.len());
    for id in order {
        if let Some(slot) = remaining
            .iter_mut()
            .find(|m| m.as_ref().is_some_and(|m| &m.id == id))
        {
            out.extend(slot.take());
        }
    }
    out.extend(remaining.into_iter().flatten());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::test_clock::FixedClock;
    use serde_json::json;

    fn sample() -> Vec<Message> {
        let mut user = Message::new("1700000000000", "look ![x](local-file:///c/a.png)", "2023-11-14T22:13:20.000Z");
        user.message_type = Some(MessageType::User);
        user.files = Some(vec![FileRef {
            name: "a.png".to_string(),
            path: "/c/a.png".to_string(),
            file_type: ".png".to_string(),
            size: 3,
            extra: Map::new(),
        }]);
        let mut reply = Message::new("1700000000001", "hi", "2023-11-14T22:13:21.000Z");
        reply.message_type = Some(MessageType::Assistant);
        reply.extra.insert("reasoning_content".to_string(), json!("thinking"));
        reply.extra.insert("history".to_string(), json!([]));
        let mut legacy = Message::new("1700000000002", "notes", "2023-11-14T22:13:22.000Z");
        legacy.txt_file = Some(TxtFile {
            name: "notes.txt".to_string(),
            display_name: "notes".to_string(),
            path: "/c/notes.txt".to_string(),
        });
        vec![user, reply, legacy]
    }

    #[tokio::test]
    async fn test_load_missing_bootstraps_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        assert!(store.load().await.unwrap().is_empty());
        let written = std::fs::read_to_string(store.document_path()).unwrap();
        assert_eq!(written, "[]");
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        let clock = FixedClock(1);
        let mut messages = sample();
        store.save(&mut messages, &clock).await.unwrap();
        assert_eq!(store.load().await.unwrap(), sample());

        let raw = std::fs::read_to_string(store.document_path()).unwrap();
        assert!(raw.starts_with("[\n  {"));
        assert!(raw.contains("\"txtFile\""));
        assert!(raw.contains("\"reasoning_content\": \"thinking\""));
        assert!(!dir.path().join(".messages.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_malformed_document_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MESSAGES_FILE), "{not json").unwrap();
        let err = MessageStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_load_numeric_ids_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MESSAGES_FILE),
            r#"[
                {"id": 1700000000000, "content": "hello", "type": "user", "timestamp": 1700000000000},
                {"id": "1700000000001", "content": "hi", "timestamp": null}
            ]"#,
        )
        .unwrap();
        let messages = MessageStore::new(dir.path()).load().await.unwrap();
        assert_eq!(messages[0].id, "1700000000000");
        assert_eq!(messages[0].timestamp, "1700000000000");
        assert_eq!(messages[1].id, "1700000000001");
        assert_eq!(messages[1].timestamp, "");

        std::fs::write(dir.path().join(MESSAGES_FILE), r#"[{"id": true}]"#).unwrap();
        let err = MessageStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_save_repairs_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        let clock = FixedClock(9);
        let mut messages = vec![Message::new("x", "a", ""), Message::new("x", "b", "")];
        store.save(&mut messages, &clock).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].id, "x");
        assert_ne!(loaded[1].id, "x");
    }

    #[tokio::test]
    async fn test_update_delete_reorder() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        let clock = FixedClock(1);
        let mut messages = sample();
        store.save(&mut messages, &clock).await.unwrap();

        let patch = json!({"content": "edited", "id": "ignored", "pinned": true});
        let updated = store
            .update("1700000000001", patch.as_object().unwrap(), &clock)
            .await
            .unwrap();
        assert_eq!(updated[1].id, "1700000000001");
        assert_eq!(updated[1].content, "edited");
        assert_eq!(updated[1].extra.get("pinned"), Some(&json!(true)));
        assert_eq!(updated[1].message_type, Some(MessageType::Assistant));

        let bad = json!({"files": "nope"});
        assert!(matches!(
            store.update("1700000000001", bad.as_object().unwrap(), &clock).await,
            Err(StoreError::InvalidPatch { .. })
        ));
        assert!(matches!(
            store.update("missing", &Map::new(), &clock).await,
            Err(StoreError::MessageNotFound(_))
        ));

        let order = vec!["1700000000002".to_string(), "nope".to_string()];
        let reordered = store.reorder(&order, &clock).await.unwrap();
        let ids: Vec<&str> = reordered.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1700000000002", "1700000000000", "1700000000001"]);

        let after = store.delete("1700000000000", &clock).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(store.load().await.unwrap(), after);
        assert!(matches!(
            store.delete("1700000000000", &clock).await,
            Err(StoreError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path());
        let clock = FixedClock(1);
        store.append(Message::new("1", "a", ""), &clock).await.unwrap();
        let all = store.append(Message::new("2", "b", ""), &clock).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.load().await.unwrap()[1].content, "b");
    }
}
