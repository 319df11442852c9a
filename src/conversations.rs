//! Conversations - one folder per conversation under the storage root.
//!
//! The list itself is kept in `conversations.json` at the storage root. A
//! conversation's `path` is the only link to its on-disk state.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::ids::{self, Clock, IdAllocator};
use crate::paths;
use crate::reconcile;
use crate::store::{Message, MessageStore, StoreError};

pub const INDEX_FILE: &str = "conversations.json";
pub const RECYCLE_BIN: &str = "RecycleBin";
const NEW_CHAT_PREFIX: &str = "NewChat";

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("storage folder {0} is not accessible")]
    StorageMissing(PathBuf),
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("a folder named {0} already exists")]
    NameTaken(String),
    #[error("invalid conversation name {0:?}")]
    InvalidName(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConversationError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ConversationError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    /// Creation time, ISO 8601
    pub timestamp: String,
    #[serde(rename = "modifiedTime", default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
}

impl Conversation {
    pub fn store(&self) -> MessageStore {
        MessageStore::new(&self.path)
    }

    fn sort_key(&self) -> &str {
        self.modified_time.as_deref().unwrap_or(&self.timestamp)
    }
}

pub async fn load_index(storage: &Path) -> Vec<Conversation> {
    let path = storage.join(INDEX_FILE);
    let raw = match fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    // folders are rediscovered on the next update, so a bad index is not fatal
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!("Ignoring malformed {}: {}", path.display(), e);
        Vec::new()
    })
}

pub async fn save_index(storage: &Path, conversations: &[Conversation]) -> Result<(), ConversationError> {
    let path = storage.join(INDEX_FILE);
    let json = serde_json::to_string_pretty(conversations).map_err(StoreError::from)?;
    fs::write(&path, json)
        .await
        .map_err(|e| ConversationError::io(format!("failed to write {}", path.display()), e))
}

/// Every sub-folder of the storage root, except hidden ones and the recycle bin
pub async fn discover_folders(storage: &Path) -> Result<Vec<Conversation>, ConversationError> {
    let mut entries = fs::read_dir(storage)
        .await
        .map_err(|_| ConversationError::StorageMissing(storage.to_path_buf()))?;
    let mut found = Vec::new();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Error listing {}: {}", storage.display(), e);
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == RECYCLE_BIN {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(m) if m.is_dir() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!("Failed to stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let created = meta
            .created()
            .or_else(|_| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        found.push(Conversation {
            id: created.timestamp_millis().to_string(),
            name,
            path: entry.path(),
            timestamp: ids::iso(created),
            modified_time: None,
        });
    }
    Ok(found)
}

/// Merge keyed by path. Known paths keep their id and name and take the
/// scanned timestamps; new paths are added.
pub fn merge_conversations(existing: Vec<Conversation>, scanned: Vec<Conversation>) -> Vec<Conversation> {
    let mut merged = existing;
    for conv in scanned {
        match merged.iter_mut().find(|c| c.path == conv.path) {
            Some(known) => {
                *known = Conversation {
                    id: std::mem::take(&mut known.id),
                    name: std::mem::take(&mut known.name),
                    ..conv
                };
            }
            None => merged.push(conv),
        }
    }
    sort_newest_first(&mut merged);
    merged
}

pub fn sort_newest_first(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.sort_key().cmp(a.sort_key()));
}

/// Give every later duplicate id a fresh one. Returns how many changed.
pub fn ensure_unique_ids(conversations: &mut [Conversation], clock: &dyn Clock) -> usize {
    let mut alloc = IdAllocator::new(Vec::<String>::new(), clock);
    let mut changed = 0;
    for conv in conversations.iter_mut() {
        if !alloc.reserve(&conv.id) {
            conv.id = alloc.next_id();
            changed += 1;
        }
    }
    changed
}

/// Split into (existing, missing), checking all folders concurrently
pub async fn verify_folders(conversations: Vec<Conversation>) -> (Vec<Conversation>, Vec<Conversation>) {
    let checks = join_all(conversations.iter().map(|c| fs::try_exists(&c.path))).await;
    let mut valid = Vec::new();
    let mut missing = Vec::new();
    for (conv, exists) in conversations.into_iter().zip(checks) {
        match exists {
            Ok(true) => valid.push(conv),
            Ok(false) => missing.push(conv),
            Err(e) => {
                warn!("Cannot check {}: {}", conv.path.display(), e);
                missing.push(conv);
            }
        }
    }
    (valid, missing)
}

/// Create `NewChat<N>` with N one above the highest existing number
pub async fn create_folder(storage: &Path, clock: &dyn Clock) -> Result<Conversation, ConversationError> {
    let mut entries = fs::read_dir(storage)
        .await
        .map_err(|_| ConversationError::StorageMissing(storage.to_path_buf()))?;
    let mut max_number = 0u64;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(n) = name.strip_prefix(NEW_CHAT_PREFIX).and_then(|s| s.parse::<u64>().ok()) {
            max_number = max_number.max(n);
        }
    }

    let name = format!("{}{}", NEW_CHAT_PREFIX, max_number + 1);
    let path = storage.join(&name);
    fs::create_dir(&path)
        .await
        .map_err(|e| ConversationError::io(format!("failed to create {}", path.display()), e))?;
    // bootstraps an empty messages.json
    MessageStore::new(&path).load().await?;

    let now = clock.now();
    info!("Created conversation folder {}", path.display());
    Ok(Conversation {
        id: now.timestamp_millis().to_string(),
        name,
        path,
        timestamp: ids::iso(now),
        modified_time: Some(ids::iso(now)),
    })
}

fn validate_name(name: &str) -> Result<&str, ConversationError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.starts_with('.')
        || trimmed == RECYCLE_BIN
        || trimmed.contains(['/', '\\', ':']);
    if invalid {
        Err(ConversationError::InvalidName(name.to_string()))
    } else {
        Ok(trimmed)
    }
}

/// Rename the folder and repoint messages that referenced files inside it
pub async fn rename_folder(
    conv: &Conversation,
    new_name: &str,
    clock: &dyn Clock,
) -> Result<Conversation, ConversationError> {
    let new_name = validate_name(new_name)?;
    let parent = conv
        .path
        .parent()
        .ok_or_else(|| ConversationError::NotFound(conv.id.clone()))?;
    let new_path = parent.join(new_name);
    if new_path == conv.path {
        return Ok(conv.clone());
    }
    if fs::try_exists(&new_path).await.unwrap_or(false) {
        return Err(ConversationError::NameTaken(new_name.to_string()));
    }

    fs::rename(&conv.path, &new_path).await.map_err(|e| {
        ConversationError::io(format!("failed to rename {}", conv.path.display()), e)
    })?;
    info!("Renamed {} -> {}", conv.path.display(), new_path.display());

    let store = MessageStore::new(&new_path);
    let mut messages = store.load().await?;
    let old_prefix = conv.path.to_string_lossy().to_string();
    let new_prefix = new_path.to_string_lossy().to_string();
    if rewrite_message_paths(&mut messages, &old_prefix, &new_prefix) > 0 {
        store.save(&mut messages, clock).await?;
    }

    Ok(Conversation {
        name: new_name.to_string(),
        path: new_path,
        ..conv.clone()
    })
}

/// `path` moved from folder `old` to folder `new`, or `None` if it lies
/// outside `old`. Spellings are compared in normalized form.
fn repoint_path(path: &str, old: &str, new: &str) -> Option<String> {
    let rest = paths::relative_to(path, old)?;
    if rest.is_empty() {
        return Some(new.to_string());
    }
    Some(Path::new(new).join(rest).to_string_lossy().to_string())
}

/// Like `repoint_path` for `file://` style links; keeps the scheme and
/// percent-encodes the new location.
fn repoint_url(url: &str, old: &str, new: &str) -> Option<String> {
    let moved = repoint_path(url, old, new)?;
    let encoded = paths::encode_url_path(&moved);
    let scheme = paths::scheme_of(url);
    if !scheme.is_empty() && !encoded.starts_with('/') {
        // file:///C:/x for drive paths
        return Some(format!("{}/{}", scheme, encoded));
    }
    Some(format!("{}{}", scheme, encoded))
}

fn repoint_in_place(value: &mut String, old: &str, new: &str, as_url: bool) -> bool {
    let moved = if as_url {
        repoint_url(value, old, new)
    } else {
        repoint_path(value, old, new)
    };
    match moved {
        Some(moved) if moved != *value => {
            *value = moved;
            true
        }
        _ => false,
    }
}

/// Repoint every stored path under `old` to `new`. Returns the number of
/// messages touched.
pub fn rewrite_message_paths(messages: &mut [Message], old: &str, new: &str) -> usize {
    let mut touched = 0;
    for msg in messages.iter_mut() {
        let mut changed = false;
        for file in msg.files.iter_mut().flatten() {
            changed |= repoint_in_place(&mut file.path, old, new, false);
        }
        if let Some(txt) = msg.txt_file.as_mut() {
            changed |= repoint_in_place(&mut txt.path, old, new, false);
        }
        for image in msg.search_images.iter_mut().flatten() {
            if !paths::scheme_of(&image.url).is_empty() {
                changed |= repoint_in_place(&mut image.url, old, new, true);
            }
        }

        let links: Vec<(String, String)> = reconcile::markdown_image_links(&msg.content)
            .into_iter()
            .filter_map(|link| repoint_url(link, old, new).map(|moved| (link.to_string(), moved)))
            .filter(|(link, moved)| link != moved)
            .collect();
        for (link, moved) in links {
            msg.content = msg.content.replace(&link, &moved);
            changed = true;
        }

        if changed {
            touched += 1;
        }
    }
    touched
}

/// Move the folder into the recycle bin, or delete it if the move fails
pub async fn recycle_folder(storage: &Path, conv: &Conversation, clock: &dyn Clock) -> Result<(), ConversationError> {
    if !fs::try_exists(&conv.path).await.unwrap_or(false) {
        return Ok(());
    }
    let bin = storage.join(RECYCLE_BIN);
    fs::create_dir_all(&bin)
        .await
        .map_err(|e| ConversationError::io(format!("failed to create {}", bin.display()), e))?;

    let mut target = bin.join(&conv.name);
    if fs::try_exists(&target).await.unwrap_or(false) {
        target = bin.join(format!("{}-{}", conv.name, clock.now().timestamp_millis()));
    }

    match fs::rename(&conv.path, &target).await {
        Ok(()) => {
            info!("Moved {} to {}", conv.path.display(), target.display());
            Ok(())
        }
        Err(e) => {
            warn!("Failed to recycle {} ({}), deleting instead", conv.path.display(), e);
            fs::remove_dir_all(&conv.path)
                .await
                .map_err(|e| ConversationError::io(format!("failed to delete {}", conv.path.display()), e))
        }
    }
}
