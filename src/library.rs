//! Conversation library - the in-memory conversation list and its events.
//!
//! Holds every known conversation keyed by id, persists the list to the
//! index file, and broadcasts changes to SSE subscribers. All writes to one
//! conversation's `messages.json` go through that conversation's lock, so the
//! HTTP handlers and the watcher never overlap on the same document.

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::conversations::{self, Conversation, ConversationError};
use crate::ids::{self, Clock, IdAllocator};
use crate::mtime;
use crate::scanner::{self, FileDescriptor, FileKind};
use crate::store::{FileRef, Message, MessageType, StoreError};
use crate::sync::{self, SyncOutcome};

/// Events broadcast when conversations change
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LibraryEvent {
    FoldersUpdated {
        count: usize,
        removed: Vec<String>,
    },
    MessagesChanged {
        conversation_id: String,
        count: usize,
    },
    Reconciled {
        conversation_id: String,
        imported: usize,
    },
}

/// Outcome of an update-folders run
#[derive(Debug, Serialize)]
pub struct FolderUpdate {
    pub conversations: Vec<Conversation>,
    /// Conversations dropped because their folder is gone
    pub removed: Vec<Conversation>,
    /// Ids of conversations that were not in the list before
    pub added: Vec<String>,
}

pub struct Library {
    storage: PathBuf,
    conversations: DashMap<String, Conversation>,
    write_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    /// Serializes whole-list operations (update, create, rename, delete)
    list_lock: Mutex<()>,
    event_tx: broadcast::Sender<LibraryEvent>,
    clock: Arc<dyn Clock>,
}

impl Library {
    pub fn new(storage: PathBuf, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            storage,
            conversations: DashMap::new(),
            write_locks: DashMap::new(),
            list_lock: Mutex::new(()),
            event_tx,
            clock,
        })
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: LibraryEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Load the persisted index without touching the disk folders
    pub async fn load_index(&self) {
        for conv in conversations::load_index(&self.storage).await {
            self.conversations.insert(conv.id.clone(), conv);
        }
        info!("Loaded {} conversations from index", self.conversations.len());
    }

    /// All conversations, newest first
    pub fn list(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.conversations.iter().map(|r| r.value().clone()).collect();
        conversations::sort_newest_first(&mut list);
        list
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, id: &str) -> Result<Conversation, ConversationError> {
        self.conversations
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))
    }

    /// Conversation whose folder contains `path`
    pub fn find_by_path(&self, path: &Path) -> Option<Conversation> {
        self.conversations
            .iter()
            .find(|r| path.starts_with(&r.value().path))
            .map(|r| r.value().clone())
    }

    fn write_lock(&self, folder: &Path) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(folder.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist(&self) -> Result<(), ConversationError> {
        conversations::save_index(&self.storage, &self.list()).await
    }

    /// Drop conversations whose folder vanished, pick up new folders, refresh
    /// modification times and persist the list.
    pub async fn update_folders(&self) -> Result<FolderUpdate, ConversationError> {
        let _guard = self.list_lock.lock().await;

        let known = self.list();
        let known_ids: HashSet<String> = known.iter().map(|c| c.id.clone()).collect();
        let (valid, removed) = conversations::verify_folders(known).await;
        for conv in &removed {
            warn!("Conversation folder {} no longer exists, removing {}", conv.path.display(), conv.id);
        }

        let scanned = conversations::discover_folders(&self.storage).await?;
        let mut merged = conversations::merge_conversations(valid, scanned);
        conversations::ensure_unique_ids(&mut merged, self.clock());

        let mtimes = join_all(
            merged
                .iter()
                .map(|c| mtime::folder_modified_time(&c.path, Some(c.timestamp.as_str()))),
        )
        .await;
        for (conv, resolved) in merged.iter_mut().zip(mtimes) {
            conv.modified_time = resolved.map(|(ts, _)| ids::iso(ts));
        }
        conversations::sort_newest_first(&mut merged);

        // entries are replaced in place so lookups never see a gap
        let kept: HashSet<&str> = merged.iter().map(|c| c.id.as_str()).collect();
        self.conversations.retain(|id, _| kept.contains(id.as_str()));
        let folders: HashSet<&Path> = merged.iter().map(|c| c.path.as_path()).collect();
        self.write_locks.retain(|path, _| folders.contains(path.as_path()));

        let added: Vec<String> = merged
            .iter()
            .filter(|c| !known_ids.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();
        for conv in &merged {
            self.conversations.insert(conv.id.clone(), conv.clone());
        }
        self.persist().await?;

        info!("Updated folders: {} conversations, {} removed", merged.len(), removed.len());
        self.emit(LibraryEvent::FoldersUpdated {
            count: merged.len(),
            removed: removed.iter().map(|c| c.id.clone()).collect(),
        });
        Ok(FolderUpdate {
            conversations: merged,
            removed,
            added,
        })
    }

    pub async fn create(&self) -> Result<Conversation, ConversationError> {
        let _guard = self.list_lock.lock().await;
        let mut conv = conversations::create_folder(&self.storage, self.clock()).await?;
        if self.conversations.contains_key(&conv.id) {
            let mut alloc = IdAllocator::new(self.conversations.iter().map(|r| r.key().clone()), self.clock());
            conv.id = alloc.next_id();
        }
        self.conversations.insert(conv.id.clone(), conv.clone());
        self.persist().await?;
        Ok(conv)
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<Conversation, ConversationError> {
        let _guard = self.list_lock.lock().await;
        let conv = self.get(id)?;
        let lock = self.write_lock(&conv.path);
        let _write = lock.lock().await;

        let renamed = conversations::rename_folder(&conv, new_name, self.clock()).await?;
        self.write_locks.remove(&conv.path);
        self.conversations.insert(renamed.id.clone(), renamed.clone());
        self.persist().await?;
        Ok(renamed)
    }

    pub async fn delete(&self, id: &str) -> Result<Conversation, ConversationError> {
        let _guard = self.list_lock.lock().await;
        let conv = self.get(id)?;
        let lock = self.write_lock(&conv.path);
        let _write = lock.lock().await;

        // the entry leaves the list even if the folder cannot be removed
        self.conversations.remove(id);
        self.write_locks.remove(&conv.path);
        self.persist().await?;
        conversations::recycle_folder(&self.storage, &conv, self.clock()).await?;
        Ok(conv)
    }

    pub async fn files(&self, id: &str) -> Result<Vec<FileDescriptor>, ConversationError> {
        let conv = self.get(id)?;
        Ok(scanner::scan(&conv.path).await)
    }

    pub async fn messages(&self, id: &str) -> Result<Vec<Message>, ConversationError> {
        let conv = self.get(id)?;
        let lock = self.write_lock(&conv.path);
        let _write = lock.lock().await;
        Ok(conv.store().load().await?)
    }

    /// Run `op` against the conversation's document under its write lock,
    /// then refresh its modification time.
    async fn mutate<F, Fut>(&self, id: &str, op: F) -> Result<Vec<Message>, ConversationError>
    where
        F: FnOnce(Conversation) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Message>, StoreError>>,
    {
        let conv = self.get(id)?;
        let lock = self.write_lock(&conv.path);
        let _write = lock.lock().await;

        let path = conv.path.clone();
        let messages = op(conv).await?;
        self.touch(id, &path).await;
        self.emit(LibraryEvent::MessagesChanged {
            conversation_id: id.to_string(),
            count: messages.len(),
        });
        Ok(messages)
    }

    async fn touch(&self, id: &str, folder: &Path) {
        let now = self.clock.now();
        if let Err(e) = mtime::record_folder_mtime(folder, now).await {
            warn!("Failed to record modification time for {}: {}", folder.display(), e);
        }
        if let Some(mut conv) = self.conversations.get_mut(id) {
            conv.modified_time = Some(ids::iso(now));
        }
    }

    /// Append a message, assigning a fresh id and timestamp
    pub async fn append_message(&self, id: &str, mut message: Message) -> Result<Vec<Message>, ConversationError> {
        let clock = self.clock.clone();
        self.mutate(id, |conv| async move {
            let store = conv.store();
            let existing = store.load().await?;
            message.id = IdAllocator::for_messages(&existing, clock.as_ref()).next_id();
            message.timestamp = ids::now_iso(clock.as_ref());
            store.append(message, clock.as_ref()).await
        })
        .await
    }

    /// Store an uploaded file in the conversation folder and append a user
    /// message referencing it. Both happen under the write lock, so a
    /// concurrent reconcile never sees the file as an orphan.
    pub async fn attach_file(
        &self,
        id: &str,
        file_name: &str,
        data: &[u8],
        content: Option<String>,
    ) -> Result<Vec<Message>, ConversationError> {
        let clock = self.clock.clone();
        self.mutate(id, |conv| async move {
            let stamp = clock.now().timestamp_millis();
            let stored_name = format!("{}-{}", stamp, file_name);
            let ext = scanner::extension_of(&stored_name);
            let dir = if FileKind::from_ext(&ext) == FileKind::Image {
                conv.path.join(scanner::IMAGES_DIR)
            } else {
                conv.path.clone()
            };
            let target = dir.join(&stored_name);
            let write = async {
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(&target, data).await
            };
            write.await.map_err(|source| StoreError::Write {
                path: target.clone(),
                source,
            })?;

            let store = conv.store();
            let existing = store.load().await?;
            let mut message = Message::new(
                IdAllocator::for_messages(&existing, clock.as_ref()).next_id(),
                content.unwrap_or_else(|| stored_name.clone()),
                ids::now_iso(clock.as_ref()),
            );
            message.message_type = Some(MessageType::User);
            message.files = Some(vec![FileRef {
                name: stored_name,
                path: target.to_string_lossy().to_string(),
                file_type: ext,
                size: data.len() as u64,
                extra: Default::default(),
            }]);
            store.append(message, clock.as_ref()).await
        })
        .await
    }

    pub async fn update_message(
        &self,
        id: &str,
        message_id: &str,
        patch: Map<String, Value>,
    ) -> Result<Vec<Message>, ConversationError> {
        let clock = self.clock.clone();
        self.mutate(id, |conv| async move {
            conv.store().update(message_id, &patch, clock.as_ref()).await
        })
        .await
    }

    pub async fn delete_message(&self, id: &str, message_id: &str) -> Result<Vec<Message>, ConversationError> {
        let clock = self.clock.clone();
        self.mutate(id, |conv| async move { conv.store().delete(message_id, clock.as_ref()).await })
            .await
    }

    pub async fn reorder_messages(&self, id: &str, order: Vec<String>) -> Result<Vec<Message>, ConversationError> {
        let clock = self.clock.clone();
        self.mutate(id, |conv| async move { conv.store().reorder(&order, clock.as_ref()).await })
            .await
    }

    /// Import orphan files of one conversation as messages
    pub async fn reconcile(&self, id: &str) -> Result<SyncOutcome, ConversationError> {
        let conv = self.get(id)?;
        let lock = self.write_lock(&conv.path);
        let _write = lock.lock().await;

        let outcome = sync::reconcile_folder(&conv.path, self.clock()).await?;
        if !outcome.imported.is_empty() {
            self.touch(id, &conv.path).await;
            self.emit(LibraryEvent::Reconciled {
                conversation_id: id.to_string(),
                imported: outcome.imported.len(),
            });
        }
        Ok(outcome)
    }

    /// Reconcile every known conversation, one at a time. Failures are logged.
    pub async fn reconcile_all(&self) -> usize {
        let mut imported = 0;
        for conv in self.list() {
            match self.reconcile(&conv.id).await {
                Ok(outcome) => imported += outcome.imported.len(),
                Err(e) => warn!("Reconcile of {} failed: {}", conv.path.display(), e),
            }
        }
        imported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::test_clock::FixedClock;
    use serde_json::json;

    fn library(storage: &Path) -> Arc<Library> {
        Library::new(storage.to_path_buf(), Arc::new(FixedClock(1_700_000_000_000)))
    }

    #[tokio::test]
    async fn test_update_folders_drops_renamed_folder() {
        let storage = tempfile::tempdir().unwrap();
        let lib = library(storage.path());
        let conv = lib.create().await.unwrap();
        let mut events = lib.subscribe();

        std::fs::rename(&conv.path, storage.path().join("Elsewhere")).unwrap();
        let update = lib.update_folders().await.unwrap();

        assert_eq!(update.removed.len(), 1);
        assert_eq!(update.removed[0].id, conv.id);
        assert_eq!(update.conversations.len(), 1);
        assert_eq!(update.conversations[0].name, "Elsewhere");
        assert!(update.conversations[0].modified_time.is_some());
        assert!(lib.get(&conv.id).is_err());
        assert!(matches!(events.try_recv(), Ok(LibraryEvent::FoldersUpdated { count: 1, .. })));

        // persisted index survives a fresh library
        let reloaded = library(storage.path());
        reloaded.load_index().await;
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_update_folders_keeps_entries_visible() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let storage = tempfile::tempdir().unwrap();
        let lib = library(storage.path());
        let conv = lib.create().await.unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let lib = lib.clone();
            let stop = stop.clone();
            let id = conv.id.clone();
            std::thread::spawn(move || {
                let mut misses = 0;
                while !stop.load(Ordering::SeqCst) {
                    if lib.get(&id).is_err() {
                        misses += 1;
                    }
                }
                misses
            })
        };
        for _ in 0..20 {
            let update = lib.update_folders().await.unwrap();
            assert!(update.added.is_empty());
        }
        stop.store(true, Ordering::SeqCst);
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_folders_reports_added_and_prunes_locks() {
        let storage = tempfile::tempdir().unwrap();
        let lib = library(storage.path());
        let doomed = lib.create().await.unwrap();
        lib.append_message(&doomed.id, Message::new("", "bye", "")).await.unwrap();
        assert_eq!(lib.write_locks.len(), 1);

        std::fs::remove_dir_all(&doomed.path).unwrap();
        std::fs::create_dir(storage.path().join("Fresh")).unwrap();
        let update = lib.update_folders().await.unwrap();

        assert_eq!(update.removed.len(), 1);
        assert_eq!(update.added.len(), 1);
        assert_eq!(lib.get(&update.added[0]).unwrap().name, "Fresh");
        assert!(lib.write_locks.is_empty());
    }

    #[tokio::test]
    async fn test_update_folders_missing_storage_is_error() {
        let storage = tempfile::tempdir().unwrap();
        let lib = library(&storage.path().join("missing"));
        assert!(matches!(
            lib.update_folders().await,
            Err(ConversationError::StorageMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_message_mutations() {
        let storage = tempfile::tempdir().unwrap();
        let lib = library(storage.path());
        let conv = lib.create().await.unwrap();

        let after_first = lib.append_message(&conv.id, Message::new("", "one", "")).await.unwrap();
        let after_second = lib.append_message(&conv.id, Message::new("", "two", "")).await.unwrap();
        assert_eq!(after_second.len(), 2);
        assert_ne!(after_second[0].id, after_second[1].id);
        assert_eq!(after_first[0].timestamp, "2023-11-14T22:13:20.000Z");
        assert!(conv.path.join("timemessages.json").exists());

        let first_id = after_second[0].id.clone();
        let patch = json!({"content": "uno"}).as_object().unwrap().clone();
        let updated = lib.update_message(&conv.id, &first_id, patch).await.unwrap();
        assert_eq!(updated[0].content, "uno");

        let second_id = updated[1].id.clone();
        let reordered = lib
            .reorder_messages(&conv.id, vec![second_id.clone()])
            .await
            .unwrap();
        assert_eq!(reordered[0].id, second_id);

        let remaining = lib.delete_message(&conv.id, &second_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(matches!(
            lib.delete_message(&conv.id, &second_id).await,
            Err(ConversationError::Store(StoreError::MessageNotFound(_)))
        ));
        assert!(matches!(
            lib.messages("nope").await,
            Err(ConversationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_file_is_not_reimported() {
        let storage = tempfile::tempdir().unwrap();
        let lib = library(storage.path());
        let conv = lib.create().await.unwrap();

        let messages = lib
            .attach_file(&conv.id, "cat.png", b"png", Some("my cat".to_string()))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "my cat");
        let file = &messages[0].files.as_ref().unwrap()[0];
        assert_eq!(file.name, "1700000000000-cat.png");
        assert!(conv.path.join("images").join("1700000000000-cat.png").exists());

        let doc = lib.attach_file(&conv.id, "notes.pdf", b"pdf", None).await.unwrap();
        assert_eq!(doc[1].content, "1700000000000-notes.pdf");
        assert!(conv.path.join("1700000000000-notes.pdf").exists());

        assert!(lib.reconcile(&conv.id).await.unwrap().imported.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_and_delete() {
        let storage = tempfile::tempdir().unwrap();
        let lib = library(storage.path());
        let conv = lib.create().await.unwrap();
        std::fs::write(conv.path.join("photo.png"), "p").unwrap();

        let mut events = lib.subscribe();
        let outcome = lib.reconcile(&conv.id).await.unwrap();
        assert_eq!(outcome.imported.len(), 1);
        assert!(matches!(events.try_recv(), Ok(LibraryEvent::Reconciled { imported: 1, .. })));
        assert_eq!(lib.reconcile_all().await, 0);
        assert_eq!(lib.files(&conv.id).await.unwrap().len(), 1);

        let renamed = lib.rename(&conv.id, "Holiday").await.unwrap();
        assert_eq!(lib.get(&conv.id).unwrap().name, "Holiday");
        assert_eq!(lib.find_by_path(&renamed.path.join("photo.png")).unwrap().id, conv.id);

        lib.delete(&conv.id).await.unwrap();
        assert!(lib.is_empty());
        assert!(!renamed.path.exists());
    }
}
