//! Storage watcher - reconciles conversation folders when files change.
//!
//! Watches the storage root recursively. A change inside a known conversation
//! folder reconciles that folder; a change that belongs to no known
//! conversation (a new folder, a removed one) runs an update-folders pass.
//! Writes to the reserved JSON documents are ignored, which keeps our own
//! saves from re-triggering the watcher.

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::conversations::{INDEX_FILE, RECYCLE_BIN};
use crate::library::Library;
use crate::scanner::{MESSAGES_FILE, MESSAGES_TEMP_FILE, TIME_MESSAGES_FILE};

const DEBOUNCE_MS: u64 = 100;

/// What a batch of file events asks for
#[derive(Debug, Default, PartialEq)]
pub struct Pending {
    pub update_folders: bool,
    pub reconcile: HashSet<String>,
}

/// Start the watcher: an initial update + reconcile pass, then the event loop
pub async fn start(library: Arc<Library>) {
    let storage = library.storage().to_path_buf();
    info!("Starting storage watcher on {} (debounce: {}ms)", storage.display(), DEBOUNCE_MS);

    match library.update_folders().await {
        Ok(update) => info!("Initial update: {} conversations", update.conversations.len()),
        Err(e) => {
            error!("Initial folder update failed: {}", e);
            return;
        }
    }
    let imported = library.reconcile_all().await;
    info!("Initial reconcile imported {} messages", imported);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<PathBuf>>(100);

    let watch_path = storage.clone();
    std::thread::spawn(move || {
        let mut debouncer = match new_debouncer(Duration::from_millis(DEBOUNCE_MS), move |res: Result<Vec<DebouncedEvent>, notify::Error>| {
            match res {
                Ok(events) => {
                    debug!("Storage watcher received {} events", events.len());
                    let paths: Vec<PathBuf> = events
                        .into_iter()
                        .filter(|e| matches!(e.kind, DebouncedEventKind::Any))
                        .map(|e| e.path)
                        .collect();
                    if paths.is_empty() {
                        return;
                    }
                    if let Err(e) = tx.blocking_send(paths) {
                        error!("Failed to send file events: {}", e);
                    }
                }
                Err(e) => {
                    error!("Storage watcher error: {:?}", e);
                }
            }
        }) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create storage watcher: {}", e);
                return;
            }
        };

        if let Err(e) = debouncer.watcher().watch(&watch_path, RecursiveMode::Recursive) {
            error!("Failed to watch {}: {}", watch_path.display(), e);
            return;
        }

        info!("Watching {} for conversation changes", watch_path.display());

        // Keep thread alive
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    });

    while let Some(paths) = rx.recv().await {
        let pending = classify(&library, &storage, &paths);
        apply(&library, pending).await;
    }
    warn!("Storage watcher event loop exited!");
}

/// Run what a batch asked for. Folders discovered by the update are
/// reconciled too, since their files arrived before the folder was known.
/// Returns the number of imported messages.
pub async fn apply(library: &Library, mut pending: Pending) -> usize {
    if pending.update_folders {
        match library.update_folders().await {
            Ok(update) => pending.reconcile.extend(update.added),
            Err(e) => warn!("Folder update after file change failed: {}", e),
        }
    }

    let mut imported = 0;
    for id in pending.reconcile {
        match library.reconcile(&id).await {
            Ok(outcome) if !outcome.imported.is_empty() => {
                info!("Watcher imported {} messages into {}", outcome.imported.len(), id);
                imported += outcome.imported.len();
            }
            Ok(_) => {}
            Err(e) => warn!("Reconcile of {} failed: {}", id, e),
        }
    }
    imported
}

/// Sort changed paths into folder updates and per-conversation reconciles
pub fn classify(library: &Library, storage: &Path, paths: &[PathBuf]) -> Pending {
    let mut pending = Pending::default();
    for path in paths {
        let Ok(relative) = path.strip_prefix(storage) else {
            continue;
        };
        let mut components = relative.components();
        let Some(top) = components.next() else {
            continue;
        };
        let top = top.as_os_str().to_string_lossy();
        if top == RECYCLE_BIN || top == INDEX_FILE || top.starts_with('.') {
            continue;
        }
        if is_ignored_file(path) {
            continue;
        }

        let folder = storage.join(&*top);
        let nested = components.next().is_some();
        match library.find_by_path(&folder) {
            Some(conv) if nested => {
                pending.reconcile.insert(conv.id);
            }
            Some(_) => {
                // the folder itself changed; it may be gone
                if !folder.exists() {
                    pending.update_folders = true;
                }
            }
            None => {
                if folder.is_dir() || !nested {
                    pending.update_folders = true;
                }
            }
        }
    }
    pending
}

fn is_ignored_file(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name == MESSAGES_FILE || name == TIME_MESSAGES_FILE || name == MESSAGES_TEMP_FILE,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::test_clock::FixedClock;

    #[tokio::test]
    async fn test_classify() {
        let storage = tempfile::tempdir().unwrap();
        let lib = Library::new(storage.path().to_path_buf(), Arc::new(FixedClock(1)));
        let conv = lib.create().await.unwrap();
        std::fs::create_dir(storage.path().join("Dropped")).unwrap();

        let paths = vec![
            conv.path.join("photo.png"),
            conv.path.join("messages.json"),
            conv.path.join("timemessages.json"),
            conv.path.join(".messages.json.tmp"),
            storage.path().join(RECYCLE_BIN).join("old"),
            storage.path().join(INDEX_FILE),
        ];
        let pending = classify(&lib, storage.path(), &paths);
        assert!(!pending.update_folders);
        assert_eq!(pending.reconcile.len(), 1);
        assert!(pending.reconcile.contains(&conv.id));

        let pending = classify(&lib, storage.path(), &[storage.path().join("Dropped")]);
        assert!(pending.update_folders);
        assert!(pending.reconcile.is_empty());

        let pending = classify(&lib, storage.path(), &[PathBuf::from("/elsewhere/file.png")]);
        assert_eq!(pending, Pending::default());
    }

    #[tokio::test]
    async fn test_copied_folder_is_reconciled() {
        let storage = tempfile::tempdir().unwrap();
        let lib = Library::new(storage.path().to_path_buf(), Arc::new(FixedClock(1_700_000_000_000)));
        let existing = lib.create().await.unwrap();

        let trip = storage.path().join("Trip");
        std::fs::create_dir(&trip).unwrap();
        std::fs::write(trip.join("a.jpg"), "jpg").unwrap();
        std::fs::write(trip.join("b.jpg"), "jpg").unwrap();

        let pending = classify(&lib, storage.path(), &[trip.clone(), trip.join("a.jpg")]);
        assert!(pending.update_folders);
        assert!(pending.reconcile.is_empty());

        assert_eq!(apply(&lib, pending).await, 1);
        let conv = lib.find_by_path(&trip).unwrap();
        let messages = lib.messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].files.as_ref().unwrap().len(), 2);
        assert!(lib.get(&existing.id).is_ok());
    }
}
