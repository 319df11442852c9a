//! Reconciliation of one conversation folder against its message document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::ids::Clock;
use crate::reconcile;
use crate::scanner::{self, FileDescriptor};
use crate::store::{Message, MessageStore, StoreError};
use crate::synth;

/// Result of one reconciliation run
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub scanned: usize,
    pub orphans: usize,
    pub imported: Vec<Message>,
}

/// Load, scan, find orphans, synthesize, save.
///
/// Nothing is written when no message was synthesized. Not safe to run
/// concurrently with another writer of the same folder.
pub async fn reconcile_folder(folder: &Path, clock: &dyn Clock) -> Result<SyncOutcome, StoreError> {
    let store = MessageStore::new(folder);
    let mut messages = store.load().await?;
    let files = scanner::scan(folder).await;
    let candidates = reconcile::find_orphans(&messages, &files);
    let texts = read_texts(&candidates).await;
    let orphans = reconcile::find_orphans_with_texts(&messages, &candidates, &texts);

    if orphans.is_empty() {
        debug!("{}: {} files, nothing to import", folder.display(), files.len());
        return Ok(SyncOutcome {
            scanned: files.len(),
            ..Default::default()
        });
    }

    let imported = synth::synthesize(&orphans, &messages, &texts, clock);
    if !imported.is_empty() {
        messages.extend(imported.iter().cloned());
        store.save(&mut messages, clock).await?;
        info!(
            "{}: imported {} messages for {} orphan files",
            folder.display(),
            imported.len(),
            orphans.len()
        );
    }

    Ok(SyncOutcome {
        scanned: files.len(),
        orphans: orphans.len(),
        imported,
    })
}

/// Contents of the candidate `.txt` files. Unreadable files are left out and
/// get their file name as content.
async fn read_texts(orphans: &[FileDescriptor]) -> HashMap<PathBuf, String> {
    let mut texts = HashMap::new();
    for file in orphans.iter().filter(|f| f.is_text()) {
        match fs::read_to_string(&file.path).await {
            Ok(text) => {
                texts.insert(file.path.clone(), text);
            }
            Err(e) => warn!("Cannot read {}: {}", file.path.display(), e),
        }
    }
    texts
}
