//! Message synthesizer - turns orphan files into new message records.
//!
//! Pure: text contents are read by the caller and passed in. The caller also
//! appends the result and saves it through the store.

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::ids::{self, Clock, IdAllocator};
use crate::reply::{self, MessageIndex};
use crate::scanner::{FileDescriptor, FileKind};
use crate::store::{FileRef, Message, MessageType, TxtFile};

/// Max files per synthesized image/file message
pub const BATCH_SIZE: usize = 5;

/// Build messages for `orphans`.
///
/// Each `.txt` becomes its own legacy message (no `type`), unless it looks
/// like an assistant reply. Images, then all remaining files, are grouped
/// `BATCH_SIZE` per `user` message. Every id is unique against `existing` and
/// against the other new messages.
pub fn synthesize(
    orphans: &[FileDescriptor],
    existing: &[Message],
    texts: &HashMap<PathBuf, String>,
    clock: &dyn Clock,
) -> Vec<Message> {
    let index = MessageIndex::new(existing);
    let mut alloc = IdAllocator::for_messages(existing, clock);
    let mut out = Vec::new();

    let mut images = Vec::new();
    let mut others = Vec::new();
    for file in orphans {
        match file.kind() {
            FileKind::Text => {
                let text = texts.get(&file.path).map(String::as_str);
                if reply::is_assistant_reply(&file.name, text, &index) {
                    debug!("Not importing assistant reply {}", file.name);
                    continue;
                }
                out.push(text_message(file, text, alloc.next_id(), clock));
            }
            FileKind::Image => images.push(file),
            _ => others.push(file),
        }
    }

    for batch in images.chunks(BATCH_SIZE) {
        out.push(batch_message(batch, "Images", alloc.next_id(), clock));
    }
    for batch in others.chunks(BATCH_SIZE) {
        out.push(batch_message(batch, "Files", alloc.next_id(), clock));
    }
    out
}

fn text_message(file: &FileDescriptor, text: Option<&str>, id: String, clock: &dyn Clock) -> Message {
    let content = text.map(str::to_string).unwrap_or_else(|| file.name.clone());
    let display_name = Path::new(&file.name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file.name.clone());
    let mut msg = Message::new(id, content, file_timestamp(&[file], clock));
    msg.txt_file = Some(TxtFile {
        name: file.name.clone(),
        display_name,
        path: file.path.to_string_lossy().to_string(),
    });
    msg
}

fn batch_message(batch: &[&FileDescriptor], label: &str, id: String, clock: &dyn Clock) -> Message {
    let names: Vec<&str> = batch.iter().map(|f| f.name.as_str()).collect();
    let mut msg = Message::new(
        id,
        format!("{}: {}", label, names.join(", ")),
        file_timestamp(batch, clock),
    );
    msg.message_type = Some(MessageType::User);
    msg.files = Some(batch.iter().map(|f| file_ref(f)).collect());
    msg
}

pub fn file_ref(file: &FileDescriptor) -> FileRef {
    FileRef {
        name: file.name.clone(),
        path: file.path.to_string_lossy().to_string(),
        file_type: file.file_type.clone(),
        size: file.size,
        extra: Default::default(),
    }
}

/// Latest modification time of the batch, or now if none is usable
fn file_timestamp(batch: &[&FileDescriptor], clock: &dyn Clock) -> String {
    batch
        .iter()
        .map(|f| f.timestamp)
        .filter(|ts| *ts > 0)
        .max()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(ids::iso)
        .unwrap_or_else(|| ids::now_iso(clock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::test_clock::FixedClock;
    use crate::scanner::{extension_of, mimetype_for};
    use std::collections::HashSet;

    fn fd(path: &str) -> FileDescriptor {
        let path = PathBuf::from(path);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let file_type = extension_of(&name);
        FileDescriptor {
            mimetype: mimetype_for(&file_type),
            file_type,
            name,
            path,
            size: 10,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_single_image() {
        let clock = FixedClock(1);
        let msgs = synthesize(&[fd("/c/photo.png")], &[], &HashMap::new(), &clock);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_type, Some(MessageType::User));
        let files = msgs[0].files.as_ref().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "photo.png");
        assert_eq!(files[0].file_type, ".png");
        assert_eq!(msgs[0].timestamp, "2023-11-14T22:13:20.000Z");
        assert!(msgs[0].content.contains("photo.png"));
    }

    #[test]
    fn test_six_images_make_two_batches() {
        let clock = FixedClock(1);
        let orphans: Vec<FileDescriptor> = (1..=6).map(|i| fd(&format!("/c/p{}.jpg", i))).collect();
        let msgs = synthesize(&orphans, &[], &HashMap::new(), &clock);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].files.as_ref().unwrap().len(), 5);
        assert_eq!(msgs[1].files.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_text_files_and_other_files() {
        let clock = FixedClock(1);
        let orphans = vec![fd("/c/a.txt"), fd("/c/b.txt"), fd("/c/doc.pdf"), fd("/c/clip.mp4")];
        let mut texts = HashMap::new();
        texts.insert(PathBuf::from("/c/a.txt"), "alpha".to_string());
        let msgs = synthesize(&orphans, &[], &texts, &clock);
        assert_eq!(msgs.len(), 3);

        assert_eq!(msgs[0].content, "alpha");
        assert_eq!(msgs[0].message_type, None);
        assert_eq!(msgs[0].txt_file.as_ref().unwrap().display_name, "a");
        assert_eq!(msgs[1].content, "b.txt");
        assert_eq!(msgs[2].message_type, Some(MessageType::User));
        assert_eq!(msgs[2].files.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_assistant_reply_text_not_synthesized() {
        let clock = FixedClock(1);
        let existing = vec![Message::new("1700000000000", "The answer is 42", "")];
        let orphans = vec![fd("/c/message_1700000000000.txt"), fd("/c/copy.txt")];
        let mut texts = HashMap::new();
        texts.insert(PathBuf::from("/c/copy.txt"), "The answer is 42".to_string());
        assert!(synthesize(&orphans, &existing, &texts, &clock).is_empty());
    }

    #[test]
    fn test_ids_unique_against_existing_and_each_other() {
        // fixed clock: every id would be "1700000000000" without collision handling
        let clock = FixedClock(1_700_000_000_000);
        let existing = vec![Message::new("1700000000000", "old", "")];
        let orphans: Vec<FileDescriptor> = (0..12).map(|i| fd(&format!("/c/f{}.png", i))).collect();
        let new = synthesize(&orphans, &existing, &HashMap::new(), &clock);
        assert_eq!(new.len(), 3);

        let all: Vec<&str> = existing.iter().chain(new.iter()).map(|m| m.id.as_str()).collect();
        let unique: HashSet<&str> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
    }
}
