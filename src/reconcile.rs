//! Reconciler - finds files on disk that no message represents yet.
//!
//! The message list is the source of truth for "already represented", the
//! folder scan for "what exists". All lookup tables are built per call.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

use crate::paths;
use crate::reply::{self, MessageIndex};
use crate::scanner::FileDescriptor;
use crate::store::Message;

/// `![alt](file://...)` or `![alt](local-file://...)`
static MARKDOWN_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[[^\]]*\]\(\s*<?((?:local-file|file)://[^)\s>]+)>?\s*\)")
        .expect("markdown image pattern is valid")
});

/// Where a referenced path was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    TxtFile,
    Attachment,
    SearchImage,
    MarkdownLink,
}

/// Why a scanned file is not an orphan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyReferenced,
    AssistantReply,
    DuplicateOfAttachment,
    GeneratedImageRescan,
}

/// Every file location the messages point at
pub struct ReferenceIndex<'a> {
    paths: HashSet<String>,
    by_basename: HashMap<String, Vec<(String, Provenance)>>,
    messages: MessageIndex<'a>,
}

impl<'a> ReferenceIndex<'a> {
    pub fn build(messages: &'a [Message]) -> Self {
        let mut index = Self {
            paths: HashSet::new(),
            by_basename: HashMap::new(),
            messages: MessageIndex::new(messages),
        };

        for msg in messages {
            if let Some(txt) = &msg.txt_file {
                index.insert(&txt.path, Provenance::TxtFile);
            }
            for file in msg.files.iter().flatten() {
                index.insert(&file.path, Provenance::Attachment);
            }
            for image in msg.search_images.iter().flatten() {
                if image.url.starts_with("file://") {
                    index.insert(&image.url, Provenance::SearchImage);
                }
            }
            for link in markdown_image_links(&msg.content) {
                index.insert(link, Provenance::MarkdownLink);
            }
        }
        index
    }

    fn insert(&mut self, raw: &str, provenance: Provenance) {
        if raw.is_empty() {
            return;
        }
        let normalized = paths::normalize(raw);
        self.by_basename
            .entry(paths::basename(&normalized).to_string())
            .or_default()
            .push((normalized.clone(), provenance));
        self.paths.insert(normalized);
    }

    pub fn contains(&self, normalized: &str) -> bool {
        self.paths.contains(normalized)
    }

    /// Why `file` should not be imported, if it should not
    pub fn skip_reason(&self, file: &FileDescriptor) -> Option<SkipReason> {
        self.skip_reason_with_text(file, None)
    }

    /// `skip_reason` that also checks a text file's content against the
    /// messages when the caller has read it
    pub fn skip_reason_with_text(&self, file: &FileDescriptor, text: Option<&str>) -> Option<SkipReason> {
        let normalized = paths::normalize(&file.path.to_string_lossy());
        if self.contains(&normalized) {
            return Some(SkipReason::AlreadyReferenced);
        }

        if file.is_text() && reply::is_assistant_reply(&file.name, text, &self.messages) {
            return Some(SkipReason::AssistantReply);
        }

        if file.is_image() {
            let base = paths::basename(&normalized);
            let seen = self.by_basename.get(base);

            if paths::is_in_images_dir(&normalized)
                && seen.is_some_and(|refs| refs.iter().any(|(p, _)| !paths::is_in_images_dir(p)))
            {
                return Some(SkipReason::DuplicateOfAttachment);
            }
            if base.starts_with("image_") && seen.is_some() {
                return Some(SkipReason::GeneratedImageRescan);
            }
        }
        None
    }
}

/// Extract `file://` / `local-file://` targets of markdown image links
pub fn markdown_image_links(content: &str) -> Vec<&str> {
    MARKDOWN_IMAGE
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Scanned files that no existing message represents. Text files are judged
/// by name only; see `find_orphans_with_texts` for the content check.
pub fn find_orphans(existing: &[Message], scanned: &[FileDescriptor]) -> Vec<FileDescriptor> {
    find_orphans_with_texts(existing, scanned, &HashMap::new())
}

/// `find_orphans` with the contents of text files, keyed by path. A text file
/// whose content some message already holds is not an orphan.
pub fn find_orphans_with_texts(
    existing: &[Message],
    scanned: &[FileDescriptor],
    texts: &HashMap<PathBuf, String>,
) -> Vec<FileDescriptor> {
    let index = ReferenceIndex::build(existing);
    scanned
        .iter()
        .filter(|file| match index.skip_reason_with_text(file, texts.get(&file.path).map(String::as_str)) {
            Some(reason) => {
                debug!("Skipping {}: {:?}", file.path.display(), reason);
                false
            }
            None => true,
        })
        .cloned()
        .collect()
}
