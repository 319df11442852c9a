//! Folder scanner - lists the attachment files that exist in a conversation folder.
//!
//! Scans the folder itself plus its optional `images/` subfolder. Directories
//! and the reserved JSON documents are skipped. Produces fresh descriptors on
//! every call; nothing here is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

pub const MESSAGES_FILE: &str = "messages.json";
pub const TIME_MESSAGES_FILE: &str = "timemessages.json";
pub const IMAGES_DIR: &str = "images";
/// In-flight document written by the store before its atomic rename
pub const MESSAGES_TEMP_FILE: &str = ".messages.json.tmp";

const RESERVED_FILES: &[&str] = &[MESSAGES_FILE, TIME_MESSAGES_FILE, MESSAGES_TEMP_FILE];

const IMAGE_EXTS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "ico", "tif", "tiff", "avif",
];
const VIDEO_EXTS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv", "m4v"];
const AUDIO_EXTS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac", "aac"];

/// Coarse class of a file, decided by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Text,
    Other,
}

impl FileKind {
    /// `ext` is lowercase with a leading dot
    pub fn from_ext(ext: &str) -> Self {
        let bare = ext.trim_start_matches('.');
        if IMAGE_EXTS.contains(&bare) {
            FileKind::Image
        } else if VIDEO_EXTS.contains(&bare) {
            FileKind::Video
        } else if AUDIO_EXTS.contains(&bare) {
            FileKind::Audio
        } else if bare == "txt" {
            FileKind::Text
        } else {
            FileKind::Other
        }
    }
}

/// A file found on disk during a scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDescriptor {
    pub name: String,
    pub path: PathBuf,
    /// Lowercase extension with leading dot, empty if none
    #[serde(rename = "type")]
    pub file_type: String,
    pub mimetype: String,
    pub size: u64,
    /// Modification time, epoch ms
    pub timestamp: i64,
}

impl FileDescriptor {
    pub fn kind(&self) -> FileKind {
        FileKind::from_ext(&self.file_type)
    }

    pub fn is_image(&self) -> bool {
        self.kind() == FileKind::Image
    }

    pub fn is_text(&self) -> bool {
        self.kind() == FileKind::Text
    }
}

/// Lowercase extension with leading dot (`"Photo.PNG"` -> `".png"`)
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// MIME-ish label for an extension. Unknown extensions map to the raw extension.
pub fn mimetype_for(ext: &str) -> String {
    let bare = ext.trim_start_matches('.');
    match FileKind::from_ext(ext) {
        FileKind::Image => match bare {
            "jpg" => "image/jpeg".to_string(),
            "svg" => "image/svg+xml".to_string(),
            "tif" => "image/tiff".to_string(),
            _ => format!("image/{}", bare),
        },
        FileKind::Video => match bare {
            "mov" => "video/quicktime".to_string(),
            _ => format!("video/{}", bare),
        },
        FileKind::Audio => match bare {
            "mp3" => "audio/mpeg".to_string(),
            _ => format!("audio/{}", bare),
        },
        FileKind::Text => "text/plain".to_string(),
        FileKind::Other => ext.to_string(),
    }
}

/// Scan a conversation folder and its `images/` subfolder.
///
/// A folder that cannot be listed yields an empty list. That means "no files
/// found", not "folder verified empty"; callers that care about existence must
/// check it themselves.
pub async fn scan(conversation_path: &Path) -> Vec<FileDescriptor> {
    let mut files = match scan_dir(conversation_path).await {
        Ok(files) => files,
        Err(e) => {
            debug!("Cannot scan {}: {}", conversation_path.display(), e);
            return Vec::new();
        }
    };

    let images_dir = conversation_path.join(IMAGES_DIR);
    match scan_dir(&images_dir).await {
        Ok(images) => files.extend(images),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot scan {}: {}", images_dir.display(), e),
    }

    files
}

async fn scan_dir(dir: &Path) -> std::io::Result<Vec<FileDescriptor>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if RESERVED_FILES.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        // metadata follows symlinks so a linked file counts as a file
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                continue;
            }
        };
        if meta.is_dir() {
            continue;
        }

        let timestamp = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        let file_type = extension_of(&name);
        files.push(FileDescriptor {
            mimetype: mimetype_for(&file_type),
            file_type,
            name,
            path,
            size: meta.len(),
            timestamp,
        });
    }

    // read_dir order is platform dependent
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
