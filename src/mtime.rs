//! Conversation modification time, resolved through an ordered provider chain.
//!
//! Order: folder metadata, `timemessages.json`, `messages.json` metadata, the
//! conversation's creation timestamp. The first provider that answers wins;
//! the others' failures are logged with their typed reason.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::scanner::{MESSAGES_FILE, TIME_MESSAGES_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtimeSource {
    FolderMetadata,
    TimeMessagesFile,
    MessagesDocument,
    CreationTimestamp,
}

const PROVIDERS: [MtimeSource; 4] = [
    MtimeSource::FolderMetadata,
    MtimeSource::TimeMessagesFile,
    MtimeSource::MessagesDocument,
    MtimeSource::CreationTimestamp,
];

#[derive(Debug, thiserror::Error)]
pub enum MtimeFailure {
    #[error("metadata unavailable: {0}")]
    Metadata(std::io::Error),
    #[error("cannot read {file}: {source}")]
    Unreadable {
        file: &'static str,
        source: std::io::Error,
    },
    #[error("{file} has no usable folderMtime")]
    NoFolderMtime { file: &'static str },
    #[error("unparseable timestamp {0:?}")]
    Unparseable(String),
    #[error("no creation timestamp")]
    NoCreationTimestamp,
}

/// One entry of `timemessages.json`
#[derive(Debug, Serialize, Deserialize)]
struct TimeRecord {
    #[serde(rename = "folderMtime")]
    folder_mtime: Value,
}

/// Resolve the modification time of a conversation folder.
pub async fn folder_modified_time(
    folder: &Path,
    created: Option<&str>,
) -> Option<(DateTime<Utc>, MtimeSource)> {
    for source in PROVIDERS {
        match try_source(source, folder, created).await {
            Ok(ts) => return Some((ts, source)),
            Err(reason) => debug!("{}: {:?} failed: {}", folder.display(), source, reason),
        }
    }
    None
}

async fn try_source(
    source: MtimeSource,
    folder: &Path,
    created: Option<&str>,
) -> Result<DateTime<Utc>, MtimeFailure> {
    match source {
        MtimeSource::FolderMetadata => file_mtime(folder).await,
        MtimeSource::TimeMessagesFile => time_messages_mtime(folder).await,
        MtimeSource::MessagesDocument => file_mtime(&folder.join(MESSAGES_FILE)).await,
        MtimeSource::CreationTimestamp => {
            let raw = created.ok_or(MtimeFailure::NoCreationTimestamp)?;
            parse_timestamp(&Value::String(raw.to_string()))
        }
    }
}

async fn file_mtime(path: &Path) -> Result<DateTime<Utc>, MtimeFailure> {
    let meta = fs::metadata(path).await.map_err(MtimeFailure::Metadata)?;
    let modified = meta.modified().map_err(MtimeFailure::Metadata)?;
    Ok(DateTime::<Utc>::from(modified))
}

async fn time_messages_mtime(folder: &Path) -> Result<DateTime<Utc>, MtimeFailure> {
    let raw = fs::read_to_string(folder.join(TIME_MESSAGES_FILE))
        .await
        .map_err(|source| MtimeFailure::Unreadable {
            file: TIME_MESSAGES_FILE,
            source,
        })?;
    let records: Vec<TimeRecord> = serde_json::from_str(&raw)
        .map_err(|_| MtimeFailure::NoFolderMtime { file: TIME_MESSAGES_FILE })?;
    let record = records
        .first()
        .ok_or(MtimeFailure::NoFolderMtime { file: TIME_MESSAGES_FILE })?;
    parse_timestamp(&record.folder_mtime)
}

/// Accepts an RFC 3339 string, an epoch-ms number, or a numeric string
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, MtimeFailure> {
    let from_millis = |ms: i64| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| MtimeFailure::Unparseable(ms.to_string()))
    };
    match value {
        Value::Number(n) => match n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
            Some(ms) => from_millis(ms),
            None => Err(MtimeFailure::Unparseable(n.to_string())),
        },
        Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return from_millis(ms);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| MtimeFailure::Unparseable(s.clone()))
        }
        other => Err(MtimeFailure::Unparseable(other.to_string())),
    }
}

/// Record `now` as the folder's modification time in `timemessages.json`
pub async fn record_folder_mtime(folder: &Path, now: DateTime<Utc>) -> std::io::Result<()> {
    let records = [TimeRecord {
        folder_mtime: Value::String(crate::ids::iso(now)),
    }];
    let json = serde_json::to_string_pretty(&records)?;
    fs::write(folder.join(TIME_MESSAGES_FILE), json).await
}
