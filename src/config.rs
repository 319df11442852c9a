//! Runtime configuration from environment variables.

use std::path::PathBuf;

const DEFAULT_PORT: u16 = 4860;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root folder holding one sub-folder per conversation
    pub storage_path: PathBuf,
    pub port: u16,
    /// Run the file-system watcher
    pub watch: bool,
    pub static_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = lookup("HOME").unwrap_or_else(|| "/home/user".to_string());
        let storage_path = lookup("CHATFOLD_STORAGE_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&home).join("Chatfold"));
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let watch = lookup("CHATFOLD_WATCH")
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "off" | "no"))
            .unwrap_or(true);
        let static_dir = lookup("CHATFOLD_STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("static"));

        Self {
            storage_path,
            port,
            watch,
            static_dir,
        }
    }
}
