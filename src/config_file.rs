use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env_optional;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "inboxpilot.json";

/// On-disk settings. Keys are the environment variable names; the process
/// environment always wins over values stored here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) settings: BTreeMap<String, serde_json::Value>,
}

impl FileConfig {
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        let value = self.settings.get(key)?;
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };
        if text.trim().is_empty() { None } else { Some(text) }
    }

    pub(crate) fn set(&mut self, key: &str, value: &str) {
        self.settings
            .insert(key.to_string(), serde_json::Value::String(value.to_string()));
    }
}

pub(crate) fn config_file_path() -> PathBuf {
    env_optional("INBOXPILOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

pub(crate) fn load_file_config(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
                FileConfig::default()
            }
        },
        Err(_) => FileConfig::default(),
    }
}

pub(crate) fn save_file_config(
    path: &Path,
    config: &FileConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
