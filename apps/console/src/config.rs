use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use store::config::{CollectionNames, StoreConfig};

#[derive(Debug)]
pub struct Settings {
    pub database_url: String,
    pub prefix: Option<String>,
    pub collections: CollectionNames,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "memory".into(),
            prefix: None,
            collections: CollectionNames::default(),
        }
    }
}

impl Settings {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            names: self.collections.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

/// Reads `console.toml` (or the given file) when present, then applies
/// environment overrides. Missing files are not an error.
pub fn load_settings(path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();
    let path = path.unwrap_or(Path::new("console.toml"));

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("prefix") {
                settings.prefix = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("sessions_collection") {
                settings.collections.sessions = v.clone();
            }
            if let Some(v) = file_cfg.get("messages_collection") {
                settings.collections.messages = v.clone();
            }
            if let Some(v) = file_cfg.get("activity_collection") {
                settings.collections.activity = v.clone();
            }
            if let Some(v) = file_cfg.get("members_collection") {
                settings.collections.members = v.clone();
            }
            if let Some(v) = file_cfg.get("profiles_collection") {
                settings.collections.profiles = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_PREFIX") {
        settings.prefix = Some(v);
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return "sqlite://./chat.db".into();
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
