//! Operator config file.
//!
//! Lives at `~/.config/planbot/config.toml` (overridable via
//! `PLANBOT_CONFIG`). Holds what does not belong in queue files: the
//! assistant binary path, webhook port + shared secret, and Telegram
//! credentials.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Default webhook port.
pub const DEFAULT_WEBHOOK_PORT: u16 = 8321;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    /// Path to the assistant binary; defaults to `claude` on `$PATH`.
    pub binary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    pub port: u16,
    /// Hex-encoded shared secret for request signing.
    pub secret: Option<String>,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_WEBHOOK_PORT,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub driver: DriverSection,
    pub webhook: WebhookSection,
    pub telegram: TelegramSection,
}

impl ConfigFile {
    /// Decode the webhook secret, if configured.
    pub fn webhook_secret(&self) -> Result<Option<Vec<u8>>> {
        match &self.webhook.secret {
            None => Ok(None),
            Some(hex_str) => {
                let bytes = hex::decode(hex_str)
                    .context("webhook.secret in the config file is not valid hex")?;
                Ok(Some(bytes))
            }
        }
    }

    /// Telegram credentials, when both parts are configured.
    pub fn telegram_credentials(&self) -> Option<(String, i64)> {
        match (&self.telegram.bot_token, self.telegram.chat_id) {
            (Some(token), Some(chat_id)) => Some((token.clone(), chat_id)),
            _ => None,
        }
    }
}

/// Path to the operator config file.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PLANBOT_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("planbot")
        .join("config.toml")
}

/// Load the config file, or defaults when none exists.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Write the config file, creating parent directories.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(config).context("failed to render config")?;
    std::fs::write(&path, rendered)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(path)
}

/// Generate a fresh 32-byte webhook secret, hex encoded.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
