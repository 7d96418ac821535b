use std::{env, fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "CHAT_CORE__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
}

/// Tunables of one channel session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSettings {
    pub max_upload_bytes: u64,
    pub typing_debounce: Duration,
    pub typing_idle_timeout: Duration,
    /// Longest a remote user's typing entry is kept, whatever expiry the server sent.
    pub typing_expiry: Duration,
    pub command_prefix: char,
    pub mention_trigger: char,
    pub command_buffer: usize,
    pub notice_buffer: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: 20 * 1024 * 1024,
            typing_debounce: Duration::from_millis(3_000),
            typing_idle_timeout: Duration::from_millis(5_000),
            typing_expiry: Duration::from_millis(7_000),
            command_prefix: '/',
            mention_trigger: '@',
            command_buffer: 64,
            notice_buffer: 64,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    max_upload_bytes: Option<u64>,
    typing_debounce_ms: Option<u64>,
    typing_idle_timeout_ms: Option<u64>,
    typing_expiry_ms: Option<u64>,
    command_prefix: Option<String>,
    mention_trigger: Option<String>,
    command_buffer: Option<usize>,
    notice_buffer: Option<usize>,
}

impl CoreSettings {
    /// Defaults, then the optional TOML file, then `CHAT_CORE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some(read_file_settings(path)?),
            None => None,
        };
        Self::from_sources(file, |key| env::var(key).ok())
    }

    fn from_sources<F>(file: Option<FileSettings>, mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(file) = file {
            settings.apply_file(file)?;
        }

        if let Some(v) = env_value("MAX_UPLOAD_BYTES", &mut lookup) {
            settings.max_upload_bytes = parse_number("MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = env_value("TYPING_DEBOUNCE_MS", &mut lookup) {
            settings.typing_debounce = Duration::from_millis(parse_number("TYPING_DEBOUNCE_MS", &v)?);
        }
        if let Some(v) = env_value("TYPING_IDLE_TIMEOUT_MS", &mut lookup) {
            settings.typing_idle_timeout =
                Duration::from_millis(parse_number("TYPING_IDLE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = env_value("TYPING_EXPIRY_MS", &mut lookup) {
            settings.typing_expiry = Duration::from_millis(parse_number("TYPING_EXPIRY_MS", &v)?);
        }
        if let Some(v) = env_value("COMMAND_PREFIX", &mut lookup) {
            settings.command_prefix = parse_trigger("COMMAND_PREFIX", &v)?;
        }
        if let Some(v) = env_value("MENTION_TRIGGER", &mut lookup) {
            settings.mention_trigger = parse_trigger("MENTION_TRIGGER", &v)?;
        }
        if let Some(v) = env_value("COMMAND_BUFFER", &mut lookup) {
            settings.command_buffer = parse_number("COMMAND_BUFFER", &v)?;
        }
        if let Some(v) = env_value("NOTICE_BUFFER", &mut lookup) {
            settings.notice_buffer = parse_number("NOTICE_BUFFER", &v)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn apply_file(&mut self, file: FileSettings) -> Result<(), ConfigError> {
        if let Some(v) = file.max_upload_bytes {
            self.max_upload_bytes = v;
        }
        if let Some(v) = file.typing_debounce_ms {
            self.typing_debounce = Duration::from_millis(v);
        }
        if let Some(v) = file.typing_idle_timeout_ms {
            self.typing_idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.typing_expiry_ms {
            self.typing_expiry = Duration::from_millis(v);
        }
        if let Some(v) = file.command_prefix {
            self.command_prefix = parse_trigger("command_prefix", &v)?;
        }
        if let Some(v) = file.mention_trigger {
            self.mention_trigger = parse_trigger("mention_trigger", &v)?;
        }
        if let Some(v) = file.command_buffer {
            self.command_buffer = v;
        }
        if let Some(v) = file.notice_buffer {
            self.notice_buffer = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_upload_bytes".to_owned(),
                value: "0".to_owned(),
                reason: "must be at least 1",
            });
        }
        if self.command_prefix == self.mention_trigger {
            return Err(ConfigError::InvalidValue {
                key: "mention_trigger".to_owned(),
                value: self.mention_trigger.to_string(),
                reason: "must differ from the command prefix",
            });
        }
        if self.typing_idle_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "typing_idle_timeout_ms".to_owned(),
                value: "0".to_owned(),
                reason: "must be greater than 0",
            });
        }
        Ok(())
    }
}

fn read_file_settings(path: &Path) -> Result<FileSettings, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn env_value<F>(key: &str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(&format!("{ENV_PREFIX}{key}"))
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
        reason: "expected a non-negative integer",
    })
}

fn parse_trigger(key: &str, value: &str) -> Result<char, ConfigError> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_whitespace() => Ok(c),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
            reason: "expected exactly one non-whitespace character",
        }),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
