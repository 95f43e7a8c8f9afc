use meisai_import::{MatchConfig, PipelineOptions, DEFAULT_RETAINED_SESSIONS};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const CONFIG_ENV: &str = "MEISAI_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "meisai.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub import: ImportSettings,
    pub hash_index: HashIndexSettings,
    pub matching: MatchingSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    /// Upper bound on any request body, whole-file imports included.
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "127.0.0.1:8080".to_string(),
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// `sqlite::memory:`, a `sqlite:` URL or a plain file path.
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            url: "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    #[serde(flatten)]
    pub pipeline: PipelineOptions,
    /// Track records by date, time and card so edited rows are reported as
    /// changes instead of new records.
    pub detect_changes: bool,
    /// Finished sessions kept for status lookups.
    pub retained_sessions: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        ImportSettings {
            pipeline: PipelineOptions::default(),
            detect_changes: false,
            retained_sessions: DEFAULT_RETAINED_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HashIndexSettings {
    /// Rebuild the index from stored records on boot.
    pub warm_start: bool,
}

impl Default for HashIndexSettings {
    fn default() -> Self {
        HashIndexSettings { warm_start: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    #[serde(flatten)]
    pub engine: MatchConfig,
    pub auto_confirm_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let settings = Settings::parse(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        Ok(settings)
    }

    pub fn parse(text: &str) -> Result<Settings, ConfigError> {
        let settings: Settings = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// `MEISAI_CONFIG` when set, otherwise `meisai.toml` in the working
    /// directory.
    pub fn from_env() -> Result<Settings, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Settings::load(Path::new(&path))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.matching
            .engine
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(t) = self.matching.auto_confirm_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConfigError::Invalid(format!(
                    "auto_confirm_threshold must be within [0, 1], got {t}"
                )));
            }
        }
        let rate = self.import.pipeline.max_error_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::Invalid(format!(
                "max_error_rate must be within [0, 1], got {rate}"
            )));
        }
        if self.import.pipeline.progress_buffer == 0 || self.import.pipeline.chunk_buffer == 0 {
            return Err(ConfigError::Invalid(
                "progress_buffer and chunk_buffer must be at least 1".to_string(),
            ));
        }
        if self.import.retained_sessions == 0 {
            return Err(ConfigError::Invalid("retained_sessions must be at least 1".to_string()));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid("max_upload_bytes must be positive".to_string()));
        }
        Ok(())
    }
}
