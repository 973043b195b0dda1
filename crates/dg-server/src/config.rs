use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file path, or `:memory:`.
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: "datagen.db".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub backend: BlobBackendConfig,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BlobBackendConfig {
    #[default]
    Filesystem,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub dataset_job_class: String,
    pub fine_tune_job_class: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dataset_job_class: "dataset_generation".to_owned(),
            fine_tune_job_class: "fine_tune".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub prefix: String,
    pub extension: String,
    pub page_size: usize,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            prefix: "results".to_owned(),
            extension: "json".to_owned(),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Expected output size sent with multi-field jobs that do not set one.
    pub default_output_chars: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_output_chars: 2000,
        }
    }
}
