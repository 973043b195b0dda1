use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Context};
use dg_core::core::{Clock, SystemClock};
use dg_store::{CatalogStore, SqliteCatalogStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, BlobBackendConfig, LogFormat};
use crate::ingest::ResultsIngestor;
use crate::queue::JobQueue;
use crate::service::CatalogService;

// ---------------------------------------------------------------------------
// Runtime pieces handed to component constructors
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Database {
    InMemory,
    File(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobBackend {
    Filesystem(PathBuf),
    Memory,
}

/// Top-level key namespaces of the durable job queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub dataset_job_class: String,
    pub fine_tune_job_class: String,
}

/// Where and how result files are discovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultsSettings {
    pub prefix: String,
    pub extension: String,
    pub page_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let config = crate::config::QueueConfig::default();
        Self {
            dataset_job_class: config.dataset_job_class,
            fine_tune_job_class: config.fine_tune_job_class,
        }
    }
}

impl Default for ResultsSettings {
    fn default() -> Self {
        let config = crate::config::ResultsConfig::default();
        Self {
            prefix: config.prefix,
            extension: config.extension,
            page_size: config.page_size,
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig — fully validated runtime configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database: Database,
    pub blob: BlobBackend,
    pub queue: QueueSettings,
    pub results: ResultsSettings,
    pub default_output_chars: u32,
}

// ---------------------------------------------------------------------------
// into_runtime — converts raw AppConfig into validated RuntimeConfig
// ---------------------------------------------------------------------------

pub fn into_runtime(config: AppConfig) -> Result<RuntimeConfig, anyhow::Error> {
    let queue = config.queue;
    for (name, class) in [
        ("dataset_job_class", &queue.dataset_job_class),
        ("fine_tune_job_class", &queue.fine_tune_job_class),
    ] {
        ensure!(!class.trim().is_empty(), "queue.{name} must not be empty");
        ensure!(!class.contains('/'), "queue.{name} must not contain '/'");
    }
    ensure!(
        queue.dataset_job_class != queue.fine_tune_job_class,
        "queue job classes must differ"
    );

    let results = config.results;
    ensure!(
        !results.prefix.trim_matches('/').is_empty(),
        "results.prefix must not be empty"
    );
    ensure!(
        !results.extension.trim_start_matches('.').is_empty(),
        "results.extension must not be empty"
    );
    ensure!(results.page_size >= 1, "results.page_size must be at least 1");

    ensure!(
        config.generation.default_output_chars >= 1,
        "generation.default_output_chars must be at least 1"
    );

    let blob = match config.blob.backend {
        BlobBackendConfig::Filesystem => match config.blob.root {
            Some(root) => BlobBackend::Filesystem(root),
            None => anyhow::bail!("blob.root is required for the filesystem backend"),
        },
        BlobBackendConfig::Memory => BlobBackend::Memory,
    };

    let database = match config.storage.database.trim() {
        "" => anyhow::bail!("storage.database must not be empty"),
        ":memory:" => Database::InMemory,
        path => Database::File(PathBuf::from(path)),
    };

    Ok(RuntimeConfig {
        listen_addr: config.server.listen,
        log_level: config.logging.level,
        log_format: config.logging.format,
        database,
        blob,
        queue: QueueSettings {
            dataset_job_class: queue.dataset_job_class,
            fine_tune_job_class: queue.fine_tune_job_class,
        },
        results: ResultsSettings {
            prefix: results.prefix.trim_matches('/').to_owned(),
            extension: results.extension.trim_start_matches('.').to_owned(),
            page_size: results.page_size,
        },
        default_output_chars: config.generation.default_output_chars,
    })
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!(e))
}

// ---------------------------------------------------------------------------
// build_service — wires store, blob store, queue and ingestor
// ---------------------------------------------------------------------------

pub fn build_service(runtime: &RuntimeConfig) -> Result<CatalogService, anyhow::Error> {
    let store = match &runtime.database {
        Database::InMemory => SqliteCatalogStore::new_in_memory(),
        Database::File(path) => SqliteCatalogStore::new(path),
    }
    .context("opening catalog database")?;
    store.init().context("initializing catalog schema")?;

    let blob = crate::blob::build(&runtime.blob)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    info!(database = ?runtime.database, blob = ?runtime.blob, "catalog wired");

    Ok(CatalogService::new(
        Arc::new(store) as Arc<dyn CatalogStore>,
        JobQueue::new(Arc::clone(&blob), runtime.queue.clone(), Arc::clone(&clock)),
        ResultsIngestor::new(blob, runtime.results.clone()),
        clock,
        runtime.default_output_chars,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlobConfig, StorageConfig};

    fn make_config() -> AppConfig {
        AppConfig {
            blob: BlobConfig {
                backend: BlobBackendConfig::Filesystem,
                root: Some(PathBuf::from("/srv/blobs")),
            },
            ..AppConfig::default()
        }
    }

    fn expect_error(config: AppConfig, needle: &str) {
        match into_runtime(config) {
            Err(e) => assert!(e.to_string().contains(needle), "{e}"),
            Ok(_) => panic!("expected error containing {needle:?}"),
        }
    }

    #[test]
    fn test_valid_config_conversion() {
        let runtime = into_runtime(make_config()).expect("valid config should convert");

        assert_eq!(runtime.listen_addr, "0.0.0.0:8080");
        assert_eq!(runtime.log_format, LogFormat::Json);
        assert_eq!(runtime.database, Database::File(PathBuf::from("datagen.db")));
        assert_eq!(runtime.blob, BlobBackend::Filesystem(PathBuf::from("/srv/blobs")));
        assert_eq!(runtime.queue, QueueSettings::default());
        assert_eq!(runtime.results, ResultsSettings::default());
        assert_eq!(runtime.default_output_chars, 2000);
    }

    #[test]
    fn test_memory_backends() {
        let mut config = make_config();
        config.blob.backend = BlobBackendConfig::Memory;
        config.blob.root = None;
        config.storage = StorageConfig {
            database: ":memory:".to_owned(),
        };

        let runtime = into_runtime(config).expect("memory config should convert");
        assert_eq!(runtime.blob, BlobBackend::Memory);
        assert_eq!(runtime.database, Database::InMemory);
    }

    #[test]
    fn test_results_settings_are_normalized() {
        let mut config = make_config();
        config.results.prefix = "/outputs/".to_owned();
        config.results.extension = ".json".to_owned();

        let runtime = into_runtime(config).expect("valid config");
        assert_eq!(runtime.results.prefix, "outputs");
        assert_eq!(runtime.results.extension, "json");
    }

    #[test]
    fn test_filesystem_requires_root() {
        let mut config = make_config();
        config.blob.root = None;
        expect_error(config, "blob.root is required");
    }

    #[test]
    fn test_job_classes_rejected() {
        let mut config = make_config();
        config.queue.dataset_job_class = " ".to_owned();
        expect_error(config, "queue.dataset_job_class must not be empty");

        let mut config = make_config();
        config.queue.fine_tune_job_class = "jobs/fine".to_owned();
        expect_error(config, "must not contain '/'");

        let mut config = make_config();
        config.queue.fine_tune_job_class = config.queue.dataset_job_class.clone();
        expect_error(config, "queue job classes must differ");
    }

    #[test]
    fn test_results_rejected() {
        let mut config = make_config();
        config.results.page_size = 0;
        expect_error(config, "results.page_size must be at least 1");

        let mut config = make_config();
        config.results.prefix = "/".to_owned();
        expect_error(config, "results.prefix must not be empty");

        let mut config = make_config();
        config.results.extension = String::new();
        expect_error(config, "results.extension must not be empty");
    }

    #[tokio::test]
    async fn test_build_service_with_memory_backends() {
        let mut config = make_config();
        config.blob.backend = BlobBackendConfig::Memory;
        config.storage.database = ":memory:".to_owned();
        let runtime = into_runtime(config).expect("valid config");

        let service = build_service(&runtime).expect("service");
        let project = service
            .create_project(crate::service::NewProject {
                name: "wired".into(),
            })
            .await
            .expect("store is initialized");
        assert_eq!(project.name, "wired");
    }

    #[test]
    fn test_empty_database_rejected() {
        let mut config = make_config();
        config.storage.database = String::new();
        expect_error(config, "storage.database must not be empty");
    }
}
