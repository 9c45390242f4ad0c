//! Orchestration layer of the donation ledger: backup mirroring, the
//! ingestion pipeline, the operator query service, configuration, and the
//! backend factory. [`DonationApi`] wires them together from one config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use donation_core::{
    validate, DonationStore, RawDonation, StoreBackend, StoreError, ValidationError,
};
use donation_store_mysql::MySqlDonationStore;
use donation_store_sqlite::SqliteDonationStore;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod mirror;
pub mod notify;
pub mod pipeline;
pub mod query;

pub use config::{
    BackendKind, BackupConfig, ConfigArgs, ConfigError, DonationConfig, NotifyConfig, StoreConfig,
};
pub use mirror::{BackupMirror, MirrorError, MirrorOutcome};
pub use notify::{DonationNotifier, LogNotifier, Notification, NotifyError};
pub use pipeline::{IngestReceipt, IngestResponse, IngestStage, IngestionPipeline};
pub use query::{QueryService, SearchResults};

/// Pick the backend once, at startup.
#[must_use]
pub fn open_store(config: &StoreConfig, timeout: Duration) -> Arc<dyn DonationStore> {
    match config {
        StoreConfig::Sqlite { path } => Arc::new(SqliteDonationStore::new(path.clone(), timeout)),
        StoreConfig::Mysql(settings) => Arc::new(MySqlDonationStore::new(settings.clone(), timeout)),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub failed: usize,
}

pub struct DonationApi {
    config: DonationConfig,
    store: Arc<dyn DonationStore>,
    mirror: Arc<BackupMirror>,
    pipeline: IngestionPipeline,
    query: QueryService,
}

impl DonationApi {
    #[must_use]
    pub fn new(config: DonationConfig) -> Self {
        let store = open_store(&config.store, config.store_timeout());
        Self::with_store(config, store)
    }

    /// Build around an already-constructed store.
    #[must_use]
    pub fn with_store(config: DonationConfig, store: Arc<dyn DonationStore>) -> Self {
        let mirror = Arc::new(BackupMirror::new(&config.backup));
        let pipeline =
            IngestionPipeline::new(Arc::clone(&store), Arc::clone(&mirror), config.notify.clone());
        let query = QueryService::new(Arc::clone(&store));
        Self { config, store, mirror, pipeline, query }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn DonationNotifier>) -> Self {
        self.pipeline = self.pipeline.with_notifier(notifier);
        self
    }

    #[must_use]
    pub fn config(&self) -> &DonationConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> StoreBackend {
        self.store.backend()
    }

    #[must_use]
    pub fn mirror(&self) -> &BackupMirror {
        &self.mirror
    }

    /// # Errors
    /// Returns [`StoreError`] when schema creation fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.store.migrate().await
    }

    pub async fn ingest_body(&self, body: &[u8]) -> IngestResponse {
        self.pipeline.ingest_body(body).await
    }

    /// # Errors
    /// Returns the [`ValidationError`] for a rejected payload.
    pub async fn ingest(&self, raw: &RawDonation) -> Result<IngestReceipt, ValidationError> {
        self.pipeline.ingest(raw).await
    }

    /// # Errors
    /// Returns [`StoreError`] when the store cannot answer.
    pub async fn search(
        &self,
        raw_filter: &str,
        raw_page: Option<&str>,
    ) -> Result<SearchResults, StoreError> {
        self.query.search(raw_filter, raw_page).await
    }

    /// Re-insert every record of the structured backup into the primary store,
    /// oldest first. Entries are validated again; nothing is deduplicated.
    ///
    /// `json_path` overrides the configured structured sink.
    ///
    /// # Errors
    /// Returns [`MirrorError`] when the backup cannot be read or parsed.
    pub async fn replay_backup(&self, json_path: Option<&Path>) -> Result<ReplaySummary, MirrorError> {
        let source = match json_path {
            Some(path) => Arc::new(BackupMirror::new(&BackupConfig {
                json_path: path.to_path_buf(),
                ..self.config.backup.clone()
            })),
            None => Arc::clone(&self.mirror),
        };
        let records = tokio::task::spawn_blocking(move || source.read_structured())
            .await
            .map_err(|err| MirrorError::Io(std::io::Error::other(err.to_string())))??;

        let mut summary = ReplaySummary::default();
        for record in records {
            let raw = match serde_json::to_value(&record) {
                Ok(serde_json::Value::Object(raw)) => raw,
                _ => {
                    summary.failed += 1;
                    continue;
                }
            };
            let normalized = match validate(&raw) {
                Ok(normalized) => normalized,
                Err(err) => {
                    tracing::warn!(reason = %err, "backup entry failed validation during replay");
                    summary.failed += 1;
                    continue;
                }
            };
            match self.store.insert(&normalized).await {
                Ok(_) => summary.replayed += 1,
                Err(err) => {
                    tracing::warn!(error = %err, "replay insert failed");
                    summary.failed += 1;
                }
            }
        }
        tracing::info!(replayed = summary.replayed, failed = summary.failed, "backup replay finished");
        Ok(summary)
    }

    #[must_use]
    pub fn json_backup_path(&self) -> PathBuf {
        self.mirror.json_path().to_path_buf()
    }
}
