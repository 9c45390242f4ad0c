use std::sync::Arc;

use donation_core::{validate, DonationRecord, DonationStore, RawDonation, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::NotifyConfig;
use crate::mirror::{BackupMirror, MirrorOutcome};
use crate::notify::{DonationNotifier, LogNotifier, Notification};

pub const SAVED_MESSAGE: &str = "Saved";
pub const NO_INPUT_MESSAGE: &str = "No input received";
pub const INVALID_JSON_MESSAGE: &str = "Invalid JSON";
pub const METHOD_NOT_ALLOWED_MESSAGE: &str = "Method not allowed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Received,
    Validated,
    PrimaryStoreAttempted,
    Mirrored,
    Completed,
}

impl IngestStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::PrimaryStoreAttempted => "primary_store_attempted",
            Self::Mirrored => "mirrored",
            Self::Completed => "completed",
        }
    }
}

/// The caller-facing `{success, message}` acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestResponse {
    pub success: bool,
    pub message: String,
}

impl IngestResponse {
    #[must_use]
    pub fn saved() -> Self {
        Self { success: true, message: SAVED_MESSAGE.to_string() }
    }

    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

/// What happened to one accepted record on its way through the pipeline.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IngestReceipt {
    pub record: DonationRecord,
    /// Store-assigned id; `None` when the primary insert failed.
    pub id: Option<i64>,
    pub mirror: MirrorOutcome,
    pub notified: bool,
    pub stage: IngestStage,
}

/// Validate, persist, mirror, and optionally notify.
///
/// Once a payload validates, every later step is best-effort: store, mirror,
/// and notifier failures are logged and the receipt still reaches
/// [`IngestStage::Completed`].
pub struct IngestionPipeline {
    store: Arc<dyn DonationStore>,
    mirror: Arc<BackupMirror>,
    notifier: Arc<dyn DonationNotifier>,
    notify: NotifyConfig,
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(store: Arc<dyn DonationStore>, mirror: Arc<BackupMirror>, notify: NotifyConfig) -> Self {
        Self { store, mirror, notifier: Arc::new(LogNotifier), notify }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn DonationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Decode a raw request body and ingest it.
    ///
    /// Always answers with one of the fixed acknowledgment messages; nothing
    /// is written unless the body is a JSON object that validates.
    pub async fn ingest_body(&self, body: &[u8]) -> IngestResponse {
        if body.is_empty() {
            return IngestResponse::rejected(NO_INPUT_MESSAGE);
        }
        let raw = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(raw)) => raw,
            Ok(_) | Err(_) => return IngestResponse::rejected(INVALID_JSON_MESSAGE),
        };

        match self.ingest(&raw).await {
            Ok(_) => IngestResponse::saved(),
            Err(err) => IngestResponse::rejected(err.to_string()),
        }
    }

    /// # Errors
    /// Returns the [`ValidationError`] when the payload is rejected; no store,
    /// mirror, or notifier I/O happens in that case.
    pub async fn ingest(&self, raw: &RawDonation) -> Result<IngestReceipt, ValidationError> {
        tracing::debug!(stage = IngestStage::Received.as_str(), "ingest");
        let record = validate(raw).inspect_err(|err| {
            tracing::debug!(reason = %err, "donation rejected");
        })?;
        tracing::debug!(stage = IngestStage::Validated.as_str(), "ingest");

        let id = match self.store.insert(&record).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(
                    backend = self.store.backend().as_str(),
                    error = %err,
                    "primary store insert failed; continuing with backup mirror"
                );
                None
            }
        };
        tracing::debug!(stage = IngestStage::PrimaryStoreAttempted.as_str(), id, "ingest");

        let mirror = self.mirror_record(&record).await;
        tracing::debug!(
            stage = IngestStage::Mirrored.as_str(),
            csv = mirror.csv_written,
            json = mirror.json_written,
            "ingest"
        );

        let notified = self.notify_record(&record).await;
        tracing::debug!(stage = IngestStage::Completed.as_str(), id, "ingest");

        Ok(IngestReceipt { record, id, mirror, notified, stage: IngestStage::Completed })
    }

    async fn mirror_record(&self, record: &DonationRecord) -> MirrorOutcome {
        let mirror = Arc::clone(&self.mirror);
        let record = record.clone();
        match tokio::task::spawn_blocking(move || mirror.append(&record)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "backup mirror worker failed");
                MirrorOutcome::default()
            }
        }
    }

    async fn notify_record(&self, record: &DonationRecord) -> bool {
        if !self.notify.is_active() {
            return false;
        }
        let notification = Notification::for_donation(record, &self.notify);
        match self.notifier.notify(notification).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "donation notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use donation_core::{page_offset, SearchFilter, StoreBackend, StoreError, StoredDonation};
    use ulid::Ulid;

    use super::*;
    use crate::config::BackupConfig;
    use crate::notify::NotifyError;
    use crate::query::QueryService;

    /// In-memory store that can be switched into an outage.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<DonationRecord>>,
        unavailable: bool,
    }

    impl MemoryStore {
        fn rows(&self) -> Vec<DonationRecord> {
            self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
        }

        /// Matching rows with 1-based ids, oldest first.
        fn matching(&self, filter: &SearchFilter) -> Vec<StoredDonation> {
            self.rows()
                .into_iter()
                .zip(1_i64..)
                .filter(|(record, _)| {
                    filter.matches([&record.name, &record.email, &record.address, &record.network])
                })
                .map(|(record, id)| StoredDonation { id, record })
                .collect()
        }
    }

    #[async_trait]
    impl DonationStore for MemoryStore {
        fn backend(&self) -> StoreBackend {
            StoreBackend::Sqlite
        }

        async fn migrate(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn insert(&self, record: &DonationRecord) -> Result<i64, StoreError> {
            if self.unavailable {
                return Err(StoreError::Unavailable("simulated outage".to_string()));
            }
            let mut rows = self
                .rows
                .lock()
                .map_err(|_| StoreError::Unavailable("poisoned".to_string()))?;
            rows.push(record.clone());
            Ok(i64::try_from(rows.len()).unwrap_or(i64::MAX))
        }

        async fn count(&self, filter: &SearchFilter) -> Result<u64, StoreError> {
            Ok(self.matching(filter).len() as u64)
        }

        async fn search_page(
            &self,
            filter: &SearchFilter,
            page: u32,
            page_size: u32,
        ) -> Result<Vec<StoredDonation>, StoreError> {
            let skip = usize::try_from(page_offset(page, page_size)).unwrap_or(usize::MAX);
            let take = usize::try_from(page_size).unwrap_or(usize::MAX);
            Ok(self.matching(filter).into_iter().rev().skip(skip).take(take).collect())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl DonationNotifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Delivery("smtp refused".to_string()));
            }
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(notification);
            }
            Ok(())
        }
    }

    struct Harness {
        dir: PathBuf,
        store: Arc<MemoryStore>,
        mirror: Arc<BackupMirror>,
    }

    impl Harness {
        fn new(unavailable: bool) -> Self {
            let dir = std::env::temp_dir().join(format!("donation-pipeline-{}", Ulid::new()));
            let mirror = Arc::new(BackupMirror::new(&BackupConfig {
                csv_path: dir.join("donations.csv"),
                json_path: dir.join("donations.json"),
                retention: 500,
            }));
            let store = Arc::new(MemoryStore { unavailable, ..MemoryStore::default() });
            Self { dir, store, mirror }
        }

        fn pipeline(&self, notify: NotifyConfig) -> IngestionPipeline {
            IngestionPipeline::new(self.store.clone(), Arc::clone(&self.mirror), notify)
        }

        fn mirrored(&self) -> Vec<DonationRecord> {
            self.mirror
                .read_structured()
                .unwrap_or_else(|err| panic!("read structured sink: {err}"))
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn accepted_payload_is_stored_and_mirrored() {
        let harness = Harness::new(false);
        let pipeline = harness.pipeline(NotifyConfig::default());

        let response = pipeline.ingest_body(br#"{"usd_amount":"12.5","address":"abc123"}"#).await;
        assert_eq!(response, IngestResponse::saved());

        let rows = harness.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].usd_amount, "12.50");
        assert_eq!(rows[0].name, "(anonymous)");
        assert_eq!(harness.mirrored(), rows);
        assert!(harness.mirror.csv_path().exists());
    }

    #[tokio::test]
    async fn ingested_records_are_searchable_by_token() -> anyhow::Result<()> {
        let harness = Harness::new(false);
        let pipeline = harness.pipeline(NotifyConfig::default());
        for body in [
            r#"{"usd_amount":"1","address":"bc1q-one","network":"BTC","name":"Zoë"}"#,
            r#"{"usd_amount":"2","address":"0xtwo","network":"ETH"}"#,
            r#"{"usd_amount":"3","address":"bc1q-three","network":"btc"}"#,
        ] {
            assert!(pipeline.ingest_body(body.as_bytes()).await.success);
        }

        let store: Arc<dyn DonationStore> = harness.store.clone();
        let query = QueryService::new(store);
        let results = query.search("BTC", None).await?;
        assert_eq!(results.total_count, 2);
        let addresses = results.records.iter().map(|stored| stored.record.address.as_str()).collect::<Vec<_>>();
        assert_eq!(addresses, vec!["bc1q-three", "bc1q-one"]);
        assert_eq!(query.search("ZOË", None).await?.total_count, 1);
        assert_eq!(query.search("", None).await?.total_count, 3);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_payload_touches_nothing() {
        let harness = Harness::new(false);
        let pipeline = harness.pipeline(NotifyConfig::default());

        let response = pipeline.ingest_body(br#"{"usd_amount":"abc","address":"abc123"}"#).await;
        assert_eq!(response, IngestResponse::rejected("Invalid USD amount"));
        assert!(harness.store.rows().is_empty());
        assert!(!harness.mirror.csv_path().exists());
        assert!(!harness.mirror.json_path().exists());
    }

    #[tokio::test]
    async fn empty_and_malformed_bodies_get_fixed_messages() {
        let harness = Harness::new(false);
        let pipeline = harness.pipeline(NotifyConfig::default());

        assert_eq!(pipeline.ingest_body(b"").await, IngestResponse::rejected("No input received"));
        for body in [&b"{not json"[..], b"[1,2]", b"\"text\"", b"42", b"   "] {
            assert_eq!(pipeline.ingest_body(body).await, IngestResponse::rejected("Invalid JSON"));
        }
        assert!(harness.store.rows().is_empty());
    }

    #[tokio::test]
    async fn store_outage_still_mirrors_and_reports_success() {
        let harness = Harness::new(true);
        let pipeline = harness.pipeline(NotifyConfig::default());

        let mut raw = RawDonation::new();
        raw.insert("usd_amount".to_string(), Value::from("7"));
        raw.insert("address".to_string(), Value::from("bc1q"));
        let receipt = pipeline
            .ingest(&raw)
            .await
            .unwrap_or_else(|err| panic!("ingest should validate: {err}"));

        assert_eq!(receipt.id, None);
        assert_eq!(receipt.stage, IngestStage::Completed);
        assert_eq!(receipt.mirror, MirrorOutcome { csv_written: true, json_written: true });
        assert_eq!(harness.mirrored(), vec![receipt.record]);

        let response = pipeline.ingest_body(br#"{"usd_amount":"1","address":"x"}"#).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn notifier_runs_only_when_enabled_and_addressed() {
        let harness = Harness::new(false);
        let notifier = Arc::new(RecordingNotifier::default());

        let disabled = harness.pipeline(NotifyConfig::default()).with_notifier(notifier.clone());
        disabled.ingest_body(br#"{"usd_amount":"1","address":"a"}"#).await;

        let enabled = harness
            .pipeline(NotifyConfig {
                enabled: true,
                to: "ops@example.org".to_string(),
                ..NotifyConfig::default()
            })
            .with_notifier(notifier.clone());
        enabled.ingest_body(br#"{"usd_amount":"2","address":"b","name":"Ann"}"#).await;

        let sent = notifier.sent.lock().map(|sent| sent.clone()).unwrap_or_default();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@example.org");
        assert!(sent[0].body.contains("Name: Ann"));
        assert!(sent[0].body.contains("USD: $2.00"));
    }

    #[tokio::test]
    async fn notifier_failure_does_not_change_outcome() {
        let harness = Harness::new(false);
        let notifier = Arc::new(RecordingNotifier { fail: true, ..RecordingNotifier::default() });
        let pipeline = harness
            .pipeline(NotifyConfig { enabled: true, to: "ops@example.org".to_string(), ..NotifyConfig::default() })
            .with_notifier(notifier);

        let mut raw = RawDonation::new();
        raw.insert("usd_amount".to_string(), Value::from(3));
        raw.insert("address".to_string(), Value::from("a"));
        let receipt = pipeline
            .ingest(&raw)
            .await
            .unwrap_or_else(|err| panic!("ingest should validate: {err}"));
        assert!(!receipt.notified);
        assert_eq!(receipt.id, Some(1));
        assert_eq!(receipt.stage, IngestStage::Completed);
    }
}
