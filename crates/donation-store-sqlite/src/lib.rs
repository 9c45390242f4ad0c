use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use donation_core::{
    page_offset, search_where_clause, DonationRecord, DonationStore, SearchFilter, StoreBackend,
    StoreError, StoredDonation,
};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

// Built-in LOWER() and LIKE fold ASCII only.
const LOWER_FUNCTION: &str = "donation_lower";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// REAL keeps two fraction digits exactly for the validator's ten integer digits.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS donations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  name TEXT,
  email TEXT,
  usd_amount REAL,
  crypto_amount TEXT,
  network TEXT,
  address TEXT
);
";

// REAL amounts are rendered back to two fraction digits so callers see the same
// text regardless of backend.
const SELECT_COLUMNS_SQL: &str = "SELECT id, timestamp, COALESCE(name, ''), COALESCE(email, ''),
        printf('%.2f', COALESCE(usd_amount, 0)), COALESCE(crypto_amount, ''),
        COALESCE(network, ''), COALESCE(address, '')
 FROM donations";

/// One open connection to the embedded single-file store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open the database file and apply runtime pragmas.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the file cannot be opened or configured.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|err| {
            StoreError::Unavailable(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.busy_timeout(busy_timeout).map_err(map_sqlite_error)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;").map_err(map_sqlite_error)?;
        conn.create_scalar_function(
            LOWER_FUNCTION,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            unicode_lower,
        )
        .map_err(map_sqlite_error)?;

        Ok(Self { conn })
    }

    /// Apply forward migrations. A `donations` table created before migrations
    /// were tracked is adopted as version 1.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the DDL or bookkeeping writes fail.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).map_err(map_sqlite_error)?;

        let version = current_schema_version(&self.conn)?;
        if version >= LATEST_SCHEMA_VERSION {
            return Ok(());
        }

        let tx = self.conn.transaction().map_err(map_sqlite_error)?;
        tx.execute_batch(MIGRATION_001_SQL).map_err(map_sqlite_error)?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![LATEST_SCHEMA_VERSION, now_rfc3339()],
        )
        .map_err(map_sqlite_error)?;
        tx.commit().map_err(map_sqlite_error)
    }

    /// Current recorded schema version, 0 for a fresh file.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the bookkeeping table cannot be read.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).map_err(map_sqlite_error)?;
        current_schema_version(&self.conn)
    }

    /// Insert one record, returning its rowid.
    ///
    /// # Errors
    /// Returns [`StoreError`] classified from the `SQLite` failure.
    pub fn insert(&self, record: &DonationRecord) -> Result<i64, StoreError> {
        self.conn
            .execute(
                "INSERT INTO donations (
                    timestamp, name, email, usd_amount, crypto_amount, network, address
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.timestamp,
                    record.name,
                    record.email,
                    record.usd_amount,
                    record.crypto_amount,
                    record.network,
                    record.address,
                ],
            )
            .map_err(map_sqlite_error)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns [`StoreError`] when the count query fails.
    pub fn count(&self, filter: &SearchFilter) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM donations {}", where_clause(filter));
        let total = self
            .conn
            .query_row(&sql, params_from_iter(filter_params(filter)), |row| row.get::<_, i64>(0))
            .map_err(map_sqlite_error)?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    /// # Errors
    /// Returns [`StoreError`] when the page query fails or a row cannot be decoded.
    pub fn search_page(
        &self,
        filter: &SearchFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<StoredDonation>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS_SQL} {} ORDER BY id DESC LIMIT ? OFFSET ?",
            where_clause(filter)
        );
        let offset = i64::try_from(page_offset(page, page_size)).unwrap_or(i64::MAX);

        let mut values = filter_params(filter);
        values.push(Value::Integer(i64::from(page_size)));
        values.push(Value::Integer(offset));

        let mut stmt = self.conn.prepare(&sql).map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(StoredDonation {
                    id: row.get(0)?,
                    record: DonationRecord {
                        timestamp: row.get(1)?,
                        name: row.get(2)?,
                        email: row.get(3)?,
                        usd_amount: row.get(4)?,
                        crypto_amount: row.get(5)?,
                        network: row.get(6)?,
                        address: row.get(7)?,
                    },
                })
            })
            .map_err(map_sqlite_error)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_error)
    }
}

/// [`DonationStore`] over a database file; every call opens its own connection
/// on a blocking worker and drops it before returning.
#[derive(Debug, Clone)]
pub struct SqliteDonationStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteDonationStore {
    #[must_use]
    pub fn new(path: PathBuf, busy_timeout: Duration) -> Self {
        Self { path, busy_timeout }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_store<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut store = SqliteStore::open(&path, busy_timeout)?;
            operation(&mut store)
        })
        .await
        .map_err(|err| StoreError::Unavailable(format!("sqlite worker failed: {err}")))?
    }
}

#[async_trait]
impl DonationStore for SqliteDonationStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.with_store(SqliteStore::migrate).await
    }

    async fn insert(&self, record: &DonationRecord) -> Result<i64, StoreError> {
        let record = record.clone();
        self.with_store(move |store| store.insert(&record)).await
    }

    async fn count(&self, filter: &SearchFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        self.with_store(move |store| store.count(&filter)).await
    }

    async fn search_page(
        &self,
        filter: &SearchFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<StoredDonation>, StoreError> {
        let filter = filter.clone();
        self.with_store(move |store| store.search_page(&filter, page, page_size)).await
    }
}

fn where_clause(filter: &SearchFilter) -> String {
    match filter {
        SearchFilter::All => String::new(),
        SearchFilter::Contains(_) => search_where_clause(LOWER_FUNCTION),
    }
}

#[allow(clippy::unnecessary_wraps)]
fn unicode_lower(ctx: &Context<'_>) -> rusqlite::Result<Option<String>> {
    Ok(match ctx.get_raw(0) {
        ValueRef::Text(text) => Some(String::from_utf8_lossy(text).to_lowercase()),
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    })
}

fn filter_params(filter: &SearchFilter) -> Vec<Value> {
    filter
        .like_pattern()
        .map(|pattern| vec![Value::Text(pattern); 4])
        .unwrap_or_default()
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let recorded = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(map_sqlite_error)?;
    if recorded > 0 {
        return Ok(recorded);
    }

    // A table made by an earlier, untracked setup script.
    if table_exists(conn, "donations")? {
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()],
        )
        .map_err(map_sqlite_error)?;
        return Ok(1);
    }

    Ok(0)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .map_err(map_sqlite_error)?;
    Ok(exists == 1)
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig
            ) =>
        {
            StoreError::Constraint(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use anyhow::{anyhow, Result};
    use ulid::Ulid;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("donations-sqlite-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn mk_record(name: &str, email: &str, network: &str, address: &str) -> DonationRecord {
        DonationRecord {
            timestamp: "2026-10-18T09:00:00+00:00".to_string(),
            name: name.to_string(),
            email: email.to_string(),
            usd_amount: "12.50".to_string(),
            crypto_amount: "0.0002".to_string(),
            network: network.to_string(),
            address: address.to_string(),
        }
    }

    fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"), TIMEOUT)?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"), TIMEOUT)?;
        assert_eq!(store.schema_version()?, 0);
        store.migrate()?;
        store.migrate()?;
        assert_eq!(store.schema_version()?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn untracked_donations_table_is_adopted() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"), TIMEOUT)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        store.conn.execute(
            "INSERT INTO donations (timestamp, usd_amount, address) VALUES ('t', 3, 'legacy')",
            [],
        )?;

        store.migrate()?;
        assert_eq!(store.schema_version()?, 1);
        assert_eq!(store.count(&SearchFilter::All)?, 1);
        Ok(())
    }

    #[test]
    fn inserts_receive_increasing_ids() -> Result<()> {
        let store = memory_store()?;
        let first = store.insert(&mk_record("a", "", "BTC", "addr-1"))?;
        let second = store.insert(&mk_record("b", "", "BTC", "addr-2"))?;
        assert!(second > first);
        Ok(())
    }

    #[test]
    fn amounts_and_null_columns_read_back_backend_neutral() -> Result<()> {
        let store = memory_store()?;
        store.insert(&mk_record("a", "", "BTC", "addr-1"))?;
        store.conn.execute(
            "INSERT INTO donations (timestamp, usd_amount, address) VALUES ('legacy', 7, 'x')",
            [],
        )?;

        let page = store.search_page(&SearchFilter::All, 1, 30)?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].record.usd_amount, "7.00");
        assert_eq!(page[0].record.name, "");
        assert_eq!(page[0].record.network, "");
        assert_eq!(page[1].record.usd_amount, "12.50");
        Ok(())
    }

    #[test]
    fn search_matches_any_of_four_fields_case_insensitively() -> Result<()> {
        let store = memory_store()?;
        store.insert(&mk_record("Alice", "", "ETH", "0xaaa"))?;
        store.insert(&mk_record("bob", "BOB@example.org", "BTC", "bc1q"))?;
        store.insert(&mk_record("carol", "", "eth", "0xccc"))?;
        store.insert(&mk_record("dave", "", "SOL", "sol-ETH-addr"))?;

        let filter = SearchFilter::parse("eth");
        assert_eq!(store.count(&filter)?, 3);
        let names = store
            .search_page(&filter, 1, 30)?
            .into_iter()
            .map(|stored| stored.record.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["dave", "carol", "Alice"]);

        assert_eq!(store.count(&SearchFilter::parse("example.ORG"))?, 1);
        assert_eq!(store.count(&SearchFilter::parse("alice"))?, 1);
        assert_eq!(store.count(&SearchFilter::parse("nobody"))?, 0);
        Ok(())
    }

    #[test]
    fn search_folds_non_ascii_case() -> Result<()> {
        let store = memory_store()?;
        store.insert(&mk_record("Zoë Émile", "ÅSA@example.org", "BTC", "bc1q"))?;
        store.insert(&mk_record("zoe emile", "", "BTC", "bc1r"))?;

        assert_eq!(store.count(&SearchFilter::parse("zoë émile"))?, 1);
        assert_eq!(store.count(&SearchFilter::parse("ÉMILE"))?, 1);
        assert_eq!(store.count(&SearchFilter::parse("åsa@"))?, 1);
        let page = store.search_page(&SearchFilter::parse("ZOË"), 1, 30)?;
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].record.name, "Zoë Émile");
        Ok(())
    }

    #[test]
    fn wildcards_and_quotes_in_token_match_literally() -> Result<()> {
        let store = memory_store()?;
        store.insert(&mk_record("100%", "", "BTC", "a_b"))?;
        store.insert(&mk_record("plain", "", "BTC", "ab"))?;

        assert_eq!(store.count(&SearchFilter::parse("%"))?, 1);
        assert_eq!(store.count(&SearchFilter::parse("_"))?, 1);
        assert_eq!(store.count(&SearchFilter::parse("' OR 1=1 --"))?, 0);
        assert_eq!(store.count(&SearchFilter::All)?, 2);
        Ok(())
    }

    #[test]
    fn pages_are_newest_first_and_past_the_end_is_empty() -> Result<()> {
        let store = memory_store()?;
        for index in 0..65 {
            store.insert(&mk_record(&format!("donor-{index}"), "", "BTC", "addr"))?;
        }

        assert_eq!(store.count(&SearchFilter::All)?, 65);
        let first = store.search_page(&SearchFilter::All, 1, 30)?;
        assert_eq!(first.len(), 30);
        assert_eq!(first[0].record.name, "donor-64");
        let third = store.search_page(&SearchFilter::All, 3, 30)?;
        assert_eq!(third.len(), 5);
        assert_eq!(third[4].record.name, "donor-0");
        assert!(store.search_page(&SearchFilter::All, 4, 30)?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_timestamp_is_a_constraint_error() -> Result<()> {
        let store = memory_store()?;
        let err = store
            .conn
            .execute("INSERT INTO donations (timestamp, address) VALUES (NULL, 'x')", [])
            .map_err(map_sqlite_error);
        assert!(matches!(err, Err(StoreError::Constraint(_))));
        Ok(())
    }

    #[test]
    fn unopenable_path_is_unavailable() {
        let path = std::env::temp_dir()
            .join(format!("missing-dir-{}", Ulid::new()))
            .join("donations.sqlite3");
        let result = SqliteStore::open(&path, TIMEOUT);
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn async_store_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let store = SqliteDonationStore::new(db_path.clone(), TIMEOUT);
        assert_eq!(store.backend(), StoreBackend::Sqlite);

        store.migrate().await?;
        let id = store.insert(&mk_record("eve", "eve@example.org", "LTC", "ltc1")).await?;
        assert_eq!(store.count(&SearchFilter::parse("LTC")).await?, 1);
        let page = store.search_page(&SearchFilter::All, 1, 30).await?;
        assert_eq!(page.first().map(|stored| stored.id), Some(id));

        cleanup(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn insert_before_migrate_fails_without_panicking() {
        let db_path = unique_temp_db_path();
        let store = SqliteDonationStore::new(db_path.clone(), TIMEOUT);
        let result = store.insert(&mk_record("x", "", "", "y")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        cleanup(&db_path);
    }

    #[test]
    fn concurrent_inserts_and_reads_preserve_every_row() -> Result<()> {
        let db_path = unique_temp_db_path();
        SqliteStore::open(&db_path, TIMEOUT)?.migrate()?;

        let writer_threads = 4;
        let writes_per_thread = 20;
        let mut handles = Vec::new();

        for thread_index in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&writer_path, TIMEOUT)?;
                for write_index in 0..writes_per_thread {
                    let name = format!("writer-{thread_index}-{write_index}");
                    store.insert(&mk_record(&name, "", "BTC", "addr"))?;
                }
                Ok(())
            }));
        }

        for _ in 0..2 {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&reader_path, TIMEOUT)?;
                for _ in 0..30 {
                    let _ = store.search_page(&SearchFilter::All, 1, 30)?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path, TIMEOUT)?;
        assert_eq!(store.count(&SearchFilter::All)?, writer_threads * writes_per_thread);

        cleanup(&db_path);
        Ok(())
    }
}
