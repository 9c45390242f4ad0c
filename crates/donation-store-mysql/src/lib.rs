use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use donation_core::{
    page_offset, search_where_clause, DonationRecord, DonationStore, SearchFilter, StoreBackend,
    StoreError, StoredDonation,
};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Connection, MySql, Row};

const LATEST_SCHEMA_VERSION: i64 = 1;

const MAX_IDENTIFIER_LEN: usize = 64;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
  version INT PRIMARY KEY,
  applied_at VARCHAR(64) NOT NULL
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const MIGRATION_001_SQL: &str = "CREATE TABLE IF NOT EXISTS donations (
  id INT AUTO_INCREMENT PRIMARY KEY,
  timestamp VARCHAR(64) NOT NULL,
  name VARCHAR(255),
  email VARCHAR(255),
  usd_amount DECIMAL(12,2),
  crypto_amount VARCHAR(255),
  network VARCHAR(64),
  address VARCHAR(255)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const SELECT_COLUMNS_SQL: &str = "SELECT id, timestamp, COALESCE(name, ''), COALESCE(email, ''),
        CAST(COALESCE(usd_amount, 0) AS CHAR), COALESCE(crypto_amount, ''),
        COALESCE(network, ''), COALESCE(address, '')
 FROM donations";

/// Connection target for the networked relational backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub charset: String,
}

impl Default for MySqlSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            database: "donations_db".to_string(),
            user: "root".to_string(),
            password: String::new(),
            charset: "utf8mb4".to_string(),
        }
    }
}

impl MySqlSettings {
    /// Options for the configured database.
    #[must_use]
    pub fn connect_options(&self) -> MySqlConnectOptions {
        self.server_options().database(&self.database)
    }

    /// Options for the server alone, used to create the database itself.
    #[must_use]
    pub fn server_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .charset(&self.charset)
    }
}

/// [`DonationStore`] over a `MySQL` server. Each call opens one connection and
/// closes it before returning; connecting and querying together are bounded by
/// `timeout`.
#[derive(Debug, Clone)]
pub struct MySqlDonationStore {
    settings: MySqlSettings,
    timeout: Duration,
}

impl MySqlDonationStore {
    #[must_use]
    pub fn new(settings: MySqlSettings, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    #[must_use]
    pub fn settings(&self) -> &MySqlSettings {
        &self.settings
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call).await.unwrap_or_else(|_| {
            Err(StoreError::Unavailable(format!(
                "mysql {operation} against {}:{} timed out after {} ms",
                self.settings.host,
                self.settings.port,
                self.timeout.as_millis()
            )))
        })
    }
}

#[async_trait]
impl DonationStore for MySqlDonationStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Mysql
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let database = quote_identifier(&self.settings.database)?;
        let charset = checked_identifier(&self.settings.charset)?;
        self.bounded("migrate", async {
            let mut conn = self.settings.server_options().connect().await.map_err(map_sqlx_error)?;
            let created = sqlx::query(&format!(
                "CREATE DATABASE IF NOT EXISTS {database} CHARACTER SET {charset}"
            ))
            .execute(&mut conn)
            .await
            .map_err(map_sqlx_error);
            close_quietly(conn).await;
            created?;

            let mut conn = self.settings.connect_options().connect().await.map_err(map_sqlx_error)?;
            let result = migrate_on(&mut conn).await;
            close_quietly(conn).await;
            result
        })
        .await
    }

    async fn insert(&self, record: &DonationRecord) -> Result<i64, StoreError> {
        self.bounded("insert", async {
            let mut conn = self.settings.connect_options().connect().await.map_err(map_sqlx_error)?;
            let result = sqlx::query(
                "INSERT INTO donations (
                    timestamp, name, email, usd_amount, crypto_amount, network, address
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.timestamp)
            .bind(&record.name)
            .bind(&record.email)
            .bind(&record.usd_amount)
            .bind(&record.crypto_amount)
            .bind(&record.network)
            .bind(&record.address)
            .execute(&mut conn)
            .await
            .map_err(map_sqlx_error);
            close_quietly(conn).await;

            let done = result?;
            i64::try_from(done.last_insert_id())
                .map_err(|_| StoreError::Constraint("insert id out of range".to_string()))
        })
        .await
    }

    async fn count(&self, filter: &SearchFilter) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM donations {}", where_clause(filter));
        self.bounded("count", async {
            let mut conn = self.settings.connect_options().connect().await.map_err(map_sqlx_error)?;
            let result = bind_filter(sqlx::query(&sql), filter)
                .fetch_one(&mut conn)
                .await
                .and_then(|row| row.try_get::<i64, _>(0))
                .map_err(map_sqlx_error);
            close_quietly(conn).await;

            Ok(u64::try_from(result?).unwrap_or(0))
        })
        .await
    }

    async fn search_page(
        &self,
        filter: &SearchFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<StoredDonation>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS_SQL} {} ORDER BY id DESC LIMIT ? OFFSET ?",
            where_clause(filter)
        );
        self.bounded("search", async {
            let mut conn = self.settings.connect_options().connect().await.map_err(map_sqlx_error)?;
            let result = bind_filter(sqlx::query(&sql), filter)
                .bind(u64::from(page_size))
                .bind(page_offset(page, page_size))
                .fetch_all(&mut conn)
                .await
                .map_err(map_sqlx_error);
            close_quietly(conn).await;

            result?.iter().map(decode_row).collect()
        })
        .await
    }
}

async fn migrate_on(conn: &mut MySqlConnection) -> Result<(), StoreError> {
    sqlx::query(CREATE_SCHEMA_MIGRATIONS_SQL).execute(&mut *conn).await.map_err(map_sqlx_error)?;

    let recorded = sqlx::query("SELECT CAST(COALESCE(MAX(version), 0) AS SIGNED) FROM schema_migrations")
        .fetch_one(&mut *conn)
        .await
        .and_then(|row| row.try_get::<i64, _>(0))
        .map_err(map_sqlx_error)?;
    if recorded >= LATEST_SCHEMA_VERSION {
        return Ok(());
    }

    // CREATE TABLE IF NOT EXISTS also adopts a table from an untracked setup.
    sqlx::query(MIGRATION_001_SQL).execute(&mut *conn).await.map_err(map_sqlx_error)?;
    sqlx::query("INSERT IGNORE INTO schema_migrations(version, applied_at) VALUES (?, UTC_TIMESTAMP())")
        .bind(LATEST_SCHEMA_VERSION)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    tracing::debug!(version = LATEST_SCHEMA_VERSION, "mysql schema migrated");
    Ok(())
}

async fn close_quietly(conn: MySqlConnection) {
    if let Err(err) = conn.close().await {
        tracing::debug!(error = %err, "mysql connection close failed");
    }
}

/// Identifiers cannot be bound, so only plain unquoted names are accepted.
fn checked_identifier(name: &str) -> Result<&str, StoreError> {
    let plain = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$');
    if plain {
        Ok(name)
    } else {
        Err(StoreError::Unavailable(format!("invalid mysql identifier {name:?}")))
    }
}

fn quote_identifier(name: &str) -> Result<String, StoreError> {
    checked_identifier(name).map(|name| format!("`{name}`"))
}

fn where_clause(filter: &SearchFilter) -> String {
    match filter {
        SearchFilter::All => String::new(),
        SearchFilter::Contains(_) => search_where_clause("LOWER"),
    }
}

fn bind_filter<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    filter: &SearchFilter,
) -> Query<'q, MySql, MySqlArguments> {
    match filter.like_pattern() {
        None => query,
        Some(pattern) => query
            .bind(pattern.clone())
            .bind(pattern.clone())
            .bind(pattern.clone())
            .bind(pattern),
    }
}

fn decode_row(row: &MySqlRow) -> Result<StoredDonation, StoreError> {
    let decode = || -> Result<StoredDonation, sqlx::Error> {
        Ok(StoredDonation {
            id: i64::from(row.try_get::<i32, _>(0)?),
            record: DonationRecord {
                timestamp: row.try_get(1)?,
                name: row.try_get(2)?,
                email: row.try_get(3)?,
                usd_amount: row.try_get(4)?,
                crypto_amount: row.try_get(5)?,
                network: row.try_get(6)?,
                address: row.try_get(7)?,
            },
        })
    };
    decode().map_err(map_sqlx_error)
}

/// SQLSTATE class 22 (data exception) and 23 (integrity violation) are row
/// rejections; everything else means the store could not serve the call.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    let sqlstate = match &err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    };
    classify(sqlstate.as_deref(), err.to_string())
}

fn classify(sqlstate: Option<&str>, message: String) -> StoreError {
    match sqlstate {
        Some(code) if code.starts_with("22") || code.starts_with("23") => {
            StoreError::Constraint(message)
        }
        _ => StoreError::Unavailable(message),
    }
}
