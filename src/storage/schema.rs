use sha2::{Digest, Sha256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqlitePool, Transaction,
};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::live::{ChangeTracker, LiveQuery};
use super::types::{StoreError, StoreResult, Table};

// ============================================================================
// Schema
// ============================================================================

/// Current schema shape. The identity hash is derived from this text, so any
/// edit here is a new schema version.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS folders (
        name TEXT NOT NULL PRIMARY KEY
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sources (
        url TEXT NOT NULL PRIMARY KEY,
        title TEXT NOT NULL,
        icon_url TEXT,
        folder_name TEXT REFERENCES folders(name) ON UPDATE CASCADE ON DELETE SET NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_sources_folder_name ON sources(folder_name)",
    r#"CREATE TABLE IF NOT EXISTS articles (
        link TEXT NOT NULL PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        pub_date INTEGER NOT NULL,
        source_url TEXT NOT NULL,
        image_url TEXT,
        is_read INTEGER NOT NULL DEFAULT 0,
        is_saved INTEGER NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_articles_pub_date ON articles(pub_date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_articles_source_pub_date ON articles(source_url, pub_date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_articles_saved ON articles(is_saved)",
];

/// Engine bookkeeping; not part of the hashed shape.
const IDENTITY_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_identity (
        id INTEGER PRIMARY KEY,
        identity_hash TEXT NOT NULL
    )
"#;

/// Single-row key for the identity record
const IDENTITY_ROW: i64 = 42;

/// Reported as the found identity when the store tables exist without a record
const UNVERSIONED: &str = "unversioned";

/// Content hash of the current schema shape (hex SHA-256).
pub fn schema_identity() -> String {
    let mut hasher = Sha256::new();
    for statement in SCHEMA {
        // Whitespace-insensitive so reformatting the DDL is not a new version
        let normalized = statement.split_whitespace().collect::<Vec<_>>().join(" ");
        hasher.update(normalized.as_bytes());
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Open Options
// ============================================================================

/// One step from a previous schema identity to a newer one.
#[derive(Debug, Clone)]
pub struct Migration {
    pub from_identity: String,
    pub to_identity: String,
    pub statements: Vec<String>,
}

/// How a store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Pool size for file databases (in-memory stores always use one connection)
    pub max_connections: u32,
    /// Drop and recreate every table when no migration path exists
    pub destructive_rebuild: bool,
    /// Snapshots buffered per live query before the worker waits
    pub snapshot_buffer: usize,
    /// Known migration steps, applied in chain order
    pub migrations: Vec<Migration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            destructive_rebuild: false,
            snapshot_buffer: 4,
            migrations: Vec::new(),
        }
    }
}

// ============================================================================
// Feed Store
// ============================================================================

struct Shared {
    tracker: ChangeTracker,
    /// Serializes write transactions within this store instance
    write_gate: Mutex<()>,
    snapshot_buffer: usize,
}

/// Handle to the feed store. Cheap to clone; clones share the pool, the write
/// gate and the change tracker.
#[derive(Clone)]
pub struct FeedStore {
    pub(crate) pool: SqlitePool,
    shared: Arc<Shared>,
}

impl FeedStore {
    /// Open (or create) a store with default options.
    pub async fn open(path: &str) -> StoreResult<Self> {
        Self::open_with(path, StoreOptions::default()).await
    }

    /// Open (or create) a store at `path`, or in memory for `":memory:"`.
    ///
    /// # Errors
    ///
    /// - `StoreError::InstanceLocked` if another process holds the file
    /// - `StoreError::SchemaMismatch` if the stored schema identity differs,
    ///   no migration chain reaches the current identity, and
    ///   `destructive_rebuild` is off
    /// - `StoreError::Migration` if a supplied migration fails
    pub async fn open_with(path: &str, options: StoreOptions) -> StoreResult<Self> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        #[cfg(unix)]
        if !in_memory {
            restrict_permissions(path);
        }

        let mut connect = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_open)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            connect = connect
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // An in-memory database lives only as long as its connections, so it
        // gets exactly one that is never recycled.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(options.max_connections.max(1))
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(connect)
            .await
            .map_err(StoreError::from_open)?;

        let store = Self {
            pool,
            shared: Arc::new(Shared {
                tracker: ChangeTracker::new(),
                write_gate: Mutex::new(()),
                snapshot_buffer: options.snapshot_buffer,
            }),
        };
        store.migrate(&options).await?;
        tracing::info!(path = %path, "Opened feed store");
        Ok(store)
    }

    /// Bring the on-disk schema to the current identity inside one
    /// transaction. Nothing changes on disk if this fails.
    async fn migrate(&self, options: &StoreOptions) -> StoreResult<()> {
        let expected = schema_identity();
        let _gate = self.shared.write_gate.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::from_open)?;

        sqlx::query(IDENTITY_TABLE)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_open)?;

        let stored: Option<(String,)> =
            sqlx::query_as("SELECT identity_hash FROM schema_identity WHERE id = ?")
                .bind(IDENTITY_ROW)
                .fetch_optional(&mut *tx)
                .await?;

        let found = match stored {
            Some((hash,)) => Some(hash),
            None if has_store_tables(&mut tx).await? => Some(UNVERSIONED.to_string()),
            None => None,
        };

        match found {
            None => {
                tracing::info!(identity = %expected, "Creating fresh schema");
                create_schema(&mut tx).await?;
            }
            Some(found) if found == expected => {
                tracing::debug!(identity = %expected, "Schema identity matches");
                return tx.commit().await.map_err(StoreError::from);
            }
            Some(found) => match migration_chain(&found, &expected, &options.migrations) {
                Some(chain) => {
                    for migration in chain {
                        tracing::info!(
                            from = %migration.from_identity,
                            to = %migration.to_identity,
                            "Applying schema migration"
                        );
                        for statement in &migration.statements {
                            sqlx::query(statement)
                                .execute(&mut *tx)
                                .await
                                .map_err(|e| StoreError::Migration(e.to_string()))?;
                        }
                    }
                }
                None if options.destructive_rebuild => {
                    tracing::warn!(
                        found = %found,
                        expected = %expected,
                        "No migration path, rebuilding schema destructively"
                    );
                    for table in ["articles", "sources", "folders"] {
                        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                            .execute(&mut *tx)
                            .await?;
                    }
                    create_schema(&mut tx).await?;
                }
                None => {
                    return Err(StoreError::SchemaMismatch { found, expected });
                }
            },
        }

        sqlx::query("INSERT OR REPLACE INTO schema_identity (id, identity_hash) VALUES (?, ?)")
            .bind(IDENTITY_ROW)
            .bind(&expected)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Schema identity recorded in the database.
    pub async fn stored_identity(&self) -> StoreResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT identity_hash FROM schema_identity WHERE id = ?")
                .bind(IDENTITY_ROW)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(hash,)| hash))
    }

    // ========================================================================
    // Write & Notify Plumbing
    // ========================================================================

    /// Start a write transaction. The returned guard keeps other writers of
    /// this store out until it is dropped.
    pub(crate) async fn begin_write(
        &self,
    ) -> StoreResult<(tokio::sync::MutexGuard<'_, ()>, Transaction<'static, Sqlite>)> {
        let gate = self.shared.write_gate.lock().await;
        let tx = self.pool.begin().await?;
        Ok((gate, tx))
    }

    /// Announce committed changes to live queries.
    pub(crate) fn notify(&self, tables: &[Table]) {
        self.shared.tracker.notify(tables);
    }

    /// Number of live queries currently registered on this store.
    pub fn live_query_count(&self) -> usize {
        self.shared.tracker.subscriber_count()
    }

    /// Register a live query re-evaluated whenever one of `tables` changes.
    pub(crate) fn live_query<T, F, Fut>(&self, tables: &'static [Table], query: F) -> LiveQuery<T>
    where
        T: Send + 'static,
        F: Fn(FeedStore) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<Vec<T>>> + Send + 'static,
    {
        let store = self.clone();
        LiveQuery::spawn(
            &self.shared.tracker,
            tables,
            self.shared.snapshot_buffer,
            move || query(store.clone()),
        )
    }
}

async fn create_schema(tx: &mut Transaction<'static, Sqlite>) -> StoreResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut **tx).await?;
    }
    Ok(())
}

async fn has_store_tables(tx: &mut Transaction<'static, Sqlite>) -> StoreResult<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('articles', 'sources', 'folders')",
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(count > 0)
}

/// Find the migrations leading from `found` to `expected`, if any.
fn migration_chain<'a>(
    found: &str,
    expected: &str,
    migrations: &'a [Migration],
) -> Option<Vec<&'a Migration>> {
    let mut chain = Vec::new();
    let mut current = found;
    // Each step must make progress; a chain longer than the list has a cycle
    while current != expected {
        if chain.len() >= migrations.len() {
            return None;
        }
        let step = migrations.iter().find(|m| m.from_identity == current)?;
        chain.push(step);
        current = &step.to_identity;
    }
    Some(chain)
}

/// Create the database file user-only before the pool opens it.
#[cfg(unix)]
fn restrict_permissions(path: &str) {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let db_path = std::path::Path::new(path);
    if db_path.exists() {
        if let Err(e) = std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
        }
    } else if db_path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.exists()) {
        // If creation fails, SQLite reports the error at connect time
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(db_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(from: &str, to: &str) -> Migration {
        Migration {
            from_identity: from.to_string(),
            to_identity: to.to_string(),
            statements: Vec::new(),
        }
    }

    #[test]
    fn test_schema_identity_is_stable_hex() {
        let a = schema_identity();
        let b = schema_identity();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_migration_chain_follows_steps() {
        let migrations = vec![step("b", "c"), step("a", "b")];
        let chain = migration_chain("a", "c", &migrations).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].from_identity, "a");
        assert_eq!(chain[1].to_identity, "c");
    }

    #[test]
    fn test_migration_chain_missing_step() {
        let migrations = vec![step("a", "b")];
        assert!(migration_chain("a", "c", &migrations).is_none());
        assert!(migration_chain("x", "c", &migrations).is_none());
    }

    #[test]
    fn test_migration_chain_cycle_rejected() {
        let migrations = vec![step("a", "b"), step("b", "a")];
        assert!(migration_chain("a", "c", &migrations).is_none());
    }

    #[tokio::test]
    async fn test_open_records_identity() {
        let store = FeedStore::open(":memory:").await.unwrap();
        assert_eq!(store.stored_identity().await.unwrap(), Some(schema_identity()));
    }
}
