use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the feed store.
///
/// Storage-engine failures are passed through unmodified; the store never
/// retries an operation on its own.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness or referential constraint rejected the write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Underlying engine I/O or corruption failure
    #[error("Storage fault: {0}")]
    StorageFault(#[source] sqlx::Error),

    /// On-disk schema does not match and no migration path exists
    #[error("Schema mismatch: database has {found}, expected {expected}. Migrate or open with destructive rebuild.")]
    SchemaMismatch { found: String, expected: String },

    /// Another process holds the database
    #[error("The feed database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// A supplied migration failed to apply
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Backup document could not be encoded or decoded
    #[error("Invalid backup document: {0}")]
    Backup(#[from] serde_json::Error),

    #[error("Backup version {found} is newer than supported version {supported}")]
    UnsupportedBackupVersion { found: u32, supported: u32 },
}

impl From<sqlx::Error> for StoreError {
    /// Constraint failures get their own variant, everything else is a
    /// storage fault passed through as-is.
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_foreign_key_violation() {
                return StoreError::ConstraintViolation(format!(
                    "foreign key constraint failed: {}",
                    db_err.message()
                ));
            }
            if db_err.is_unique_violation() {
                return StoreError::ConstraintViolation(format!(
                    "unique constraint failed: {}",
                    db_err.message()
                ));
            }
        }
        StoreError::StorageFault(err)
    }
}

impl StoreError {
    /// Classify an error raised while opening the database.
    ///
    /// Only SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended
    /// codes, mean another process holds the file. Anything else, such as
    /// SQLITE_CANTOPEN for a missing directory, is a storage fault.
    pub(crate) fn from_open(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(5) | Some(6)) {
                return StoreError::InstanceLocked;
            }
        }
        StoreError::from(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Tables
// ============================================================================

/// Tables tracked by the change notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Articles,
    Sources,
    Folders,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Articles, Table::Sources, Table::Folders];

    pub(crate) fn index(self) -> usize {
        match self {
            Table::Articles => 0,
            Table::Sources => 1,
            Table::Folders => 2,
        }
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// An article handed over by the fetch/parse layer for ingestion.
///
/// Read/saved flags are not part of ingestion: new rows start unread and
/// unsaved, existing rows keep whatever the user set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArticle {
    pub link: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Epoch milliseconds
    pub pub_date: i64,
    pub source_url: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct Folder {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

impl Source {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            icon_url: None,
            folder_name: None,
        }
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder_name = Some(folder.into());
        self
    }
}

/// Article row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub link: String,
    pub title: String,
    pub description: Option<String>,
    pub pub_date: i64,
    pub source_url: String,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub is_saved: bool,
}

/// Article joined with the title of its source (detail view).
///
/// `source_title` is `None` when the source row no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArticleWithSource {
    #[sqlx(flatten)]
    pub article: Article,
    pub source_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SourceUnreadCount {
    pub source_url: String,
    pub count: i64,
}
