//! Export and import of the user's curated state.
//!
//! A backup carries folders, sources and saved articles. Unsaved articles are
//! left out; the next sync fetches them again.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::schema::FeedStore;
use super::types::{Article, Folder, Source, StoreError, StoreResult, Table};

/// Newest backup layout this build reads and writes.
pub const BACKUP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub version: u32,
    /// Creation time, epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub saved_articles: Vec<Article>,
}

/// Rows an import actually added or replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub folders: u64,
    pub sources: u64,
    pub articles: u64,
}

impl FeedStore {
    /// Snapshot folders, sources and saved articles into a [`Backup`].
    pub async fn backup(&self) -> StoreResult<Backup> {
        Ok(Backup {
            version: BACKUP_VERSION,
            timestamp: chrono::Utc::now().timestamp_millis(),
            folders: self.all_folders().await?,
            sources: self.all_sources().await?,
            saved_articles: self.saved_articles().await?,
        })
    }

    /// Write a JSON backup to `writer`.
    pub async fn export_backup<W: Write>(&self, writer: W) -> StoreResult<Backup> {
        let backup = self.backup().await?;
        serde_json::to_writer_pretty(writer, &backup)?;
        tracing::info!(
            folders = backup.folders.len(),
            sources = backup.sources.len(),
            saved = backup.saved_articles.len(),
            "Exported backup"
        );
        Ok(backup)
    }

    /// Read a JSON backup from `reader` and restore it.
    ///
    /// The document is parsed completely before the store is touched.
    pub async fn import_backup<R: Read>(&self, reader: R) -> StoreResult<ImportSummary> {
        let backup: Backup = serde_json::from_reader(reader)?;
        self.restore_backup(&backup).await
    }

    /// Restore `backup` in one transaction: folders (insert-or-ignore), then
    /// sources (insert-or-replace), then saved articles (insert-or-ignore,
    /// keeping their read/saved flags).
    ///
    /// A source filed under a folder that is neither stored nor in the backup
    /// fails the whole import with `ConstraintViolation`.
    pub async fn restore_backup(&self, backup: &Backup) -> StoreResult<ImportSummary> {
        if backup.version > BACKUP_VERSION {
            return Err(StoreError::UnsupportedBackupVersion {
                found: backup.version,
                supported: BACKUP_VERSION,
            });
        }

        let mut summary = ImportSummary::default();
        let (gate, mut tx) = self.begin_write().await?;

        for folder in &backup.folders {
            let name = Self::sanitize_folder_name(&folder.name)?;
            summary.folders += sqlx::query("INSERT OR IGNORE INTO folders (name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        for source in &backup.sources {
            crate::util::validate_source_url(&source.url)
                .map_err(|e| StoreError::ConstraintViolation(format!("{}: {e}", source.url)))?;
            summary.sources += sqlx::query(
                "INSERT OR REPLACE INTO sources (url, title, icon_url, folder_name) VALUES (?, ?, ?, ?)",
            )
            .bind(&source.url)
            .bind(&source.title)
            .bind(&source.icon_url)
            .bind(&source.folder_name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for article in &backup.saved_articles {
            if article.link.trim().is_empty() || article.source_url.trim().is_empty() {
                return Err(StoreError::ConstraintViolation(format!(
                    "backup article requires a link and a source url (link: {:?})",
                    article.link
                )));
            }
            summary.articles += sqlx::query(
                r#"
                INSERT OR IGNORE INTO articles
                    (link, title, description, pub_date, source_url, image_url, is_read, is_saved)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&article.link)
            .bind(&article.title)
            .bind(&article.description)
            .bind(article.pub_date)
            .bind(&article.source_url)
            .bind(&article.image_url)
            .bind(article.is_read)
            .bind(article.is_saved)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        drop(gate);

        let touched: Vec<Table> = [
            (Table::Folders, summary.folders),
            (Table::Sources, summary.sources),
            (Table::Articles, summary.articles),
        ]
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(t, _)| t)
        .collect();
        self.notify(&touched);

        tracing::info!(
            folders = summary.folders,
            sources = summary.sources,
            articles = summary.articles,
            "Imported backup"
        );
        Ok(summary)
    }
}
