use super::backup::ImportSummary;
use super::live::LiveQuery;
use super::schema::FeedStore;
use super::types::{Source, StoreError, StoreResult, Table};
use crate::util::validate_source_url;

const SOURCES: &[Table] = &[Table::Sources];
const ARTICLES_AND_SOURCES: &[Table] = &[Table::Articles, Table::Sources];
const SOURCES_AND_FOLDERS: &[Table] = &[Table::Sources, Table::Folders];

impl FeedStore {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Insert a source, replacing any existing row with the same url.
    ///
    /// The replacement is whole-row: title, icon and folder all come from
    /// `source`. A `folder_name` that names no existing folder is rejected
    /// with `ConstraintViolation` rather than being cleared.
    pub async fn upsert_source(&self, source: &Source) -> StoreResult<()> {
        validate_source_url(&source.url)
            .map_err(|e| StoreError::ConstraintViolation(format!("{}: {e}", source.url)))?;

        let (gate, mut tx) = self.begin_write().await?;

        if let Some(folder) = &source.folder_name {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM folders WHERE name = ?")
                .bind(folder)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::ConstraintViolation(format!(
                    "source {} references unknown folder {:?}",
                    source.url, folder
                )));
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO sources (url, title, icon_url, folder_name) VALUES (?, ?, ?, ?)",
        )
        .bind(&source.url)
        .bind(&source.title)
        .bind(&source.icon_url)
        .bind(&source.folder_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        drop(gate);

        tracing::debug!(url = %source.url, folder = ?source.folder_name, "Upserted source");
        self.notify(SOURCES);
        Ok(())
    }

    /// Remove a source together with all of its articles, returning the
    /// number of articles removed. Unknown urls are a no-op.
    pub async fn delete_source(&self, url: &str) -> StoreResult<u64> {
        let (gate, mut tx) = self.begin_write().await?;

        let articles = sqlx::query("DELETE FROM articles WHERE source_url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let sources = sqlx::query("DELETE FROM sources WHERE url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        drop(gate);

        match (articles > 0, sources > 0) {
            (true, true) => self.notify(ARTICLES_AND_SOURCES),
            (true, false) => self.notify(&[Table::Articles]),
            (false, true) => self.notify(SOURCES),
            (false, false) => tracing::debug!(url = %url, "Delete of unknown source ignored"),
        }
        tracing::info!(url = %url, articles = articles, "Deleted source");
        Ok(articles)
    }

    pub async fn get_source(&self, url: &str) -> StoreResult<Option<Source>> {
        let row = sqlx::query_as::<_, Source>(
            "SELECT url, title, icon_url, folder_name FROM sources WHERE url = ? LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// One-shot snapshot of every source, ordered by title then url.
    pub async fn all_sources(&self) -> StoreResult<Vec<Source>> {
        let rows = sqlx::query_as::<_, Source>(
            "SELECT url, title, icon_url, folder_name FROM sources ORDER BY title, url",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Live view of every source, ordered as [`all_sources`](Self::all_sources).
    pub fn watch_all_sources(&self) -> LiveQuery<Source> {
        self.live_query(SOURCES, |store| async move { store.all_sources().await })
    }

    /// File a source under `folder_name`, creating the folder if needed, or
    /// unfile it with `None`. Returns whether the source exists.
    pub async fn move_source_to_folder(
        &self,
        url: &str,
        folder_name: Option<&str>,
    ) -> StoreResult<bool> {
        let folder = folder_name.map(Self::sanitize_folder_name).transpose()?;

        let (gate, mut tx) = self.begin_write().await?;

        let mut folder_created = false;
        if let Some(name) = &folder {
            folder_created = sqlx::query("INSERT OR IGNORE INTO folders (name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;
        }

        let moved = sqlx::query("UPDATE sources SET folder_name = ? WHERE url = ?")
            .bind(&folder)
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if !moved {
            // Leave no folder behind for a source that does not exist
            tracing::debug!(url = %url, "Move of unknown source ignored");
            return Ok(false);
        }

        tx.commit().await?;
        drop(gate);

        if folder_created {
            self.notify(&[Table::Sources, Table::Folders]);
        } else {
            self.notify(SOURCES);
        }
        Ok(true)
    }

    /// Change a source's display title. Returns whether the source exists.
    pub async fn rename_source(&self, url: &str, title: &str) -> StoreResult<bool> {
        self.update_source("UPDATE sources SET title = ? WHERE url = ?", Some(title), url)
            .await
    }

    /// Replace (or clear) a source's icon url. Returns whether the source exists.
    pub async fn update_source_icon(&self, url: &str, icon_url: Option<&str>) -> StoreResult<bool> {
        self.update_source("UPDATE sources SET icon_url = ? WHERE url = ?", icon_url, url)
            .await
    }

    /// Merge a subscription list into the store in one transaction.
    ///
    /// Every folder in `folders`, and every folder a source names, is created
    /// if missing. Unknown sources are inserted as given. A source that is
    /// already stored keeps its title and icon; it only moves when the
    /// incoming entry names a different folder.
    pub async fn import_sources(
        &self,
        folders: &[String],
        sources: &[Source],
    ) -> StoreResult<ImportSummary> {
        let folders = folders
            .iter()
            .map(|name| Self::sanitize_folder_name(name))
            .collect::<StoreResult<Vec<_>>>()?;
        let mut incoming = Vec::with_capacity(sources.len());
        for source in sources {
            validate_source_url(&source.url)
                .map_err(|e| StoreError::ConstraintViolation(format!("{}: {e}", source.url)))?;
            let folder = source
                .folder_name
                .as_deref()
                .map(Self::sanitize_folder_name)
                .transpose()?;
            incoming.push((source, folder));
        }

        let mut summary = ImportSummary::default();
        let (gate, mut tx) = self.begin_write().await?;

        let named = incoming.iter().filter_map(|(_, folder)| folder.as_ref());
        for name in folders.iter().chain(named) {
            summary.folders += sqlx::query("INSERT OR IGNORE INTO folders (name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        for (source, folder) in &incoming {
            let existing: Option<(Option<String>,)> =
                sqlx::query_as("SELECT folder_name FROM sources WHERE url = ?")
                    .bind(&source.url)
                    .fetch_optional(&mut *tx)
                    .await?;
            summary.sources += match existing {
                None => sqlx::query(
                    "INSERT INTO sources (url, title, icon_url, folder_name) VALUES (?, ?, ?, ?)",
                )
                .bind(&source.url)
                .bind(&source.title)
                .bind(&source.icon_url)
                .bind(folder)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                Some((current,)) if folder.is_some() && current != *folder => {
                    sqlx::query("UPDATE sources SET folder_name = ? WHERE url = ?")
                        .bind(folder)
                        .bind(&source.url)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected()
                }
                Some(_) => 0,
            };
        }

        tx.commit().await?;
        drop(gate);

        tracing::info!(
            folders = summary.folders,
            sources = summary.sources,
            offered = sources.len(),
            "Imported subscriptions"
        );
        match (summary.folders > 0, summary.sources > 0) {
            (true, _) => self.notify(SOURCES_AND_FOLDERS),
            (false, true) => self.notify(SOURCES),
            (false, false) => {}
        }
        Ok(summary)
    }

    async fn update_source(&self, sql: &str, value: Option<&str>, url: &str) -> StoreResult<bool> {
        let (gate, mut tx) = self.begin_write().await?;
        let changed = sqlx::query(sql)
            .bind(value)
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;
        drop(gate);

        if changed {
            self.notify(SOURCES);
        }
        Ok(changed)
    }
}
