use sqlx::QueryBuilder;

use super::live::LiveQuery;
use super::schema::FeedStore;
use super::types::{
    Article, ArticleWithSource, NewArticle, SourceUnreadCount, StoreError, StoreResult, Table,
};

/// Rows per multi-row INSERT: 6 columns * 50 = 300 bound parameters, well
/// under SQLite's 999 limit.
const INGEST_BATCH_SIZE: usize = 50;

/// Default ceiling for stored descriptions, in characters
pub const DEFAULT_MAX_DESCRIPTION_CHARS: i64 = 100_000;

const ARTICLE_COLUMNS: &str =
    "link, title, description, pub_date, source_url, image_url, is_read, is_saved";

/// Newest first; equal timestamps keep insertion order
const ARTICLE_ORDER: &str = "ORDER BY pub_date DESC, rowid ASC";

const ARTICLES: &[Table] = &[Table::Articles];
const ARTICLES_AND_SOURCES: &[Table] = &[Table::Articles, Table::Sources];

impl FeedStore {
    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Ingest a batch of articles, returning how many were new.
    ///
    /// Insert-or-ignore keyed by `link`: an article whose link is already
    /// stored (or appears earlier in the same batch) is skipped without
    /// touching the stored row, so user read/saved flags survive re-syncs.
    /// The batch commits as one transaction; on error nothing is applied.
    pub async fn ingest_articles(&self, articles: &[NewArticle]) -> StoreResult<usize> {
        if articles.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = articles
            .iter()
            .find(|a| a.link.trim().is_empty() || a.source_url.trim().is_empty())
        {
            return Err(StoreError::ConstraintViolation(format!(
                "article requires a link and a source url (link: {:?}, source: {:?})",
                bad.link, bad.source_url
            )));
        }

        let (gate, mut tx) = self.begin_write().await?;
        let mut inserted: u64 = 0;

        for chunk in articles.chunks(INGEST_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles \
                 (link, title, description, pub_date, source_url, image_url) ",
            );
            builder.push_values(chunk, |mut b, article| {
                b.push_bind(&article.link)
                    .push_bind(&article.title)
                    .push_bind(&article.description)
                    .push_bind(article.pub_date)
                    .push_bind(&article.source_url)
                    .push_bind(&article.image_url);
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        drop(gate);

        tracing::debug!(
            offered = articles.len(),
            inserted = inserted,
            "Ingested article batch"
        );
        if inserted > 0 {
            self.notify(ARTICLES);
        }
        Ok(inserted as usize)
    }

    // ========================================================================
    // One-shot Queries
    // ========================================================================

    /// Every article, newest first.
    pub async fn all_articles(&self) -> StoreResult<Vec<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles {ARTICLE_ORDER}");
        let rows = sqlx::query_as::<_, Article>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn articles_by_source(&self, source_url: &str) -> StoreResult<Vec<Article>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE source_url = ? {ARTICLE_ORDER}"
        );
        let rows = sqlx::query_as::<_, Article>(&sql)
            .bind(source_url)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Articles of every source filed under `folder_name`.
    pub async fn articles_by_folder(&self, folder_name: &str) -> StoreResult<Vec<Article>> {
        let rows = sqlx::query_as::<_, Article>(
            r#"
            SELECT a.link, a.title, a.description, a.pub_date, a.source_url,
                   a.image_url, a.is_read, a.is_saved
            FROM articles a
            INNER JOIN sources s ON a.source_url = s.url
            WHERE s.folder_name = ?
            ORDER BY a.pub_date DESC, a.rowid ASC
        "#,
        )
        .bind(folder_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn saved_articles(&self) -> StoreResult<Vec<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE is_saved = 1 {ARTICLE_ORDER}");
        let rows = sqlx::query_as::<_, Article>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_article(&self, link: &str) -> StoreResult<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE link = ?");
        let row = sqlx::query_as::<_, Article>(&sql)
            .bind(link)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// A single article with the title of its source, for the detail view.
    pub async fn article_with_source(&self, link: &str) -> StoreResult<Option<ArticleWithSource>> {
        let row = sqlx::query_as::<_, ArticleWithSource>(
            r#"
            SELECT a.link, a.title, a.description, a.pub_date, a.source_url,
                   a.image_url, a.is_read, a.is_saved, s.title AS source_title
            FROM articles a
            LEFT JOIN sources s ON a.source_url = s.url
            WHERE a.link = ?
            LIMIT 1
        "#,
        )
        .bind(link)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Links of every article marked read.
    pub async fn read_article_links(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT link FROM articles WHERE is_read = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(link,)| link).collect())
    }

    /// Unread article count per source. Sources without unread articles are
    /// absent.
    pub async fn unread_counts(&self) -> StoreResult<Vec<SourceUnreadCount>> {
        let rows = sqlx::query_as::<_, SourceUnreadCount>(
            r#"
            SELECT source_url, COUNT(*) AS count
            FROM articles
            WHERE is_read = 0
            GROUP BY source_url
            ORDER BY source_url
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn saved_count(&self) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE is_saved = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Live Queries
    // ========================================================================

    /// Live view of every article, newest first.
    pub fn watch_all_articles(&self) -> LiveQuery<Article> {
        self.live_query(ARTICLES, |store| async move { store.all_articles().await })
    }

    pub fn watch_articles_by_source(&self, source_url: &str) -> LiveQuery<Article> {
        let source_url = source_url.to_owned();
        self.live_query(ARTICLES, move |store| {
            let source_url = source_url.clone();
            async move { store.articles_by_source(&source_url).await }
        })
    }

    /// Live view of a folder's articles. Also re-evaluates when sources move
    /// between folders.
    pub fn watch_articles_by_folder(&self, folder_name: &str) -> LiveQuery<Article> {
        let folder_name = folder_name.to_owned();
        self.live_query(ARTICLES_AND_SOURCES, move |store| {
            let folder_name = folder_name.clone();
            async move { store.articles_by_folder(&folder_name).await }
        })
    }

    pub fn watch_saved_articles(&self) -> LiveQuery<Article> {
        self.live_query(ARTICLES, |store| async move { store.saved_articles().await })
    }

    /// Live detail view; each snapshot holds zero or one row.
    pub fn watch_article(&self, link: &str) -> LiveQuery<ArticleWithSource> {
        let link = link.to_owned();
        self.live_query(ARTICLES_AND_SOURCES, move |store| {
            let link = link.clone();
            async move {
                let detail = store.article_with_source(&link).await?;
                Ok::<_, StoreError>(detail.into_iter().collect())
            }
        })
    }

    pub fn watch_unread_counts(&self) -> LiveQuery<SourceUnreadCount> {
        self.live_query(ARTICLES, |store| async move { store.unread_counts().await })
    }

    /// Live saved-article count; each snapshot holds exactly one value.
    pub fn watch_saved_count(&self) -> LiveQuery<i64> {
        self.live_query(ARTICLES, |store| async move {
            Ok::<_, StoreError>(vec![store.saved_count().await?])
        })
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set the read flag, returning whether a row changed.
    ///
    /// An unknown link is a no-op, not an error.
    pub async fn mark_read(&self, link: &str, read: bool) -> StoreResult<bool> {
        self.update_articles(
            "UPDATE articles SET is_read = ? WHERE link = ? AND is_read != ?",
            |q| q.bind(read).bind(link).bind(read),
        )
        .await
        .map(|n| n > 0)
    }

    /// Set the saved flag, returning whether a row changed.
    pub async fn mark_saved(&self, link: &str, saved: bool) -> StoreResult<bool> {
        self.update_articles(
            "UPDATE articles SET is_saved = ? WHERE link = ? AND is_saved != ?",
            |q| q.bind(saved).bind(link).bind(saved),
        )
        .await
        .map(|n| n > 0)
    }

    /// Mark every unread article of one source as read.
    pub async fn mark_source_read(&self, source_url: &str) -> StoreResult<u64> {
        self.update_articles(
            "UPDATE articles SET is_read = 1 WHERE source_url = ? AND is_read = 0",
            |q| q.bind(source_url),
        )
        .await
    }

    /// Mark every unread article of the sources in a folder as read.
    pub async fn mark_folder_read(&self, folder_name: &str) -> StoreResult<u64> {
        self.update_articles(
            r#"UPDATE articles SET is_read = 1
               WHERE source_url IN (SELECT url FROM sources WHERE folder_name = ?)
               AND is_read = 0"#,
            |q| q.bind(folder_name),
        )
        .await
    }

    pub async fn mark_all_read(&self) -> StoreResult<u64> {
        self.update_articles("UPDATE articles SET is_read = 1 WHERE is_read = 0", |q| q)
            .await
    }

    /// Delete every article. Sources and folders are untouched.
    pub async fn clear_all_articles(&self) -> StoreResult<u64> {
        let removed = self.update_articles("DELETE FROM articles", |q| q).await?;
        tracing::info!(removed = removed, "Cleared all articles");
        Ok(removed)
    }

    /// Clip descriptions longer than `max_chars` characters.
    pub async fn truncate_oversized_descriptions(&self, max_chars: i64) -> StoreResult<u64> {
        let max_chars = max_chars.max(1);
        let clipped = self
            .update_articles(
                "UPDATE articles SET description = SUBSTR(description, 1, ?) WHERE LENGTH(description) > ?",
                |q| q.bind(max_chars).bind(max_chars),
            )
            .await?;
        if clipped > 0 {
            tracing::info!(clipped = clipped, max_chars = max_chars, "Truncated oversized descriptions");
        }
        Ok(clipped)
    }

    /// Run one statement against `articles` as its own write transaction and
    /// notify subscribers when rows changed.
    async fn update_articles<'q, F>(&self, sql: &'q str, bind: F) -> StoreResult<u64>
    where
        F: FnOnce(
            sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    {
        let (gate, mut tx) = self.begin_write().await?;
        let affected = bind(sqlx::query(sql)).execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        drop(gate);

        if affected > 0 {
            self.notify(ARTICLES);
        } else {
            tracing::debug!(sql = sql, "Article update matched no rows");
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{FeedStore, NewArticle, Source};
    use pretty_assertions::assert_eq;

    async fn test_store() -> FeedStore {
        FeedStore::open(":memory:").await.unwrap()
    }

    fn test_article(link: &str, pub_date: i64, source: &str) -> NewArticle {
        NewArticle {
            link: link.to_string(),
            title: format!("Title {link}"),
            description: Some("Test description".to_string()),
            pub_date,
            source_url: source.to_string(),
            image_url: None,
        }
    }

    const FEED: &str = "https://a.example.com/feed";

    #[tokio::test]
    async fn test_ingest_counts_new_rows() {
        let store = test_store().await;
        let inserted = store
            .ingest_articles(&[test_article("a1", 100, FEED), test_article("a2", 200, FEED)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let again = store
            .ingest_articles(&[test_article("a2", 200, FEED), test_article("a3", 300, FEED)])
            .await
            .unwrap();
        assert_eq!(again, 1);
    }

    #[tokio::test]
    async fn test_ingest_duplicate_within_batch_keeps_first() {
        let store = test_store().await;
        let mut second = test_article("dup", 100, FEED);
        second.title = "Second".to_string();

        let inserted = store
            .ingest_articles(&[test_article("dup", 100, FEED), second])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let stored = store.get_article("dup").await.unwrap().unwrap();
        assert_eq!(stored.title, "Title dup");
    }

    #[tokio::test]
    async fn test_ingest_empty_batch() {
        let store = test_store().await;
        assert_eq!(store.ingest_articles(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_blank_link_atomically() {
        let store = test_store().await;
        let result = store
            .ingest_articles(&[test_article("ok", 1, FEED), test_article("  ", 2, FEED)])
            .await;
        assert!(matches!(
            result,
            Err(crate::storage::StoreError::ConstraintViolation(_))
        ));
        assert!(store.all_articles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_failure_in_late_chunk_rolls_back_earlier_chunks() {
        let store = test_store().await;
        store.ingest_articles(&[test_article("kept", 0, FEED)]).await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_link_120 BEFORE INSERT ON articles
            WHEN NEW.link = 'link-120'
            BEGIN SELECT RAISE(ABORT, 'boom'); END
        "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        // Rows 0..50 and 50..100 land in earlier chunks than the failing row
        let batch: Vec<NewArticle> = (0..150)
            .map(|i| test_article(&format!("link-{i}"), i, FEED))
            .collect();
        let result = store.ingest_articles(&batch).await;

        assert!(matches!(
            result,
            Err(crate::storage::StoreError::StorageFault(_))
        ));
        let links: Vec<String> = store
            .all_articles()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.link)
            .collect();
        assert_eq!(links, vec!["kept"]);
    }

    #[tokio::test]
    async fn test_ingest_large_batch_chunking() {
        let store = test_store().await;
        let batch: Vec<NewArticle> = (0..175)
            .map(|i| test_article(&format!("link-{i}"), i, FEED))
            .collect();
        assert_eq!(store.ingest_articles(&batch).await.unwrap(), 175);
        assert_eq!(store.all_articles().await.unwrap().len(), 175);
    }

    #[tokio::test]
    async fn test_equal_pub_dates_keep_insertion_order() {
        let store = test_store().await;
        store
            .ingest_articles(&[
                test_article("first", 500, FEED),
                test_article("second", 500, FEED),
                test_article("newer", 900, FEED),
            ])
            .await
            .unwrap();

        let links: Vec<String> = store
            .all_articles()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.link)
            .collect();
        assert_eq!(links, vec!["newer", "first", "second"]);
    }

    #[tokio::test]
    async fn test_mark_read_and_saved() {
        let store = test_store().await;
        store.ingest_articles(&[test_article("a1", 1, FEED)]).await.unwrap();

        assert!(store.mark_read("a1", true).await.unwrap());
        assert!(!store.mark_read("a1", true).await.unwrap(), "Already read");
        assert!(store.mark_saved("a1", true).await.unwrap());

        let stored = store.get_article("a1").await.unwrap().unwrap();
        assert!(stored.is_read);
        assert!(stored.is_saved);

        assert!(store.mark_read("a1", false).await.unwrap());
        assert!(!store.get_article("a1").await.unwrap().unwrap().is_read);
    }

    #[tokio::test]
    async fn test_mark_unknown_link_is_noop() {
        let store = test_store().await;
        assert!(!store.mark_read("missing", true).await.unwrap());
        assert!(!store.mark_saved("missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_links_and_unread_counts() {
        let store = test_store().await;
        let other = "https://b.example.com/feed";
        store
            .ingest_articles(&[
                test_article("a1", 1, FEED),
                test_article("a2", 2, FEED),
                test_article("b1", 3, other),
            ])
            .await
            .unwrap();
        store.mark_read("a1", true).await.unwrap();

        assert_eq!(store.read_article_links().await.unwrap(), vec!["a1"]);

        let counts = store.unread_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].source_url, FEED);
        assert_eq!(counts[0].count, 1);
        assert_eq!(counts[1].source_url, other);
        assert_eq!(counts[1].count, 1);
    }

    #[tokio::test]
    async fn test_mark_source_and_all_read() {
        let store = test_store().await;
        let other = "https://b.example.com/feed";
        store
            .ingest_articles(&[
                test_article("a1", 1, FEED),
                test_article("a2", 2, FEED),
                test_article("b1", 3, other),
            ])
            .await
            .unwrap();

        assert_eq!(store.mark_source_read(FEED).await.unwrap(), 2);
        assert_eq!(store.mark_source_read(FEED).await.unwrap(), 0);
        assert_eq!(store.mark_all_read().await.unwrap(), 1);
        assert!(store.unread_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_folder_read_only_touches_folder() {
        let store = test_store().await;
        let other = "https://b.example.com/feed";
        store.create_folder("Tech").await.unwrap();
        store
            .upsert_source(&Source::new(FEED, "A").in_folder("Tech"))
            .await
            .unwrap();
        store.upsert_source(&Source::new(other, "B")).await.unwrap();
        store
            .ingest_articles(&[test_article("a1", 1, FEED), test_article("b1", 2, other)])
            .await
            .unwrap();

        assert_eq!(store.mark_folder_read("Tech").await.unwrap(), 1);
        assert!(store.get_article("a1").await.unwrap().unwrap().is_read);
        assert!(!store.get_article("b1").await.unwrap().unwrap().is_read);

        let in_folder = store.articles_by_folder("Tech").await.unwrap();
        assert_eq!(in_folder.len(), 1);
        assert_eq!(in_folder[0].link, "a1");
    }

    #[tokio::test]
    async fn test_saved_articles_and_count() {
        let store = test_store().await;
        store
            .ingest_articles(&[test_article("a1", 1, FEED), test_article("a2", 2, FEED)])
            .await
            .unwrap();
        store.mark_saved("a1", true).await.unwrap();

        let saved = store.saved_articles().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].link, "a1");
        assert_eq!(store.saved_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_article_with_source_title() {
        let store = test_store().await;
        store.upsert_source(&Source::new(FEED, "Feed A")).await.unwrap();
        store
            .ingest_articles(&[
                test_article("a1", 1, FEED),
                test_article("orphan", 2, "https://gone.example.com/feed"),
            ])
            .await
            .unwrap();

        let detail = store.article_with_source("a1").await.unwrap().unwrap();
        assert_eq!(detail.article.link, "a1");
        assert_eq!(detail.source_title.as_deref(), Some("Feed A"));

        let orphan = store.article_with_source("orphan").await.unwrap().unwrap();
        assert_eq!(orphan.source_title, None);

        assert!(store.article_with_source("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncate_oversized_descriptions() {
        let store = test_store().await;
        let mut big = test_article("big", 1, FEED);
        big.description = Some("x".repeat(50));
        store
            .ingest_articles(&[big, test_article("small", 2, FEED)])
            .await
            .unwrap();

        assert_eq!(store.truncate_oversized_descriptions(20).await.unwrap(), 1);
        let stored = store.get_article("big").await.unwrap().unwrap();
        assert_eq!(stored.description.unwrap().len(), 20);
        assert_eq!(
            store.get_article("small").await.unwrap().unwrap().description.as_deref(),
            Some("Test description")
        );
    }
}
