use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::storage::{FeedStore, NewArticle, Source, StoreError};

/// Errors a fetcher reports for one source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure (DNS, connection, TLS, timeout)
    #[error("Request failed: {0}")]
    Network(String),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body could not be parsed as a feed
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Errors from syncing one source.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fetch/parse collaborator.
///
/// Implementations own their retry and rate-limit policy; the sync driver
/// calls `fetch` once per source per run.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Current articles of `source`. Articles with an empty `source_url` are
    /// attributed to `source`.
    async fn fetch(&self, source: &Source) -> Result<Vec<NewArticle>, FetchError>;
}

/// Outcome of syncing one source.
#[derive(Debug)]
pub struct SyncResult {
    pub source_url: String,
    /// Number of new articles ingested, or the error that occurred
    pub result: Result<usize, SyncError>,
}

/// Fetch `source` and ingest the batch as one transaction.
pub async fn sync_one<F>(store: &FeedStore, fetcher: &F, source: &Source) -> Result<usize, SyncError>
where
    F: FeedFetcher + ?Sized,
{
    let articles = fetcher.fetch(source).await?;
    let articles = attribute_to(source, articles);
    let inserted = store.ingest_articles(&articles).await?;
    tracing::debug!(
        url = %source.url,
        fetched = articles.len(),
        inserted = inserted,
        "Synced source"
    );
    Ok(inserted)
}

/// Sync every stored source, at most `concurrency` at a time.
///
/// Each source's batch commits independently, so one failing source never
/// rolls back another's articles. Results arrive in completion order. When
/// `progress_tx` is given it receives `(completed, total)` after each source.
pub async fn sync_all<F>(
    store: &FeedStore,
    fetcher: &F,
    concurrency: usize,
    progress_tx: Option<mpsc::Sender<(usize, usize)>>,
) -> Result<Vec<SyncResult>, StoreError>
where
    F: FeedFetcher + ?Sized,
{
    let sources = store.all_sources().await?;
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let total = sources.len();
    let completed = AtomicUsize::new(0);

    let results: Vec<SyncResult> = stream::iter(sources)
        .map(|source| {
            let progress_tx = progress_tx.clone();
            let completed = &completed;
            async move {
                let result = sync_one(store, fetcher, &source).await;
                if let Err(e) = &result {
                    tracing::warn!(url = %source.url, error = %e, "Source sync failed");
                }

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(tx) = progress_tx {
                    if tx.send((done, total)).await.is_err() {
                        tracing::debug!(done = done, total = total, "Progress receiver dropped");
                    }
                }

                SyncResult {
                    source_url: source.url,
                    result,
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let failed = results.iter().filter(|r| r.result.is_err()).count();
    let inserted: usize = results
        .iter()
        .filter_map(|r| r.result.as_ref().ok())
        .sum();
    tracing::info!(
        sources = total,
        failed = failed,
        inserted = inserted,
        "Sync finished"
    );

    Ok(results)
}

/// Fetch a new source once, then store it together with its first batch.
///
/// Nothing is stored when the fetch fails. Returns the number of articles
/// ingested.
pub async fn add_source<F>(store: &FeedStore, fetcher: &F, source: &Source) -> Result<usize, SyncError>
where
    F: FeedFetcher + ?Sized,
{
    crate::util::validate_source_url(&source.url)
        .map_err(|e| StoreError::ConstraintViolation(format!("{}: {e}", source.url)))?;

    let articles = attribute_to(source, fetcher.fetch(source).await?);
    store.upsert_source(source).await?;
    let inserted = store.ingest_articles(&articles).await?;
    tracing::info!(url = %source.url, articles = inserted, "Added source");
    Ok(inserted)
}

fn attribute_to(source: &Source, mut articles: Vec<NewArticle>) -> Vec<NewArticle> {
    for article in &mut articles {
        if article.source_url.trim().is_empty() {
            article.source_url = source.url.clone();
        }
    }
    articles
}
