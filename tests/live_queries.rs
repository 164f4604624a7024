//! Integration tests for live queries: initial snapshots, re-delivery after
//! commits, coalescing and cancellation.

use futures::StreamExt;
use pretty_assertions::assert_eq;
use riffle::storage::{FeedStore, NewArticle, Source};
use std::time::Duration;

const FEED: &str = "https://a.com/feed";

async fn test_store() -> FeedStore {
    FeedStore::open(":memory:").await.unwrap()
}

fn article(link: &str, pub_date: i64) -> NewArticle {
    NewArticle {
        link: link.to_string(),
        title: link.to_uppercase(),
        description: None,
        pub_date,
        source_url: FEED.to_string(),
        image_url: None,
    }
}

/// Wait (bounded) for a snapshot matching `pred`, skipping stale ones.
async fn wait_for<T, P>(live: &mut riffle::storage::LiveQuery<T>, mut pred: P) -> Vec<T>
where
    T: Send + 'static,
    P: FnMut(&[T]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = live.next().await.expect("stream ended").expect("query failed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("no matching snapshot")
}

#[tokio::test]
async fn test_mark_read_is_observed() {
    let store = test_store().await;
    store.ingest_articles(&[article("x", 1)]).await.unwrap();

    let mut live = store.watch_all_articles();
    let first = live.next().await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert!(!first[0].is_read);

    store.mark_read("x", true).await.unwrap();

    let updated = wait_for(&mut live, |rows| rows.first().is_some_and(|a| a.is_read)).await;
    assert_eq!(updated[0].link, "x");
}

#[tokio::test]
async fn test_ingest_is_observed_in_order() {
    let store = test_store().await;
    let mut live = store.watch_articles_by_source(FEED);
    assert!(live.next().await.unwrap().unwrap().is_empty());

    store
        .ingest_articles(&[article("old", 100), article("new", 200)])
        .await
        .unwrap();

    let rows = wait_for(&mut live, |rows| rows.len() == 2).await;
    let links: Vec<&str> = rows.iter().map(|a| a.link.as_str()).collect();
    assert_eq!(links, vec!["new", "old"]);
}

#[tokio::test]
async fn test_burst_coalesces_to_latest_state() {
    let store = test_store().await;
    let mut live = store.watch_all_articles();
    live.next().await.unwrap().unwrap();

    for i in 0..20 {
        store
            .ingest_articles(&[article(&format!("a{i}"), i)])
            .await
            .unwrap();
    }

    // However many snapshots arrive, the last state is always reached
    let rows = wait_for(&mut live, |rows| rows.len() == 20).await;
    assert_eq!(rows[0].link, "a19");
}

#[tokio::test]
async fn test_sources_watch_ignores_article_writes() {
    let store = test_store().await;
    let mut live = store.watch_all_sources();
    live.next().await.unwrap().unwrap();

    store.ingest_articles(&[article("x", 1)]).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_millis(50), live.next()).await;
    assert!(waited.is_err());

    store.upsert_source(&Source::new(FEED, "A")).await.unwrap();
    let rows = wait_for(&mut live, |rows| rows.len() == 1).await;
    assert_eq!(rows[0].title, "A");
}

#[tokio::test]
async fn test_folder_rename_reaches_source_watchers() {
    let store = test_store().await;
    store.create_folder("Old").await.unwrap();
    store
        .upsert_source(&Source::new(FEED, "A").in_folder("Old"))
        .await
        .unwrap();

    let mut live = store.watch_all_sources();
    live.next().await.unwrap().unwrap();

    store.rename_folder("Old", "New").await.unwrap();
    wait_for(&mut live, |rows| {
        rows.first()
            .is_some_and(|s| s.folder_name.as_deref() == Some("New"))
    })
    .await;
}

#[tokio::test]
async fn test_watch_article_detail() {
    let store = test_store().await;
    store.upsert_source(&Source::new(FEED, "A")).await.unwrap();

    let mut live = store.watch_article("x");
    assert!(live.next().await.unwrap().unwrap().is_empty());

    store.ingest_articles(&[article("x", 1)]).await.unwrap();
    let rows = wait_for(&mut live, |rows| rows.len() == 1).await;
    assert_eq!(rows[0].source_title.as_deref(), Some("A"));

    store.rename_source(FEED, "Renamed").await.unwrap();
    wait_for(&mut live, |rows| {
        rows.first()
            .is_some_and(|d| d.source_title.as_deref() == Some("Renamed"))
    })
    .await;
}

#[tokio::test]
async fn test_saved_count_tracks_flags() {
    let store = test_store().await;
    store
        .ingest_articles(&[article("x", 1), article("y", 2)])
        .await
        .unwrap();

    let mut live = store.watch_saved_count();
    assert_eq!(live.next().await.unwrap().unwrap(), vec![0]);

    store.mark_saved("x", true).await.unwrap();
    store.mark_saved("y", true).await.unwrap();
    wait_for(&mut live, |rows| rows == [2]).await;
}

#[tokio::test]
async fn test_cancel_releases_registration() {
    let store = test_store().await;
    let mut live = store.watch_all_articles();
    live.next().await.unwrap().unwrap();
    assert_eq!(store.live_query_count(), 1);

    live.cancel();
    for _ in 0..50 {
        if store.live_query_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(store.live_query_count(), 0);

    // Writes after cancellation still succeed with no subscriber
    store.ingest_articles(&[article("x", 1)]).await.unwrap();
}

#[tokio::test]
async fn test_live_query_as_stream() {
    let store = test_store().await;
    store.ingest_articles(&[article("x", 1)]).await.unwrap();

    let mut live = store.watch_all_articles();
    let first = StreamExt::next(&mut live).await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
}
