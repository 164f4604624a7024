//! Property tests for ingestion: ordering and idempotence hold for arbitrary
//! batches.

use proptest::prelude::*;
use riffle::storage::{FeedStore, NewArticle};
use std::collections::HashSet;

const FEED: &str = "https://a.com/feed";

fn batch_strategy() -> impl Strategy<Value = Vec<(u8, i64)>> {
    // Small link space so duplicates within and across batches are common
    prop::collection::vec((0u8..40, -1_000i64..1_000), 0..80)
}

fn to_articles(batch: &[(u8, i64)], tag: &str) -> Vec<NewArticle> {
    batch
        .iter()
        .map(|(id, pub_date)| NewArticle {
            link: format!("link-{id}"),
            title: format!("{tag}-{id}"),
            description: None,
            pub_date: *pub_date,
            source_url: FEED.to_string(),
            image_url: None,
        })
        .collect()
}

fn run<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_snapshot_is_newest_first(first in batch_strategy(), second in batch_strategy()) {
        let rows = run(async {
            let store = FeedStore::open(":memory:").await.unwrap();
            store.ingest_articles(&to_articles(&first, "first")).await.unwrap();
            store.ingest_articles(&to_articles(&second, "second")).await.unwrap();
            store.all_articles().await.unwrap()
        });

        for pair in rows.windows(2) {
            prop_assert!(pair[0].pub_date >= pair[1].pub_date);
        }
    }

    #[test]
    fn prop_ingest_is_idempotent(first in batch_strategy(), second in batch_strategy()) {
        let (inserted_first, inserted_again, inserted_second, rows) = run(async {
            let store = FeedStore::open(":memory:").await.unwrap();
            let a = store.ingest_articles(&to_articles(&first, "first")).await.unwrap();
            let again = store.ingest_articles(&to_articles(&first, "again")).await.unwrap();
            let b = store.ingest_articles(&to_articles(&second, "second")).await.unwrap();
            (a, again, b, store.all_articles().await.unwrap())
        });

        let first_links: HashSet<u8> = first.iter().map(|(id, _)| *id).collect();
        let all_links: HashSet<u8> = first.iter().chain(second.iter()).map(|(id, _)| *id).collect();

        prop_assert_eq!(inserted_first, first_links.len());
        prop_assert_eq!(inserted_again, 0);
        prop_assert_eq!(inserted_first + inserted_second, all_links.len());
        prop_assert_eq!(rows.len(), all_links.len());

        // A link present after the first batch keeps its first-batch row
        for row in &rows {
            let id: u8 = row.link.trim_start_matches("link-").parse().unwrap();
            if first_links.contains(&id) {
                prop_assert_eq!(&row.title, &format!("first-{id}"));
            } else {
                prop_assert_eq!(&row.title, &format!("second-{id}"));
            }
        }
    }
}
