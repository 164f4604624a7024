//! riffle: an embedded feed-and-article store.
//!
//! [`storage::FeedStore`] keeps folders, sources and articles in SQLite,
//! deduplicates ingested articles by link and serves live queries that
//! re-deliver their results after every relevant write. [`feed`] drives a
//! caller-supplied fetcher across the stored sources.

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
