//! Embedded feed store.
//!
//! Folders, sources and articles live in one SQLite database. Every mutation
//! is a single transaction; readers either take a one-shot snapshot or
//! subscribe to a [`LiveQuery`] that re-delivers its result after each
//! committed write to the tables it reads.

mod articles;
mod backup;
mod folders;
mod live;
mod schema;
mod sources;
mod types;

pub use articles::DEFAULT_MAX_DESCRIPTION_CHARS;
pub use backup::{Backup, ImportSummary, BACKUP_VERSION};
pub use live::LiveQuery;
pub use schema::{schema_identity, FeedStore, Migration, StoreOptions};
pub use types::{
    Article, ArticleWithSource, Folder, NewArticle, Source, SourceUnreadCount, StoreError,
    StoreResult, Table,
};
