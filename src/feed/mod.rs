//! Feed synchronization and subscription exchange.
//!
//! The store never touches the network. Fetching and parsing belong to a
//! [`FeedFetcher`] supplied by the caller; this module drives it across the
//! stored sources and hands each source's batch to the store.
//!
//! - [`sync_all`] refreshes every source with bounded concurrency
//! - [`sync_one`] refreshes a single source
//! - [`add_source`] fetches a new source once before storing it
//! - [`import_opml`] and [`export_opml`] exchange subscription lists as OPML

mod opml;
mod sync;

pub use opml::{
    export_opml, import_opml, parse_opml, render_opml, OpmlDocument, OpmlError, OpmlSource,
    MAX_OPML_BYTES,
};
pub use sync::{add_source, sync_all, sync_one, FeedFetcher, FetchError, SyncError, SyncResult};
