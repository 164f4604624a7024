//! Change notification and live queries.
//!
//! Every committed write bumps a version counter for each table it touched.
//! A live query runs on its own task: it evaluates once, then waits for any of
//! its tables' counters to move and evaluates again, pushing each snapshot to
//! the subscriber through a bounded channel. Bursts of writes that land while
//! a snapshot is being delivered coalesce into a single re-evaluation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::types::{StoreResult, Table};

// ============================================================================
// Change Tracker
// ============================================================================

const TABLE_COUNT: usize = Table::ALL.len();

type TableVersions = [u64; TABLE_COUNT];

/// Per-table version counters shared by a store and its live queries.
#[derive(Debug)]
pub(crate) struct ChangeTracker {
    versions: watch::Sender<TableVersions>,
}

impl ChangeTracker {
    pub(crate) fn new() -> Self {
        let (versions, _) = watch::channel([0; TABLE_COUNT]);
        Self { versions }
    }

    /// Record a committed change to `tables` and wake every live query.
    pub(crate) fn notify(&self, tables: &[Table]) {
        if tables.is_empty() {
            return;
        }
        self.versions.send_modify(|versions| {
            for table in tables {
                versions[table.index()] = versions[table.index()].wrapping_add(1);
            }
        });
        tracing::trace!(
            tables = ?tables,
            subscribers = self.versions.receiver_count(),
            "Invalidated tables"
        );
    }

    fn subscribe(&self) -> watch::Receiver<TableVersions> {
        self.versions.subscribe()
    }

    /// Number of live queries currently registered.
    pub(crate) fn subscriber_count(&self) -> usize {
        self.versions.receiver_count()
    }
}

// ============================================================================
// Live Query
// ============================================================================

/// A push stream of query snapshots.
///
/// The first snapshot is delivered as soon as the query has been evaluated;
/// later snapshots follow each committed write to one of the query's tables.
/// The stream only ends when the subscriber cancels (or drops the handle), or
/// after delivering an `Err` from a failed evaluation.
pub struct LiveQuery<T> {
    rx: mpsc::Receiver<StoreResult<Vec<T>>>,
    worker: JoinHandle<()>,
}

impl<T: Send + 'static> LiveQuery<T> {
    pub(crate) fn spawn<F, Fut>(
        tracker: &ChangeTracker,
        tables: &'static [Table],
        buffer: usize,
        query: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<Vec<T>>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        // Subscribe before the first evaluation so no commit can slip between
        // the initial snapshot and the registration.
        let changes = tracker.subscribe();
        let worker = tokio::spawn(run_live_query(changes, tables, tx, query));
        Self { rx, worker }
    }

    /// Wait for the next snapshot.
    ///
    /// Returns `None` once the query has terminated after an error.
    pub async fn next(&mut self) -> Option<StoreResult<Vec<T>>> {
        self.rx.recv().await
    }

    /// Stop the query and release its registration.
    ///
    /// Consumes the handle, so no further snapshot can be observed.
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.worker.abort();
        self.rx.close();
    }
}

impl<T> Stream for LiveQuery<T> {
    type Item = StoreResult<Vec<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn run_live_query<T, F, Fut>(
    mut changes: watch::Receiver<TableVersions>,
    tables: &'static [Table],
    tx: mpsc::Sender<StoreResult<Vec<T>>>,
    query: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<Vec<T>>>,
{
    let mut seen = *changes.borrow_and_update();

    loop {
        let pending = query();
        let snapshot = pending.await;
        let failed = snapshot.is_err();
        if let Err(e) = &snapshot {
            tracing::warn!(error = %e, tables = ?tables, "Live query evaluation failed");
        }
        if tx.send(snapshot).await.is_err() || failed {
            return;
        }

        // Wait until one of our tables moves
        loop {
            tokio::select! {
                _ = tx.closed() => return,
                changed = changes.changed() => {
                    if changed.is_err() {
                        // Store dropped; nothing can change any more
                        return;
                    }
                    let current = *changes.borrow_and_update();
                    let touched = tables
                        .iter()
                        .any(|t| current[t.index()] != seen[t.index()]);
                    seen = current;
                    if touched {
                        break;
                    }
                }
            }
        }
    }
}
