//! Polling watcher turning endpoint snapshots into listen events

use crate::endpoint::{diff, ListenEvent, ListenSnapshot};
use crate::error::QueryError;
use crate::procfs::ListenQuery;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default interval between two endpoint queries
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Watches bound endpoints and reports every change
pub struct ListenWatcher<Q> {
    query: Q,
    poll_interval: Duration,
    snapshot: ListenSnapshot,
}

impl<Q: ListenQuery> ListenWatcher<Q> {
    pub fn new(query: Q, poll_interval: Duration) -> Self {
        Self {
            query,
            poll_interval,
            snapshot: ListenSnapshot::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The snapshot taken by the last successful poll
    pub fn snapshot(&self) -> &ListenSnapshot {
        &self.snapshot
    }

    /// Query once and return the changes since the previous poll
    pub async fn poll_once(&mut self) -> Result<Vec<ListenEvent>, QueryError> {
        let current = self.query.list_bound_endpoints().await?;
        let changes = diff(&self.snapshot, &current);
        self.snapshot = current;
        Ok(changes.into_events().collect())
    }

    /// Poll until `cancel` fires, calling `on_event` once per change
    ///
    /// A query failure stops the watcher and is returned as is.
    pub async fn watch<F>(
        &mut self,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(), QueryError>
    where
        F: FnMut(ListenEvent),
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let events = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result?,
            };

            for event in events {
                on_event(event);
            }
        }

        debug!("Listen watcher stopped");
        Ok(())
    }
}
