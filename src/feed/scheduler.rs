use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::fetcher::{PollReport, Poller};

/// Which sources a batch polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Live sources whose `due_poll` has passed, most overdue first
    Due,
    /// Exactly these sources, due or not, live or not
    Sources(Vec<i64>),
}

impl Poller {
    /// Run one polling batch of at most `max_feeds` sources.
    ///
    /// Polls run concurrently up to the configured limit. Reports come back
    /// in completion order. Proxy sentinels are purged once the batch ends.
    pub async fn update_feeds(&self, selection: Selection, max_feeds: usize) -> Result<Vec<PollReport>> {
        let now = Utc::now().timestamp();
        let limit = i64::try_from(max_feeds).unwrap_or(i64::MAX);

        let sources = match &selection {
            Selection::Due => {
                let queued = self.db().count_due_sources(now).await?;
                info!(queued, "Feeds in the polling queue");
                self.db().due_sources(now, limit).await?
            }
            Selection::Sources(ids) => self.db().sources_by_ids(ids, limit).await?,
        };

        if sources.is_empty() {
            info!("Nothing to poll");
            return Ok(Vec::new());
        }
        info!(count = sources.len(), "Polling sources");

        let concurrency = self.settings.concurrency.max(1);
        let reports: Vec<PollReport> = stream::iter(sources)
            .map(|source| self.poll_source(source))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        match self.proxies().purge_dead().await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Removed dead proxy placeholders"),
            Err(e) => warn!(error = %e, "Failed to purge dead proxies"),
        }

        Ok(reports)
    }
}

/// Handle to a background polling loop started by [`spawn_scheduler`].
pub struct SchedulerHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to stop and wait for the current batch to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.cancel_tx.send(());
        self.join.await?;
        Ok(())
    }
}

/// Poll due sources every `every`, `max_feeds` at a time, until stopped.
pub fn spawn_scheduler(poller: Poller, every: Duration, max_feeds: usize) -> SchedulerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("Scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match poller.update_feeds(Selection::Due, max_feeds).await {
                        Ok(reports) => {
                            let failed = reports.iter().filter(|r| r.result.is_err()).count();
                            if failed > 0 {
                                warn!(failed, "Some polls did not complete");
                            }
                        }
                        Err(e) => warn!(error = %e, "Polling batch failed"),
                    }
                }
            }
        }
    });

    SchedulerHandle { cancel_tx, join }
}
