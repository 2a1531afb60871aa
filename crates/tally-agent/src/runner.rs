use crate::config::AgentConfig;
use crate::uploader::Uploader;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_collector::snapshot::MetricSnapshot;
use tally_collector::Collector;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

type SharedCollector = Arc<Mutex<Box<dyn Collector>>>;

#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub poll: Duration,
    pub report: Duration,
    /// Bound on in-flight uploads at shutdown.
    pub grace: Duration,
}

impl LoopTiming {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            poll: config.poll_interval(),
            report: config.report_interval(),
            grace: config.shutdown_grace(),
        }
    }
}

/// The agent's scheduler.
///
/// Poll ticks run the primary and extra refreshes as blocking tasks. Report
/// ticks wait for every in-flight refresh, then start an upload without
/// waiting for it. Shutdown waits (bounded) for running uploads, then does
/// one last refresh-drain and upload inline.
pub struct CollectionLoop {
    snapshot: Arc<MetricSnapshot>,
    primary: SharedCollector,
    extra: Option<SharedCollector>,
    uploader: Arc<Uploader>,
    timing: LoopTiming,
}

impl CollectionLoop {
    pub fn new(
        snapshot: Arc<MetricSnapshot>,
        primary: Box<dyn Collector>,
        uploader: Arc<Uploader>,
        timing: LoopTiming,
    ) -> Self {
        Self {
            snapshot,
            primary: Arc::new(Mutex::new(primary)),
            extra: None,
            uploader,
            timing,
        }
    }

    pub fn with_extra(mut self, extra: Box<dyn Collector>) -> Self {
        self.extra = Some(Arc::new(Mutex::new(extra)));
        self
    }

    pub fn snapshot(&self) -> &Arc<MetricSnapshot> {
        &self.snapshot
    }

    fn spawn_refreshes(&self, refreshes: &mut JoinSet<()>) {
        let snapshot = Arc::clone(&self.snapshot);
        let primary = Arc::clone(&self.primary);
        refreshes.spawn_blocking(move || {
            let mut source = primary.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = snapshot.refresh(&mut **source) {
                tracing::warn!(collector = source.name(), error = %e, "Refresh failed");
            }
        });

        if let Some(extra) = &self.extra {
            let snapshot = Arc::clone(&self.snapshot);
            let extra = Arc::clone(extra);
            refreshes.spawn_blocking(move || {
                let mut source = extra.lock().unwrap_or_else(|p| p.into_inner());
                if let Err(e) = snapshot.refresh_extra(&mut **source) {
                    tracing::warn!(collector = source.name(), error = %e, "Extra refresh failed");
                }
            });
        }
    }

    async fn upload(uploader: &Uploader, snapshot: &MetricSnapshot) {
        match uploader.upload_batch(snapshot).await {
            Ok(count) => tracing::info!(count, "Metrics reported"),
            Err(e) => tracing::warn!(error = %e, "Upload failed, will retry next cycle"),
        }
    }

    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut poll = interval(self.timing.poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval_at(Instant::now() + self.timing.report, self.timing.report);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut refreshes: JoinSet<()> = JoinSet::new();
        let mut uploads: JoinSet<()> = JoinSet::new();
        tokio::pin!(shutdown);

        tracing::info!(
            poll_ms = self.timing.poll.as_millis() as u64,
            report_ms = self.timing.report.as_millis() as u64,
            "Starting collection loop"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.spawn_refreshes(&mut refreshes);
                }
                _ = report.tick() => {
                    drain(&mut refreshes).await;
                    let uploader = Arc::clone(&self.uploader);
                    let snapshot = Arc::clone(&self.snapshot);
                    uploads.spawn(async move { Self::upload(&uploader, &snapshot).await });
                }
                Some(joined) = refreshes.join_next(), if !refreshes.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Refresh task panicked");
                    }
                }
                Some(joined) = uploads.join_next(), if !uploads.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Upload task panicked");
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down gracefully");
                    break;
                }
            }
        }

        if tokio::time::timeout(self.timing.grace, drain(&mut uploads))
            .await
            .is_err()
        {
            tracing::warn!(pending = uploads.len(), "Uploads still running after grace period, aborting");
            uploads.abort_all();
            drain(&mut uploads).await;
        }

        drain(&mut refreshes).await;
        match self.uploader.upload_batch(&self.snapshot).await {
            Ok(count) => tracing::info!(count, "Final upload done"),
            Err(e) => tracing::error!(error = %e, "Final upload failed"),
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Task failed");
            }
        }
    }
}
