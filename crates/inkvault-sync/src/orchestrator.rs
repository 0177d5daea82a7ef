//! The long-running control loop: list the catalog, narrow and order it, then
//! walk it one series at a time under a lease.

use std::sync::Arc;
use std::time::Duration;

use inkvault_adapters::{filter_to_popular, PopularitySource, SourceAdapter};
use inkvault_core::{diff_new_chapters, IngestError, Series};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{IngestConfig, ProcessingOrder, RunMode};
use crate::lease::{LeaseAttempt, LeaseManager};
use crate::store::CatalogStore;
use crate::worker::{ChapterJob, ChapterWorker};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub run_mode: RunMode,
    pub order: ProcessingOrder,
    /// Pause after a failed catalog listing before the next attempt.
    pub catalog_retry: Duration,
    /// Pause after finding a series locked by another run.
    pub lease_wait: Duration,
    pub pass_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            run_mode: config.run_mode,
            order: config.order,
            catalog_retry: config.catalog_retry(),
            lease_wait: config.lease_wait(),
            pass_interval: config.pass_interval(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Full,
            order: ProcessingOrder::Forward,
            catalog_retry: Duration::from_secs(300),
            lease_wait: Duration::from_secs(3),
            pass_interval: Duration::ZERO,
        }
    }
}

/// Counters for one walk over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub series_listed: usize,
    pub series_selected: usize,
    pub series_processed: usize,
    pub series_locked: usize,
    pub series_failed: usize,
    pub chapters_ingested: usize,
    pub chapters_failed: usize,
    /// Shutdown was requested before every selected series was visited.
    pub stopped_early: bool,
}

pub struct Orchestrator {
    adapter: Arc<dyn SourceAdapter>,
    popularity: Option<Arc<dyn PopularitySource>>,
    store: Arc<dyn CatalogStore>,
    leases: LeaseManager,
    worker: ChapterWorker,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        popularity: Option<Arc<dyn PopularitySource>>,
        store: Arc<dyn CatalogStore>,
        worker: ChapterWorker,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            adapter,
            popularity,
            leases: LeaseManager::new(Arc::clone(&store)),
            store,
            worker,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling the returned token stops the loop at the next series or
    /// chapter boundary. The chapter in flight finishes and the lease it runs
    /// under is released first.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sleep for `duration` unless shutdown is requested first. Returns
    /// `false` when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Run passes until shutdown is requested. A failed catalog listing
    /// backs off for `catalog_retry`; nothing else ends or pauses the loop.
    pub async fn run_forever(&self) {
        while !self.shutdown.is_cancelled() {
            let resume = match self.run_pass().await {
                Ok(summary) => {
                    info!(?summary, "pass complete");
                    self.pause(self.settings.pass_interval).await
                }
                Err(err) => {
                    error!(
                        error = %err,
                        retry_in_secs = self.settings.catalog_retry.as_secs(),
                        "catalog discovery failed"
                    );
                    self.pause(self.settings.catalog_retry).await
                }
            };
            if !resume {
                break;
            }
        }
        info!("ingest loop stopped");
    }

    /// One walk over the catalog. Only catalog-level discovery errors are
    /// returned; per-series and per-chapter failures are logged and counted.
    pub async fn run_pass(&self) -> Result<PassSummary, IngestError> {
        let mut summary = PassSummary::default();
        let series = self.adapter.list_series().await?;
        summary.series_listed = series.len();

        let series = self.select(series).await?;
        summary.series_selected = series.len();
        info!(
            source = self.adapter.source_id(),
            count = series.len(),
            "series to process"
        );

        for s in &series {
            if self.shutdown.is_cancelled() {
                summary.stopped_early = true;
                break;
            }
            match self.leases.try_acquire(&s.key()).await {
                Ok(LeaseAttempt::Acquired(lease)) => {
                    info!(series = %s.name, "picked series");
                    let span = info_span!("series", series = %s.name);
                    self.process_series(s, &mut summary).instrument(span).await;
                    self.leases.release(&lease).await;
                }
                Ok(LeaseAttempt::Held) => {
                    info!(series = %s.name, "series is being processed elsewhere");
                    summary.series_locked += 1;
                    self.pause(self.settings.lease_wait).await;
                }
                Err(err) => {
                    warn!(series = %s.name, error = %err, "could not take lease");
                    summary.series_failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn select(&self, series: Vec<Series>) -> Result<Vec<Series>, IngestError> {
        let mut series = match self.settings.run_mode {
            RunMode::Full => series,
            RunMode::Top30 => {
                let feed = self.popularity.as_ref().ok_or_else(|| {
                    IngestError::discovery("top30 run mode needs a popularity feed url")
                })?;
                let popular = feed.popular_names().await?;
                filter_to_popular(series, &popular)
            }
        };
        if self.settings.order == ProcessingOrder::Reverse {
            series.reverse();
        }
        Ok(series)
    }

    /// Chapters listed on the source that are not yet in the catalog, in
    /// source order.
    pub async fn new_chapter_jobs(&self, series: &Series) -> Result<Vec<ChapterJob>, IngestError> {
        let discovered = self.adapter.list_chapters(series).await?;
        let existing = self.store.list_chapter_names(&series.key()).await?;
        Ok(diff_new_chapters(discovered, &existing)
            .into_iter()
            .map(|chapter| ChapterJob {
                series: series.clone(),
                chapter,
            })
            .collect())
    }

    async fn process_series(&self, series: &Series, summary: &mut PassSummary) {
        let jobs = match self.new_chapter_jobs(series).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "could not list chapters");
                summary.series_failed += 1;
                return;
            }
        };
        info!(new_chapters = jobs.len(), "chapters to ingest");

        for job in &jobs {
            if self.shutdown.is_cancelled() {
                info!("stopping before remaining chapters");
                summary.stopped_early = true;
                return;
            }
            match self.worker.run(job).await {
                Ok(_) => summary.chapters_ingested += 1,
                Err(err) => {
                    warn!(chapter = %job.chapter.name, error = %err, "chapter dropped");
                    summary.chapters_failed += 1;
                }
            }
        }
        summary.series_processed += 1;
        info!("completed series");
    }
}
