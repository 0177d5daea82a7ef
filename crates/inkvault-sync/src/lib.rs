//! Ingestion orchestration: configuration, the catalog store, per-series
//! leases, the chapter worker and the control loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use inkvault_adapters::{MangaReaderAdapter, PopularityFeed, PopularitySource, SourceAdapter};
use inkvault_storage::{
    ImageFetcher, ImagePipeline, ImagePipelineConfig, PooledFetcher, ShardedImageStore, Watermark,
};
use tracing::info;

pub mod config;
pub mod lease;
pub mod orchestrator;
pub mod store;
pub mod worker;

pub use config::{IngestConfig, ProcessingOrder, RunMode};
pub use lease::{LeaseAttempt, LeaseManager};
pub use orchestrator::{Orchestrator, OrchestratorSettings, PassSummary};
pub use store::{CatalogStore, MemoryCatalogStore, PgCatalogStore};
pub use worker::{ChapterJob, ChapterOutcome, ChapterWorker};

pub const CRATE_NAME: &str = "inkvault-sync";

/// Connect to Postgres and bring the schema up to date.
pub async fn connect_catalog(database_url: &str) -> Result<PgCatalogStore> {
    let store = PgCatalogStore::connect(database_url).await?;
    store.migrate().await?;
    Ok(store)
}

/// Wire every component from configuration: one client pool shared by the
/// adapter, the popularity feed and the image pipeline.
pub async fn build_orchestrator(config: &IngestConfig) -> Result<Orchestrator> {
    let fetcher = Arc::new(PooledFetcher::new(&config.http_client_config())?);

    let adapter: Arc<dyn SourceAdapter> = Arc::new(
        MangaReaderAdapter::new(&config.source_root, Arc::clone(&fetcher))
            .context("building source adapter")?,
    );
    let popularity = config.popular_feed_url.as_ref().map(|url| {
        Arc::new(PopularityFeed::new(url.clone(), Arc::clone(&fetcher))) as Arc<dyn PopularitySource>
    });

    let store: Arc<dyn CatalogStore> = Arc::new(connect_catalog(&config.database_url).await?);

    let images = ShardedImageStore::new(config.storage_root.clone(), config.shard_count);
    images.prepare().await?;
    let watermark = Watermark::load(&config.watermark_path)?;
    let image_fetcher: Arc<dyn ImageFetcher> = fetcher;
    let pipeline = Arc::new(ImagePipeline::new(
        image_fetcher,
        images,
        watermark,
        ImagePipelineConfig {
            public_base_url: config.image_server.clone(),
            jpeg_quality: config.jpeg_quality,
        },
    ));

    let worker = ChapterWorker::new(Arc::clone(&adapter), pipeline, Arc::clone(&store));
    info!(source = adapter.source_id(), "pipeline ready");
    Ok(Orchestrator::new(
        adapter,
        popularity,
        store,
        worker,
        OrchestratorSettings::from_config(config),
    ))
}
