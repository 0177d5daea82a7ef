use std::sync::Arc;

use chrono::Utc;
use inkvault_adapters::SourceAdapter;
use inkvault_core::{
    chapter_number, Chapter, IngestError, NewChapter, NewSeries, Series, SeriesRecord,
};
use inkvault_storage::{ImagePipeline, ProcessedPage};
use tokio::task::JoinSet;
use tracing::{debug_span, info, info_span, warn, Instrument};

use crate::store::CatalogStore;

/// One chapter to ingest, with the series it belongs to.
#[derive(Debug, Clone)]
pub struct ChapterJob {
    pub series: Series,
    pub chapter: Chapter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterOutcome {
    pub chapter_id: i64,
    pub chapter_no: i32,
    pub pages: usize,
}

/// Ingests a single chapter as one unit: every page lands, or none do.
#[derive(Clone)]
pub struct ChapterWorker {
    adapter: Arc<dyn SourceAdapter>,
    pipeline: Arc<ImagePipeline>,
    store: Arc<dyn CatalogStore>,
}

impl ChapterWorker {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        pipeline: Arc<ImagePipeline>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            adapter,
            pipeline,
            store,
        }
    }

    /// Look the series up by its normalized name and create it on first
    /// sight, with its details and a hosted copy of its cover.
    pub async fn ensure_series(&self, series: &Series) -> Result<SeriesRecord, IngestError> {
        if let Some(record) = self.store.find_series(&series.name).await? {
            return Ok(record);
        }
        info!(series = %series.name, "series not in catalog yet");

        let details = self.adapter.fetch_series_details(series).await?;
        let cover = self.pipeline.host_cover(&details.cover_image_url).await?;
        let created = self
            .store
            .create_series(&NewSeries {
                name: series.name.clone(),
                link: series.link.clone(),
                hosted_cover_url: cover.hosted_url.clone(),
                details,
            })
            .await;
        let record = match created {
            Ok(record) => record,
            Err(err) => {
                self.pipeline.store().remove(&cover.stored).await;
                return Err(err);
            }
        };
        info!(series = %record.name, series_id = record.id, "saved series");
        Ok(record)
    }

    /// Fan out one task per page and wait for every one of them. On any
    /// failure the successful pages are discarded and the first error
    /// observed is returned. Pages come back staged, ordered by page number.
    pub async fn process_pages(&self, chapter: &Chapter) -> Result<Vec<ProcessedPage>, IngestError> {
        let refs = self.adapter.list_page_refs(chapter).await?;
        if refs.is_empty() {
            warn!(chapter = %chapter.name, "chapter lists no pages");
        }

        let mut tasks = JoinSet::new();
        for page in refs {
            let adapter = Arc::clone(&self.adapter);
            let pipeline = Arc::clone(&self.pipeline);
            let span = debug_span!("page", page_no = page.page_no);
            tasks.spawn(
                async move {
                    let source = adapter.resolve_page_image(&page).await?;
                    pipeline.process_page(page.page_no, &source).await
                }
                .instrument(span),
            );
        }

        let mut processed = Vec::with_capacity(tasks.len());
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| IngestError::Task(e.to_string()))
                .and_then(|result| result);
            match outcome {
                Ok(page) => processed.push(page),
                Err(err) => {
                    warn!(chapter = %chapter.name, error = %err, "page failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            self.discard_all(&processed).await;
            return Err(err);
        }
        processed.sort_by_key(|p| p.page.page_no);
        Ok(processed)
    }

    pub async fn run(&self, job: &ChapterJob) -> Result<ChapterOutcome, IngestError> {
        let span = info_span!("chapter", series = %job.series.name, chapter = %job.chapter.name);
        self.run_inner(job).instrument(span).await
    }

    async fn run_inner(&self, job: &ChapterJob) -> Result<ChapterOutcome, IngestError> {
        let series = self.ensure_series(&job.series).await?;
        let pages = self.process_pages(&job.chapter).await?;

        let chapter_no = match chapter_number(&job.series.name, &job.chapter.name) {
            Ok(n) => n,
            Err(err) => {
                self.discard_all(&pages).await;
                return Err(err);
            }
        };

        self.commit_all(&pages).await?;

        let new_chapter = NewChapter {
            series_id: series.id,
            name: job.chapter.name.clone(),
            link: job.chapter.link.clone(),
            chapter_no,
            total_pages: i32::try_from(pages.len()).unwrap_or(i32::MAX),
            ingested_at: Utc::now(),
            pages: pages.iter().map(|p| p.page.clone()).collect(),
        };
        match self.store.create_chapter(&new_chapter).await {
            Ok(chapter_id) => {
                info!(chapter_id, chapter_no, pages = pages.len(), "saved chapter");
                Ok(ChapterOutcome {
                    chapter_id,
                    chapter_no,
                    pages: pages.len(),
                })
            }
            Err(err) => {
                for page in &pages {
                    self.pipeline.store().remove(&page.staged).await;
                }
                Err(err)
            }
        }
    }

    async fn discard_all(&self, pages: &[ProcessedPage]) {
        for page in pages {
            self.pipeline.store().discard(&page.staged).await;
        }
    }

    /// Move every staged page into place. If one rename fails, the pages
    /// already moved are deleted and the rest are discarded.
    async fn commit_all(&self, pages: &[ProcessedPage]) -> Result<(), IngestError> {
        let store = self.pipeline.store();
        for (i, page) in pages.iter().enumerate() {
            if let Err(err) = store.commit(&page.staged).await {
                for done in &pages[..i] {
                    store.remove(&done.staged).await;
                }
                self.discard_all(&pages[i..]).await;
                return Err(err);
            }
        }
        Ok(())
    }
}
