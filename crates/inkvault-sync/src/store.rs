//! Persisted catalog: series, chapters with their pages, and processing leases.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inkvault_core::{IngestError, NewChapter, NewSeries, ProcessingLease, SeriesRecord};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

/// Store operations the pipeline relies on. Each call is atomic on its own;
/// nothing spans calls.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_series(&self, name: &str) -> Result<Option<SeriesRecord>, IngestError>;

    async fn create_series(&self, series: &NewSeries) -> Result<SeriesRecord, IngestError>;

    /// Distinct chapter names already stored under the named series.
    async fn list_chapter_names(&self, series_name: &str) -> Result<Vec<String>, IngestError>;

    /// Write a chapter and all of its pages, or nothing.
    async fn create_chapter(&self, chapter: &NewChapter) -> Result<i64, IngestError>;

    /// Insert a lease unless one already exists for the key.
    async fn try_create_lease(&self, series_key: &str)
        -> Result<Option<ProcessingLease>, IngestError>;

    async fn delete_lease(&self, lease: &ProcessingLease) -> Result<(), IngestError>;
}

fn db_err(err: sqlx::Error) -> IngestError {
    IngestError::persistence(err)
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn find_series(&self, name: &str) -> Result<Option<SeriesRecord>, IngestError> {
        let row = sqlx::query("SELECT id, name, link FROM series WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| {
            Ok::<_, sqlx::Error>(SeriesRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                link: row.try_get("link")?,
            })
        })
        .transpose()
        .map_err(db_err)
    }

    async fn create_series(&self, series: &NewSeries) -> Result<SeriesRecord, IngestError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let details = &series.details;
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO series (
                name, link, cover_image, hosted_cover_image, alt_name, year_of_release,
                status, author, artist, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&series.name)
        .bind(&series.link)
        .bind(&details.cover_image_url)
        .bind(&series.hosted_cover_url)
        .bind(&details.alt_name)
        .bind(&details.year_of_release)
        .bind(&details.status)
        .bind(&details.author)
        .bind(&details.artist)
        .bind(&details.description)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("id"))
        .map_err(db_err)?;

        for genre in &details.genres {
            sqlx::query("INSERT INTO series_genres (series_id, name) VALUES ($1, $2)")
                .bind(id)
                .bind(genre)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(SeriesRecord {
            id,
            name: series.name.clone(),
            link: series.link.clone(),
        })
    }

    async fn list_chapter_names(&self, series_name: &str) -> Result<Vec<String>, IngestError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT c.name
              FROM chapters c
              JOIN series s ON s.id = c.series_id
             WHERE s.name = $1
            "#,
        )
        .bind(series_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| row.try_get("name"))
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_err)
    }

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<i64, IngestError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let chapter_id: i64 = sqlx::query(
            r#"
            INSERT INTO chapters (series_id, name, link, chapter_no, total_pages, ingested_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(chapter.series_id)
        .bind(&chapter.name)
        .bind(&chapter.link)
        .bind(chapter.chapter_no)
        .bind(chapter.total_pages)
        .bind(chapter.ingested_at)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("id"))
        .map_err(db_err)?;

        for page in &chapter.pages {
            sqlx::query(
                r#"
                INSERT INTO pages (chapter_id, page_no, source_url, hosted_url)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(chapter_id)
            .bind(i32::try_from(page.page_no).unwrap_or(i32::MAX))
            .bind(&page.source_url)
            .bind(&page.hosted_url)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(chapter_id)
    }

    async fn try_create_lease(
        &self,
        series_key: &str,
    ) -> Result<Option<ProcessingLease>, IngestError> {
        let row = sqlx::query(
            r#"
            INSERT INTO series_processing (series_key)
            VALUES ($1)
            ON CONFLICT (series_key) DO NOTHING
            RETURNING id, series_key, created_at
            "#,
        )
        .bind(series_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|row| {
            Ok::<_, sqlx::Error>(ProcessingLease {
                id: row.try_get("id")?,
                series_key: row.try_get("series_key")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .transpose()
        .map_err(db_err)
    }

    async fn delete_lease(&self, lease: &ProcessingLease) -> Result<(), IngestError> {
        sqlx::query("DELETE FROM series_processing WHERE id = $1")
            .bind(lease.id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredSeries {
    pub record: SeriesRecord,
    pub genres: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StoredChapter {
    pub id: i64,
    pub chapter: NewChapter,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    series: Vec<StoredSeries>,
    chapters: Vec<StoredChapter>,
    leases: Vec<ProcessingLease>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store with the same semantics as the Postgres one, used for
/// dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn series(&self) -> Vec<StoredSeries> {
        self.state.lock().await.series.clone()
    }

    pub async fn chapters(&self) -> Vec<StoredChapter> {
        self.state.lock().await.chapters.clone()
    }

    pub async fn leases(&self) -> Vec<ProcessingLease> {
        self.state.lock().await.leases.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn find_series(&self, name: &str) -> Result<Option<SeriesRecord>, IngestError> {
        let state = self.state.lock().await;
        Ok(state
            .series
            .iter()
            .find(|s| s.record.name == name)
            .map(|s| s.record.clone()))
    }

    async fn create_series(&self, series: &NewSeries) -> Result<SeriesRecord, IngestError> {
        let mut state = self.state.lock().await;
        if state.series.iter().any(|s| s.record.name == series.name) {
            return Err(IngestError::persistence(format!(
                "series {:?} already exists",
                series.name
            )));
        }
        let record = SeriesRecord {
            id: state.next_id(),
            name: series.name.clone(),
            link: series.link.clone(),
        };
        state.series.push(StoredSeries {
            record: record.clone(),
            genres: series.details.genres.clone(),
        });
        Ok(record)
    }

    async fn list_chapter_names(&self, series_name: &str) -> Result<Vec<String>, IngestError> {
        let state = self.state.lock().await;
        let Some(series) = state.series.iter().find(|s| s.record.name == series_name) else {
            return Ok(Vec::new());
        };
        let names: BTreeSet<String> = state
            .chapters
            .iter()
            .filter(|c| c.chapter.series_id == series.record.id)
            .map(|c| c.chapter.name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<i64, IngestError> {
        let mut state = self.state.lock().await;
        if !state.series.iter().any(|s| s.record.id == chapter.series_id) {
            return Err(IngestError::persistence(format!(
                "series id {} does not exist",
                chapter.series_id
            )));
        }
        let id = state.next_id();
        state.chapters.push(StoredChapter {
            id,
            chapter: chapter.clone(),
        });
        Ok(id)
    }

    async fn try_create_lease(
        &self,
        series_key: &str,
    ) -> Result<Option<ProcessingLease>, IngestError> {
        let mut state = self.state.lock().await;
        if state.leases.iter().any(|l| l.series_key == series_key) {
            return Ok(None);
        }
        let lease = ProcessingLease {
            id: state.next_id(),
            series_key: series_key.to_string(),
            created_at: Utc::now(),
        };
        state.leases.push(lease.clone());
        Ok(Some(lease))
    }

    async fn delete_lease(&self, lease: &ProcessingLease) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        state.leases.retain(|l| l.id != lease.id);
        Ok(())
    }
}
