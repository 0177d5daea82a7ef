//! Bounded client pool, pooled HTTP fetch, sharded image storage and the
//! watermarking image pipeline for inkvault.

use std::io::ErrorKind;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use inkvault_core::{IngestError, StoredPage};
use reqwest::header::CONTENT_TYPE;
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inkvault-storage";

/// Pixel offset of the watermark from the top-left corner of every page.
pub const WATERMARK_OFFSET: (i64, i64) = (10, 5);

pub const DEFAULT_SHARD_COUNT: u32 = 100;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("resource pool is closed")]
    Closed,
    #[error("resource pool has no idle item despite a free permit")]
    Drained,
}

/// Fixed-capacity pool of reusable handles. `acquire` waits until a handle is
/// idle; dropping the returned guard puts it back.
#[derive(Debug)]
pub struct ResourcePool<T> {
    idle: Mutex<Vec<T>>,
    permits: Semaphore,
    capacity: usize,
}

impl<T> ResourcePool<T> {
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            permits: Semaphore::new(capacity),
            idle: Mutex::new(items),
            capacity,
        }
    }

    /// Build a pool of `capacity` handles (at least one).
    pub fn from_fn<E>(
        capacity: usize,
        mut make: impl FnMut() -> Result<T, E>,
    ) -> Result<Self, E> {
        let items = (0..capacity.max(1))
            .map(|_| make())
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self::new(items))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<Pooled<'_, T>, PoolError> {
        let permit = self.permits.acquire().await.map_err(|_| PoolError::Closed)?;
        let item = self.lock_idle().pop().ok_or(PoolError::Drained)?;
        // The permit is handed back by `Pooled::drop` together with the item.
        permit.forget();
        Ok(Pooled {
            pool: self,
            item: Some(item),
        })
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, item: T) {
        self.lock_idle().push(item);
        self.permits.add_permits(1);
    }
}

#[derive(Debug)]
pub struct Pooled<'a, T> {
    pool: &'a ResourcePool<T>,
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item is only taken on drop"),
        }
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub pool_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            pool_size: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }

    /// Map into the pipeline taxonomy for a request made against `url`.
    pub fn into_ingest(self, url: &str) -> IngestError {
        if self.is_not_found() {
            IngestError::SiteUnavailable {
                url: url.to_string(),
            }
        } else {
            IngestError::download(url, self)
        }
    }
}

/// HTTP access where every request borrows a client from a shared pool, so
/// outbound concurrency never exceeds the pool capacity.
#[derive(Debug)]
pub struct PooledFetcher {
    pool: ResourcePool<reqwest::Client>,
}

impl PooledFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let pool = ResourcePool::from_fn(config.pool_size, || {
            let mut builder = reqwest::Client::builder()
                .gzip(true)
                .brotli(true)
                .timeout(config.timeout);
            if let Some(user_agent) = &config.user_agent {
                builder = builder.user_agent(user_agent.clone());
            }
            builder.build().context("building reqwest client")
        })?;
        info!(clients = pool.capacity(), "http client pool ready");
        Ok(Self { pool })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let client = self.pool.acquire().await?;
        get(&client, url).instrument(info_span!("http_fetch", url)).await
    }
}

async fn get(client: &reqwest::Client, url: &str) -> Result<FetchedResponse, FetchError> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().await?.to_vec();
    debug!(bytes = body.len(), "fetched");
    Ok(FetchedResponse {
        status,
        final_url,
        content_type,
        body,
    })
}

/// Source of raw image bytes for the pipeline.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl ImageFetcher for PooledFetcher {
    async fn fetch_image(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch(url).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
}

impl ImageKind {
    /// Decide the format from the URL path extension; anything but png/jpg is
    /// rejected before a request is made.
    pub fn from_url(url: &str) -> Result<Self, IngestError> {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".png") {
            Ok(Self::Png)
        } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
            Ok(Self::Jpeg)
        } else {
            Err(IngestError::UnsupportedFormat {
                url: url.to_string(),
            })
        }
    }

    /// Content types a server may answer with for an accepted image.
    pub fn accepts_content_type(content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return true;
        };
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        matches!(
            mime.as_str(),
            "image/png" | "image/jpeg" | "image/jpg" | "image/pjpeg" | "application/octet-stream" | ""
        )
    }

    fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// Fixed overlay composited onto every page.
#[derive(Debug, Clone)]
pub struct Watermark {
    image: RgbaImage,
    offset: (i64, i64),
}

impl Watermark {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading watermark {}", path.display()))?;
        let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .with_context(|| format!("decoding watermark {}", path.display()))?;
        Ok(Self::from_image(image.to_rgba8()))
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self {
            image,
            offset: WATERMARK_OFFSET,
        }
    }

    /// Source pixels first, then the watermark blended over them through its
    /// own alpha channel.
    pub fn apply(&self, source: &DynamicImage) -> RgbaImage {
        let mut canvas = source.to_rgba8();
        imageops::overlay(&mut canvas, &self.image, self.offset.0, self.offset.1);
        canvas
    }
}

pub fn encode_jpeg(image: DynamicImage, quality: u8) -> Result<Vec<u8>, IngestError> {
    let rgb = image.into_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|e| IngestError::Encode(e.to_string()))?;
    Ok(out)
}

/// An encoded image written under a staging name inside its bucket. It only
/// becomes visible at `final_path` after `ShardedImageStore::commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub content_id: String,
    pub relative_path: String,
    pub staged_path: PathBuf,
    pub final_path: PathBuf,
}

/// `root/<bucket>/<content_id>.jpg`, where the bucket is a hash of the random
/// content id modulo the shard count.
#[derive(Debug, Clone)]
pub struct ShardedImageStore {
    root: PathBuf,
    shard_count: u32,
}

impl ShardedImageStore {
    pub fn new(root: impl Into<PathBuf>, shard_count: u32) -> Self {
        Self {
            root: root.into(),
            shard_count: shard_count.max(1),
        }
    }

    /// Create every bucket directory up front.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        for bucket in 0..self.shard_count {
            let dir = self.root.join(bucket.to_string());
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating bucket directory {}", dir.display()))?;
        }
        info!(root = %self.root.display(), buckets = self.shard_count, "image buckets ready");
        Ok(())
    }

    /// 128 random bits rendered as 32 hex characters.
    pub fn new_content_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn bucket_for(&self, content_id: &str) -> u32 {
        let digest = Sha256::digest(content_id.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % self.shard_count
    }

    pub fn relative_path(&self, content_id: &str) -> String {
        format!("{}/{content_id}.jpg", self.bucket_for(content_id))
    }

    pub async fn stage(&self, bytes: &[u8]) -> Result<StagedImage, IngestError> {
        let content_id = Self::new_content_id();
        let relative_path = self.relative_path(&content_id);
        let final_path = self.root.join(&relative_path);
        let bucket_dir = self.root.join(self.bucket_for(&content_id).to_string());
        let staged_path = bucket_dir.join(format!(".{content_id}.jpg.staged"));

        fs::create_dir_all(&bucket_dir).await?;
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staged_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        debug!(path = %staged_path.display(), bytes = bytes.len(), "staged image");
        Ok(StagedImage {
            content_id,
            relative_path,
            staged_path,
            final_path,
        })
    }

    pub async fn commit(&self, staged: &StagedImage) -> Result<(), IngestError> {
        fs::rename(&staged.staged_path, &staged.final_path).await?;
        info!(path = %staged.final_path.display(), "written image to disk");
        Ok(())
    }

    /// Drop a staged file that will never be committed.
    pub async fn discard(&self, staged: &StagedImage) {
        remove_quietly(&staged.staged_path).await;
    }

    /// Remove a committed file whose owning record was never persisted.
    pub async fn remove(&self, staged: &StagedImage) {
        remove_quietly(&staged.final_path).await;
    }

    pub async fn store(&self, bytes: &[u8]) -> Result<StagedImage, IngestError> {
        let staged = self.stage(bytes).await?;
        if let Err(err) = self.commit(&staged).await {
            self.discard(&staged).await;
            return Err(err);
        }
        Ok(staged)
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove image file"),
    }
}

#[derive(Debug, Clone)]
pub struct ImagePipelineConfig {
    pub public_base_url: String,
    pub jpeg_quality: u8,
}

/// A watermarked page sitting in staging, plus the row it will become.
#[derive(Debug, Clone)]
pub struct ProcessedPage {
    pub page: StoredPage,
    pub staged: StagedImage,
}

/// A committed cover image. `stored` is kept so the file can be removed if
/// the series record that points at it is never written.
#[derive(Debug, Clone)]
pub struct HostedCover {
    pub hosted_url: String,
    pub stored: StagedImage,
}

pub struct ImagePipeline {
    fetcher: Arc<dyn ImageFetcher>,
    store: ShardedImageStore,
    watermark: Arc<Watermark>,
    public_base_url: String,
    jpeg_quality: u8,
}

impl ImagePipeline {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        store: ShardedImageStore,
        watermark: Watermark,
        config: ImagePipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            watermark: Arc::new(watermark),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        }
    }

    pub fn store(&self) -> &ShardedImageStore {
        &self.store
    }

    pub fn hosted_url(&self, relative_path: &str) -> String {
        format!("{}/{relative_path}", self.public_base_url)
    }

    pub async fn download(&self, url: &str) -> Result<DynamicImage, IngestError> {
        let kind = ImageKind::from_url(url)?;
        let resp = self
            .fetcher
            .fetch_image(url)
            .await
            .map_err(|e| IngestError::download(url, e))?;
        if !ImageKind::accepts_content_type(resp.content_type.as_deref()) {
            return Err(IngestError::UnsupportedFormat {
                url: url.to_string(),
            });
        }

        let owned_url = url.to_string();
        tokio::task::spawn_blocking(move || {
            image::load_from_memory_with_format(&resp.body, kind.format()).map_err(|e| {
                IngestError::Decode {
                    url: owned_url,
                    message: e.to_string(),
                }
            })
        })
        .await
        .map_err(|e| IngestError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?
    }

    /// Download, watermark, re-encode and stage one page image. Nothing is
    /// retried here.
    pub async fn process_page(
        &self,
        page_no: u32,
        source_url: &str,
    ) -> Result<ProcessedPage, IngestError> {
        let source = self.download(source_url).await?;
        let watermark = Arc::clone(&self.watermark);
        let quality = self.jpeg_quality;
        let bytes = tokio::task::spawn_blocking(move || {
            let composite = watermark.apply(&source);
            encode_jpeg(DynamicImage::ImageRgba8(composite), quality)
        })
        .await
        .map_err(|e| IngestError::Encode(e.to_string()))??;

        let staged = self.store.stage(&bytes).await?;
        Ok(ProcessedPage {
            page: StoredPage {
                page_no,
                source_url: source_url.to_string(),
                hosted_url: self.hosted_url(&staged.relative_path),
            },
            staged,
        })
    }

    /// Host a series cover as-is (re-encoded, no watermark).
    pub async fn host_cover(&self, source_url: &str) -> Result<HostedCover, IngestError> {
        let image = self.download(source_url).await?;
        let quality = self.jpeg_quality;
        let bytes = tokio::task::spawn_blocking(move || encode_jpeg(image, quality))
            .await
            .map_err(|e| IngestError::Encode(e.to_string()))??;
        let stored = self.store.store(&bytes).await?;
        Ok(HostedCover {
            hosted_url: self.hosted_url(&stored.relative_path),
            stored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{ImageBuffer, Rgba};
    use tempfile::tempdir;

    fn png_bytes(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let img: RgbaImage = ImageBuffer::from_pixel(width, height, pixel);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        out.into_inner()
    }

    struct MapFetcher {
        responses: HashMap<String, (Option<String>, Vec<u8>)>,
    }

    #[async_trait]
    impl ImageFetcher for MapFetcher {
        async fn fetch_image(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            match self.responses.get(url) {
                Some((content_type, body)) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    content_type: content_type.clone(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn pipeline(root: &Path, responses: HashMap<String, (Option<String>, Vec<u8>)>) -> ImagePipeline {
        let watermark = Watermark::from_image(ImageBuffer::from_pixel(4, 4, Rgba([255, 0, 0, 255])));
        ImagePipeline::new(
            Arc::new(MapFetcher { responses }),
            ShardedImageStore::new(root, 10),
            watermark,
            ImagePipelineConfig {
                public_base_url: "https://img.example.com/images/".to_string(),
                jpeg_quality: DEFAULT_JPEG_QUALITY,
            },
        )
    }

    #[tokio::test]
    async fn pool_never_hands_out_more_than_capacity() {
        let pool = Arc::new(ResourcePool::new(vec![1u8, 2]));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _item = pool.acquire().await.expect("acquire");
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn pool_releases_on_early_return() {
        async fn failing(pool: &ResourcePool<u8>) -> Result<(), &'static str> {
            let _item = pool.acquire().await.map_err(|_| "pool")?;
            Err("boom")
        }

        let pool = ResourcePool::new(vec![7u8]);
        assert!(failing(&pool).await.is_err());
        assert_eq!(pool.available(), 1);
        assert_eq!(*pool.acquire().await.expect("acquire"), 7);
    }

    #[test]
    fn pool_from_fn_builds_at_least_one() {
        let pool = ResourcePool::from_fn(0, || Ok::<_, ()>(0u8)).expect("pool");
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        let store = ShardedImageStore::new("/tmp/unused", 100);
        let id = "0f8fad5bd9cb469fa16570867728950e";
        let bucket = store.bucket_for(id);
        assert!(bucket < 100);
        assert_eq!(store.bucket_for(id), bucket);
        assert_eq!(store.relative_path(id), format!("{bucket}/{id}.jpg"));
    }

    #[test]
    fn content_ids_have_no_separators() {
        let id = ShardedImageStore::new_content_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn only_png_and_jpg_urls_are_accepted() {
        assert_eq!(ImageKind::from_url("http://x/a/b.png").unwrap(), ImageKind::Png);
        assert_eq!(ImageKind::from_url("http://x/a/b.JPG?w=1").unwrap(), ImageKind::Jpeg);
        assert!(matches!(
            ImageKind::from_url("http://x/a/b.gif"),
            Err(IngestError::UnsupportedFormat { .. })
        ));
        assert!(ImageKind::accepts_content_type(Some("image/jpeg; charset=binary")));
        assert!(!ImageKind::accepts_content_type(Some("text/html")));
        assert!(!ImageKind::accepts_content_type(Some("image/webp")));
    }

    #[tokio::test]
    async fn prepare_creates_every_bucket() {
        let dir = tempdir().expect("tempdir");
        let store = ShardedImageStore::new(dir.path(), 5);
        store.prepare().await.expect("prepare");
        for bucket in 0..5 {
            assert!(dir.path().join(bucket.to_string()).is_dir());
        }
    }

    #[tokio::test]
    async fn staged_images_are_invisible_until_commit() {
        let dir = tempdir().expect("tempdir");
        let store = ShardedImageStore::new(dir.path(), 3);
        let staged = store.stage(b"jpeg-bytes").await.expect("stage");
        assert!(staged.staged_path.exists());
        assert!(!staged.final_path.exists());

        store.commit(&staged).await.expect("commit");
        assert!(!staged.staged_path.exists());
        assert_eq!(std::fs::read(&staged.final_path).unwrap(), b"jpeg-bytes");

        let discarded = store.stage(b"other").await.expect("stage");
        store.discard(&discarded).await;
        assert!(!discarded.staged_path.exists());
        assert!(!discarded.final_path.exists());
    }

    #[test]
    fn watermark_is_drawn_over_source_at_offset() {
        let source = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(40, 20, Rgba([0, 0, 255, 255])));
        let mut mark: RgbaImage = ImageBuffer::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        mark.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        let composite = Watermark::from_image(mark).apply(&source);

        assert_eq!(composite.dimensions(), (40, 20));
        assert_eq!(composite.get_pixel(0, 0), &Rgba([0, 0, 255, 255]));
        assert_eq!(composite.get_pixel(11, 6), &Rgba([255, 0, 0, 255]));
        // Fully transparent watermark pixel keeps the source.
        assert_eq!(composite.get_pixel(10, 5), &Rgba([0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn process_page_stages_watermarked_jpeg() {
        let dir = tempdir().expect("tempdir");
        let url = "http://cdn.example.com/naruto/1/1.png";
        let mut responses = HashMap::new();
        responses.insert(
            url.to_string(),
            (Some("image/png".to_string()), png_bytes(32, 32, Rgba([10, 200, 10, 255]))),
        );
        let pipeline = pipeline(dir.path(), responses);

        let processed = pipeline.process_page(3, url).await.expect("process");
        assert_eq!(processed.page.page_no, 3);
        assert_eq!(processed.page.source_url, url);
        assert_eq!(
            processed.page.hosted_url,
            format!("https://img.example.com/images/{}", processed.staged.relative_path)
        );
        let bytes = std::fs::read(&processed.staged.staged_path).expect("staged bytes");
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).expect("jpeg");
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[tokio::test]
    async fn process_page_rejects_unsupported_and_broken_images() {
        let dir = tempdir().expect("tempdir");
        let mut responses = HashMap::new();
        responses.insert(
            "http://cdn.example.com/bad.png".to_string(),
            (Some("image/png".to_string()), b"not an image".to_vec()),
        );
        responses.insert(
            "http://cdn.example.com/page.jpg".to_string(),
            (Some("text/html".to_string()), b"<html></html>".to_vec()),
        );
        let pipeline = pipeline(dir.path(), responses);

        assert!(matches!(
            pipeline.process_page(1, "http://cdn.example.com/a.webp").await,
            Err(IngestError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            pipeline.process_page(1, "http://cdn.example.com/bad.png").await,
            Err(IngestError::Decode { .. })
        ));
        assert!(matches!(
            pipeline.process_page(1, "http://cdn.example.com/page.jpg").await,
            Err(IngestError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            pipeline.process_page(1, "http://cdn.example.com/missing.png").await,
            Err(IngestError::Download { .. })
        ));
    }

    #[tokio::test]
    async fn host_cover_commits_immediately() {
        let dir = tempdir().expect("tempdir");
        let url = "http://cdn.example.com/cover.png";
        let mut responses = HashMap::new();
        responses.insert(url.to_string(), (None, png_bytes(8, 8, Rgba([1, 2, 3, 255]))));
        let pipeline = pipeline(dir.path(), responses);

        let cover = pipeline.host_cover(url).await.expect("cover");
        assert_eq!(cover.stored.final_path, dir.path().join(&cover.stored.relative_path));
        let relative = cover
            .hosted_url
            .strip_prefix("https://img.example.com/images/")
            .expect("base prefix");
        assert!(dir.path().join(relative).is_file());
    }
}
