use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use inkvault_adapters::DEFAULT_SOURCE_ROOT;
use inkvault_storage::{HttpClientConfig, DEFAULT_JPEG_QUALITY, DEFAULT_SHARD_COUNT};
use tracing::info;

/// Which part of the catalog a pass walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    /// Only series named by the popularity feed.
    Top30,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "full" => Ok(Self::Full),
            "top30" => Ok(Self::Top30),
            other => bail!("unknown run mode {other:?}, expected 'full' or 'top30'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOrder {
    Forward,
    Reverse,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub image_server: String,
    pub storage_root: PathBuf,
    pub watermark_path: PathBuf,
    pub source_root: String,
    pub popular_feed_url: Option<String>,
    pub run_mode: RunMode,
    pub order: ProcessingOrder,
    pub http_pool_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub shard_count: u32,
    pub jpeg_quality: u8,
    pub catalog_retry_secs: u64,
    pub lease_wait_secs: u64,
    pub pass_interval_secs: u64,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let image_server = std::env::var("IMAGE_SERVER")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("IMAGE_SERVER must be set to the public base URL of the image host")?;

        Ok(Self {
            database_url: database_url_from_env(),
            image_server,
            storage_root: std::env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./images")),
            watermark_path: std::env::var("WATERMARK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./watermark.png")),
            source_root: std::env::var("SOURCE_ROOT")
                .unwrap_or_else(|_| DEFAULT_SOURCE_ROOT.to_string()),
            popular_feed_url: std::env::var("POPULAR_FEED_URL").ok(),
            run_mode: match std::env::var("RUN_MODE") {
                Ok(v) => v.parse()?,
                Err(_) => RunMode::Full,
            },
            order: ProcessingOrder::Forward,
            http_pool_size: env_or("HTTP_POOL_SIZE", 1)?,
            http_timeout_secs: env_or("HTTP_TIMEOUT_SECS", 120)?,
            user_agent: std::env::var("USER_AGENT")
                .unwrap_or_else(|_| "inkvault-bot/0.1".to_string()),
            shard_count: env_or("SHARD_COUNT", DEFAULT_SHARD_COUNT)?,
            jpeg_quality: env_or("JPEG_QUALITY", DEFAULT_JPEG_QUALITY)?,
            catalog_retry_secs: env_or("CATALOG_RETRY_SECS", 300)?,
            lease_wait_secs: env_or("LEASE_WAIT_SECS", 3)?,
            pass_interval_secs: env_or("PASS_INTERVAL_SECS", 0)?,
        })
    }

    /// Log the effective settings without the database credentials.
    pub fn log_redacted(&self) {
        info!(
            run_mode = ?self.run_mode,
            order = ?self.order,
            image_server = %self.image_server,
            storage_root = %self.storage_root.display(),
            source_root = %self.source_root,
            http_pool_size = self.http_pool_size,
            shard_count = self.shard_count,
            catalog_retry_secs = self.catalog_retry_secs,
            lease_wait_secs = self.lease_wait_secs,
            "ingest configuration"
        );
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            pool_size: self.http_pool_size,
        }
    }

    pub fn catalog_retry(&self) -> Duration {
        Duration::from_secs(self.catalog_retry_secs)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.lease_wait_secs)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

/// `DATABASE_URL`, or a URL assembled from the `POSTGRES_*` variables the
/// container links provide.
pub fn database_url_from_env() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return url;
    }
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "inkvault".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "inkvault".to_string());
    let host = std::env::var("POSTGRES_HOST")
        .or_else(|_| std::env::var("POSTGRES_PORT_5432_TCP_ADDR"))
        .unwrap_or_else(|_| "localhost".to_string());
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "inkvault".to_string());
    format!("postgres://{user}:{password}@{host}/{db}")
}
