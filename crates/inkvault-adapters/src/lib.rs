//! Source adapter contract, the MangaReader HTML adapter and the popularity
//! feed client.

use std::sync::Arc;

use async_trait::async_trait;
use inkvault_core::{Chapter, IngestError, PageRef, Series, SeriesDetails};
use inkvault_storage::PooledFetcher;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::info;
use url::Url;

pub const CRATE_NAME: &str = "inkvault-adapters";

pub const DEFAULT_SOURCE_ROOT: &str = "http://www.mangareader.net";

/// Everything the pipeline needs to know about a source site. Each call is a
/// single network request through the shared client pool.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn list_series(&self) -> Result<Vec<Series>, IngestError>;

    async fn list_chapters(&self, series: &Series) -> Result<Vec<Chapter>, IngestError>;

    async fn fetch_series_details(&self, series: &Series) -> Result<SeriesDetails, IngestError>;

    async fn list_page_refs(&self, chapter: &Chapter) -> Result<Vec<PageRef>, IngestError>;

    /// Fetch a page wrapper and pull the actual image location out of it.
    async fn resolve_page_image(&self, page: &PageRef) -> Result<String, IngestError>;
}

pub struct MangaReaderAdapter {
    root: Url,
    fetcher: Arc<PooledFetcher>,
}

impl MangaReaderAdapter {
    pub fn new(root: &str, fetcher: Arc<PooledFetcher>) -> Result<Self, IngestError> {
        let root = Url::parse(root).map_err(|e| IngestError::discovery(format!("source root {root}: {e}")))?;
        Ok(Self { root, fetcher })
    }

    async fn fetch_document(&self, url: &str) -> Result<String, IngestError> {
        let resp = self.fetcher.fetch(url).await.map_err(|e| e.into_ingest(url))?;
        Ok(resp.text())
    }
}

#[async_trait]
impl SourceAdapter for MangaReaderAdapter {
    fn source_id(&self) -> &'static str {
        "mangareader"
    }

    async fn list_series(&self) -> Result<Vec<Series>, IngestError> {
        let listing = self
            .root
            .join("/alphabetical")
            .map_err(IngestError::discovery)?;
        let html = self
            .fetch_document(listing.as_str())
            .await
            .map_err(IngestError::discovery)?;
        let series = parse_series_listing(&html, &self.root)?;
        info!(count = series.len(), "series found on source");
        Ok(series)
    }

    async fn list_chapters(&self, series: &Series) -> Result<Vec<Chapter>, IngestError> {
        let html = self
            .fetch_document(&series.link)
            .await
            .map_err(IngestError::discovery)?;
        parse_chapter_listing(&html, &self.root)
    }

    async fn fetch_series_details(&self, series: &Series) -> Result<SeriesDetails, IngestError> {
        let html = self.fetch_document(&series.link).await?;
        parse_series_details(&html, &series.link)
    }

    async fn list_page_refs(&self, chapter: &Chapter) -> Result<Vec<PageRef>, IngestError> {
        let html = self.fetch_document(&chapter.link).await?;
        let pages = parse_page_refs(&html, &self.root, &chapter.link)?;
        info!(chapter = %chapter.name, pages = pages.len(), "found pages");
        Ok(pages)
    }

    async fn resolve_page_image(&self, page: &PageRef) -> Result<String, IngestError> {
        let html = self.fetch_document(&page.link).await?;
        parse_page_image(&html, &page.link)
    }
}

fn selector(css: &str) -> Result<Selector, IngestError> {
    Selector::parse(css).map_err(|e| IngestError::discovery(format!("invalid selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<String, IngestError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
        .unwrap_or_default())
}

fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, IngestError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, IngestError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// The site answers missing pages with a bare `404 Not Found` heading and a
/// success status.
pub fn is_not_found_page(document: &Html) -> bool {
    document.root_element().text().collect::<String>().trim() == "404 Not Found"
}

/// Anchor text and resolved href for every match; anchors whose href does not
/// resolve against the root are skipped.
fn linked_names(html: &str, root: &Url, css: &str) -> Result<Vec<(String, String)>, IngestError> {
    let document = Html::parse_document(html);
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let link = root.join(href).ok()?;
            Some((a.text().collect::<String>(), link.to_string()))
        })
        .collect())
}

pub fn parse_series_listing(html: &str, root: &Url) -> Result<Vec<Series>, IngestError> {
    Ok(linked_names(html, root, "ul.series_alpha li a")?
        .into_iter()
        .map(|(name, link)| Series::new(&name, link))
        .collect())
}

pub fn parse_chapter_listing(html: &str, root: &Url) -> Result<Vec<Chapter>, IngestError> {
    Ok(linked_names(html, root, "table#listing a")?
        .into_iter()
        .map(|(name, link)| Chapter::new(&name, link))
        .collect())
}

/// Page numbers follow the position of each option in the page selector.
pub fn parse_page_refs(html: &str, root: &Url, chapter_url: &str) -> Result<Vec<PageRef>, IngestError> {
    let document = Html::parse_document(html);
    if is_not_found_page(&document) {
        return Err(IngestError::SiteUnavailable {
            url: chapter_url.to_string(),
        });
    }
    let sel = selector("select option")?;
    Ok(document
        .select(&sel)
        .enumerate()
        .filter_map(|(i, option)| {
            let value = option.value().attr("value")?;
            let link = root.join(value).ok()?;
            Some(PageRef {
                page_no: i as u32 + 1,
                link: link.to_string(),
            })
        })
        .collect())
}

pub fn parse_page_image(html: &str, page_url: &str) -> Result<String, IngestError> {
    let document = Html::parse_document(html);
    if is_not_found_page(&document) {
        return Err(IngestError::SiteUnavailable {
            url: page_url.to_string(),
        });
    }
    let src = select_first_attr(&document, "div#imgholder img#img", "src")?
        .ok_or_else(|| IngestError::not_found(page_url, "page image"))?;
    resolve_against(page_url, &src)
}

pub fn parse_series_details(html: &str, series_url: &str) -> Result<SeriesDetails, IngestError> {
    let document = Html::parse_document(html);
    if is_not_found_page(&document) {
        return Err(IngestError::SiteUnavailable {
            url: series_url.to_string(),
        });
    }
    let cover = select_first_attr(&document, "div#mangaimg img", "src")?
        .ok_or_else(|| IngestError::not_found(series_url, "series cover image"))?;

    let property = |row: usize| {
        select_first_text(
            &document,
            &format!("div#mangaproperties table tbody tr:nth-child({row}) td:nth-child(2)"),
        )
    };

    Ok(SeriesDetails {
        cover_image_url: resolve_against(series_url, &cover)?,
        alt_name: property(2)?,
        year_of_release: property(3)?,
        status: property(4)?,
        author: property(5)?,
        artist: property(6)?,
        description: select_first_text(&document, "div#readmangasum p")?,
        genres: select_all_texts(
            &document,
            "div#mangaproperties table tbody tr:nth-child(8) td:nth-child(2) span",
        )?,
    })
}

fn resolve_against(base: &str, reference: &str) -> Result<String, IngestError> {
    let resolved = match Url::parse(base) {
        Ok(base) => base.join(reference),
        Err(_) => Url::parse(reference),
    };
    resolved
        .map(String::from)
        .map_err(|_| IngestError::not_found(base, format!("valid url in {reference:?}")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PopularEntry {
    #[serde(rename = "manga_name")]
    pub series_name: String,
}

pub fn parse_popular_feed(body: &[u8]) -> Result<Vec<String>, IngestError> {
    let entries: Vec<PopularEntry> = serde_json::from_slice(body)
        .map_err(|e| IngestError::discovery(format!("popular feed: {e}")))?;
    Ok(entries.into_iter().map(|e| e.series_name).collect())
}

/// Names of the series currently worth prioritising.
#[async_trait]
pub trait PopularitySource: Send + Sync {
    async fn popular_names(&self) -> Result<Vec<String>, IngestError>;
}

/// JSON feed served by the companion API: an array of `{"manga_name": ..}`.
pub struct PopularityFeed {
    url: String,
    fetcher: Arc<PooledFetcher>,
}

impl PopularityFeed {
    pub fn new(url: impl Into<String>, fetcher: Arc<PooledFetcher>) -> Self {
        Self {
            url: url.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl PopularitySource for PopularityFeed {
    async fn popular_names(&self) -> Result<Vec<String>, IngestError> {
        let resp = self
            .fetcher
            .fetch(&self.url)
            .await
            .map_err(|e| IngestError::discovery(format!("popular feed {}: {e}", self.url)))?;
        let names = parse_popular_feed(&resp.body)?;
        info!(count = names.len(), "popular series received");
        Ok(names)
    }
}

/// Keep only series named by the feed (trimmed exact match), in catalog order.
pub fn filter_to_popular(series: Vec<Series>, popular: &[String]) -> Vec<Series> {
    series
        .into_iter()
        .filter(|s| popular.iter().any(|p| p.trim() == s.name.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Url {
        Url::parse(DEFAULT_SOURCE_ROOT).unwrap()
    }

    const SERIES_LISTING: &str = r#"
        <html><body>
          <ul class="series_alpha">
            <li><a href="/naruto">Naruto</a></li>
            <li><a href="/kapon">Kapon_(&gt;_&lt;)!</a></li>
            <li><a>No link</a></li>
          </ul>
          <ul class="other"><li><a href="/ignored">Ignored</a></li></ul>
        </body></html>"#;

    #[test]
    fn series_listing_normalizes_names_and_resolves_links() {
        let series = parse_series_listing(SERIES_LISTING, &root()).unwrap();
        assert_eq!(
            series,
            vec![
                Series::new("Naruto", "http://www.mangareader.net/naruto"),
                Series::new("Kapon", "http://www.mangareader.net/kapon"),
            ]
        );
    }

    #[test]
    fn chapter_listing_reads_listing_table() {
        let html = r#"
            <table id="listing">
              <tr><td><a href="/naruto/1">Naruto 1</a> : Uzumaki</td></tr>
              <tr><td><a href="/naruto/2">Naruto  2</a></td></tr>
            </table>"#;
        let chapters = parse_chapter_listing(html, &root()).unwrap();
        let names: Vec<_> = chapters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Naruto 1", "Naruto 2"]);
        assert_eq!(chapters[1].link, "http://www.mangareader.net/naruto/2");
    }

    #[test]
    fn page_refs_are_numbered_by_position() {
        let html = r#"
            <select id="pageMenu">
              <option value="/naruto/1">1</option>
              <option value="/naruto/1/2">2</option>
              <option value="/naruto/1/3">3</option>
            </select>"#;
        let pages = parse_page_refs(html, &root(), "http://www.mangareader.net/naruto/1").unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].page_no, 1);
        assert_eq!(pages[2].page_no, 3);
        assert_eq!(pages[2].link, "http://www.mangareader.net/naruto/1/3");
    }

    #[test]
    fn generic_not_found_page_is_site_unavailable() {
        let html = "<html><head></head><body><h1>404 Not Found</h1></body></html>";
        let url = "http://www.mangareader.net/naruto/999";
        assert!(matches!(
            parse_page_refs(html, &root(), url),
            Err(IngestError::SiteUnavailable { .. })
        ));
        assert!(matches!(parse_page_image(html, url), Err(IngestError::SiteUnavailable { .. })));
    }

    #[test]
    fn page_image_is_extracted_or_reported_missing() {
        let url = "http://www.mangareader.net/naruto/1/2";
        let html = r#"<div id="imgholder"><a href="/naruto/1/3"><img id="img" src="http://i1.example.com/naruto-1-2.jpg"></a></div>"#;
        assert_eq!(parse_page_image(html, url).unwrap(), "http://i1.example.com/naruto-1-2.jpg");

        let missing = r#"<div id="imgholder"><p>nothing here</p></div>"#;
        assert!(matches!(parse_page_image(missing, url), Err(IngestError::NotFound { .. })));
    }

    #[test]
    fn series_details_read_property_table() {
        let html = r#"
            <div id="mangaimg"><img src="http://s.example.com/cover/naruto.jpg"></div>
            <div id="mangaproperties"><table>
              <tr><td>Name:</td><td>Naruto</td></tr>
              <tr><td>Alternate Name:</td><td>ナルト</td></tr>
              <tr><td>Year of Release:</td><td>1999</td></tr>
              <tr><td>Status:</td><td>Completed</td></tr>
              <tr><td>Author:</td><td>KISHIMOTO Masashi</td></tr>
              <tr><td>Artist:</td><td>KISHIMOTO Masashi</td></tr>
              <tr><td>Reading Direction:</td><td>Right to Left</td></tr>
              <tr><td>Genre:</td><td><span>Action</span><span>Shounen</span></td></tr>
            </table></div>
            <div id="readmangasum"><h2>Read Naruto Manga Online</h2><p> A ninja story. </p></div>"#;
        let details = parse_series_details(html, "http://www.mangareader.net/naruto").unwrap();
        assert_eq!(details.cover_image_url, "http://s.example.com/cover/naruto.jpg");
        assert_eq!(details.alt_name, "ナルト");
        assert_eq!(details.year_of_release, "1999");
        assert_eq!(details.status, "Completed");
        assert_eq!(details.author, "KISHIMOTO Masashi");
        assert_eq!(details.description, "A ninja story.");
        assert_eq!(details.genres, vec!["Action", "Shounen"]);
    }

    #[test]
    fn series_details_require_cover() {
        let err = parse_series_details("<div id=\"mangaproperties\"></div>", "http://x/naruto").unwrap_err();
        assert!(matches!(err, IngestError::NotFound { .. }));
    }

    #[test]
    fn popular_feed_filters_by_trimmed_name() {
        let names = parse_popular_feed(br#"[{"manga_name":" Naruto "},{"manga_name":"Bleach"}]"#).unwrap();
        let catalog = vec![
            Series::new("Bleach", "http://x/bleach"),
            Series::new("Kapon", "http://x/kapon"),
            Series::new("Naruto", "http://x/naruto"),
        ];
        let kept: Vec<_> = filter_to_popular(catalog, &names)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(kept, vec!["Bleach", "Naruto"]);
    }

    #[test]
    fn malformed_feed_is_a_discovery_error() {
        assert!(matches!(parse_popular_feed(b"{}"), Err(IngestError::Discovery(_))));
    }
}
