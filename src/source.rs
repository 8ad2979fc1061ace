//! Content source adapter: fetches an ordered catalog from the origin server
//! and normalizes every entry to a [`CatalogItem`].

use crate::model::{Catalog, CatalogItem, ContentKind, Rendition};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("origin server unavailable: {0}")]
    OriginUnavailable(String),
    #[error("invalid batch id: {0}")]
    InvalidBatchId(String),
}

/// Fetches the catalog for a batch. The engine only ever sees this trait;
/// tests inject fakes, production uses [`HttpCatalogSource`].
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self, batch_id: &str) -> Result<Catalog, SourceError>;
}

/// Batch ids are 24-char tokens handed out by the origin server.
pub fn is_valid_batch_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Clone)]
pub struct HttpCatalogSource {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpCatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCatalogSource")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpCatalogSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SourceError::OriginUnavailable(format!("bad origin base URL: {e}")))?;
        let http = Client::builder()
            .user_agent("tg-relaybot/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Ok(Self { http, base_url })
    }

    pub fn with_base_url(base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("tg-relaybot/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    fn catalog_endpoint(&self, batch_id: &str) -> Result<Url, SourceError> {
        let mut url = self
            .base_url
            .join(&format!("api/courses/{batch_id}/classes"))
            .map_err(|e| SourceError::InvalidBatchId(e.to_string()))?;
        url.set_query(Some("populate=full"));
        Ok(url)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    async fn fetch_catalog(&self, batch_id: &str) -> Result<Catalog, SourceError> {
        if !is_valid_batch_id(batch_id) {
            return Err(SourceError::InvalidBatchId(batch_id.to_string()));
        }
        let endpoint = self.catalog_endpoint(batch_id)?;
        let resp = self
            .http
            .get(endpoint)
            .send()
            .await
            .map_err(|e| SourceError::OriginUnavailable(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                return Err(SourceError::InvalidBatchId(batch_id.to_string()));
            }
            status if !status.is_success() => {
                return Err(SourceError::OriginUnavailable(format!("HTTP {status}")));
            }
            _ => {}
        }

        let body: CatalogResp = resp
            .json()
            .await
            .map_err(|e| SourceError::OriginUnavailable(format!("bad origin payload: {e}")))?;
        Ok(normalize_catalog(body))
    }
}

// Origin API response shape. Unknown fields are ignored so the origin can
// evolve without breaking us.

#[derive(Debug, Deserialize)]
struct CatalogResp {
    #[serde(default)]
    data: CatalogData,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogData {
    #[serde(default)]
    course: CourseInfo,
    #[serde(default)]
    classes: Vec<Section>,
}

#[derive(Debug, Default, Deserialize)]
struct CourseInfo {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct Section {
    #[serde(default)]
    classes: Vec<ClassEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ClassEntry {
    #[serde(default)]
    title: String,
    #[serde(default)]
    class_link: Option<String>,
    #[serde(default, rename = "mp4Recordings")]
    mp4_recordings: Vec<Recording>,
    #[serde(default, rename = "classPdf")]
    class_pdf: Vec<Attachment>,
    #[serde(default, rename = "classTest")]
    class_test: Vec<Attachment>,
    #[serde(default)]
    banner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Recording {
    #[serde(default)]
    quality: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(default)]
    name: String,
    url: Option<String>,
}

/// Titles may not contain `:`; the origin uses it as a field separator in
/// legacy exports and some clients choke on it in captions.
pub fn clean_title(text: &str) -> String {
    let cleaned = text.replace(':', "-");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Flatten the origin response into an ordered catalog: per class, the best
/// available recording (or the raw class link), then PDFs, tests and banner.
/// All advertised recordings survive as renditions so the courier can honor
/// the batch's quality preference at delivery time.
fn normalize_catalog(resp: CatalogResp) -> Catalog {
    let name = clean_title(&resp.data.course.title);
    let mut items = Vec::new();

    for section in resp.data.classes {
        for class in section.classes {
            let title = clean_title(&class.title);

            let renditions: Vec<Rendition> = class
                .mp4_recordings
                .iter()
                .map(|r| Rendition {
                    quality: r.quality.clone(),
                    url: r.url.clone(),
                })
                .collect();
            let video_url = renditions
                .iter()
                .max_by_key(|r| r.height())
                .map(|r| r.url.clone())
                .or(class.class_link);
            if let Some(url) = video_url {
                let kind = ContentKind::detect(&url).unwrap_or(ContentKind::Video);
                items.push(CatalogItem::new(title.clone(), url, kind).with_renditions(renditions));
            }

            for attachment in class.class_pdf.iter().chain(class.class_test.iter()) {
                if let Some(url) = &attachment.url {
                    let kind = ContentKind::detect(url).unwrap_or(ContentKind::Document);
                    items.push(CatalogItem::new(clean_title(&attachment.name), url.clone(), kind));
                }
            }

            if let Some(url) = class.banner {
                let kind = ContentKind::detect(&url).unwrap_or(ContentKind::Image);
                items.push(CatalogItem::new("Banner", url, kind));
            }
        }
    }

    Catalog { name, items }
}
