//! Domain model: catalog items, content kinds and batch run states.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version tag mixed into every content hash. Bumping this invalidates all
/// historical delivery records, so it only moves together with a migration.
pub const HASH_VERSION: &str = "v1";

/// Closed set of content kinds the engine can deliver.
///
/// `Streaming` covers HLS/DASH/YouTube URLs that cannot be fetched as a plain
/// file; the courier answers those with a manual link instead of an upload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Video,
    Image,
    Document,
    Streaming,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Video => "video",
            ContentKind::Image => "image",
            ContentKind::Document => "document",
            ContentKind::Streaming => "streaming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(ContentKind::Video),
            "image" => Some(ContentKind::Image),
            "document" => Some(ContentKind::Document),
            "streaming" => Some(ContentKind::Streaming),
            _ => None,
        }
    }

    /// Detect the kind from a URL. Streaming markers win over file
    /// extensions so `playlist.m3u8` is never mistaken for a plain video.
    pub fn detect(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();

        if is_streaming_url(&lower) {
            return Some(ContentKind::Streaming);
        }

        const VIDEO_EXTS: &[&str] = &[
            ".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v", ".3gp", ".ts",
        ];
        const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];
        const DOC_EXTS: &[&str] = &[".pdf", ".doc", ".docx", ".txt", ".zip", ".rar"];

        if VIDEO_EXTS.iter().any(|ext| lower.contains(ext)) {
            return Some(ContentKind::Video);
        }
        if IMAGE_EXTS.iter().any(|ext| lower.contains(ext)) {
            return Some(ContentKind::Image);
        }
        if DOC_EXTS.iter().any(|ext| lower.contains(ext)) {
            return Some(ContentKind::Document);
        }
        if ["/video/", "stream", "watch"].iter().any(|kw| lower.contains(kw)) {
            return Some(ContentKind::Video);
        }
        None
    }
}

fn is_streaming_url(lower: &str) -> bool {
    lower.contains(".m3u8")
        || lower.contains(".mpd")
        || lower.contains("/manifest.")
        || lower.contains("youtube.com/watch")
        || lower.contains("youtube.com/embed/")
        || lower.contains("youtube.com/shorts/")
        || lower.contains("youtu.be/")
}

/// Video quality preference stored per batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Quality {
    #[serde(rename = "480p")]
    Q480p,
    #[serde(rename = "720p")]
    Q720p,
    #[serde(rename = "1080p")]
    Q1080p,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Q480p => "480p",
            Quality::Q720p => "720p",
            Quality::Q1080p => "1080p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "480p" => Some(Quality::Q480p),
            "720p" => Some(Quality::Q720p),
            "1080p" => Some(Quality::Q1080p),
            _ => None,
        }
    }

    /// Vertical resolution this preference targets.
    pub fn height(&self) -> u32 {
        match self {
            Quality::Q480p => 480,
            Quality::Q720p => 720,
            Quality::Q1080p => 1080,
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Q720p
    }
}

/// Lifecycle phase of a batch run. `Paused`/`Stopped` keep the cursor;
/// `Error` is resumable from the last committed index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Active,
    Paused,
    Stopped,
    Error,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Active => "active",
            RunPhase::Paused => "paused",
            RunPhase::Stopped => "stopped",
            RunPhase::Error => "error",
        }
    }
}

/// Operator signal observed by the run loop at item boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

/// One downloadable rendition of an item, as advertised by the origin.
/// The label is the origin's (`"480p"`, `"720p"`, ...), kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rendition {
    pub quality: String,
    pub url: String,
}

impl Rendition {
    /// Numeric height of the label; 0 when the label is not `<height>p`.
    pub fn height(&self) -> u32 {
        self.quality.trim().trim_end_matches('p').parse().unwrap_or(0)
    }
}

/// One normalized entry of an origin catalog.
///
/// `url` is the item's identity (the best rendition, or the raw link) and the
/// only URL that feeds the dedup hash. `renditions` are delivery-time
/// alternates; they never affect identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogItem {
    pub title: String,
    pub url: String,
    pub kind: ContentKind,
    #[serde(default)]
    pub renditions: Vec<Rendition>,
}

impl CatalogItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            kind,
            renditions: Vec::new(),
        }
    }

    pub fn with_renditions(mut self, renditions: Vec<Rendition>) -> Self {
        self.renditions = renditions;
        self
    }

    /// URL to deliver for a quality preference: the best rendition at or
    /// below the preferred height, else the smallest one on offer, else the
    /// item's own URL.
    pub fn url_for(&self, preferred: Quality) -> &str {
        let target = preferred.height();
        self.renditions
            .iter()
            .filter(|r| r.height() > 0 && r.height() <= target)
            .max_by_key(|r| r.height())
            .or_else(|| {
                self.renditions
                    .iter()
                    .filter(|r| r.height() > 0)
                    .min_by_key(|r| r.height())
            })
            .map(|r| r.url.as_str())
            .unwrap_or(&self.url)
    }

    /// Deterministic dedup key over normalized (title, url, kind).
    ///
    /// The URL is canonicalized so that rotating query strings on signed CDN
    /// links do not change the hash; see `canonical_url`.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(HASH_VERSION.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.title.trim().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_url(&self.url).as_bytes());
        hasher.update(b"\n");
        hasher.update(self.kind.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Canonical form of a content URL: scheme and host lowercased, query string
/// and fragment stripped. Unparsable input falls back to its trimmed form.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match reqwest::Url::parse(trimmed) {
        Ok(url) => {
            let mut canonical = format!("{}://", url.scheme());
            if let Some(host) = url.host_str() {
                canonical.push_str(host);
            }
            if let Some(port) = url.port() {
                canonical.push(':');
                canonical.push_str(&port.to_string());
            }
            canonical.push_str(url.path());
            canonical
        }
        Err(_) => trimmed.to_string(),
    }
}

/// An ordered catalog as fetched from the origin server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub name: String,
    pub items: Vec<CatalogItem>,
}
