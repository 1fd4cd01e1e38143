//! Search source contract and the image search adapters behind it.

use async_trait::async_trait;
use cif_core::Candidate;
use cif_storage::HttpFetcher;
use scraper::{ElementRef, Selector};
use thiserror::Error;
use url::Url;

mod html;
mod open_facts;

pub use html::{
    parse_amazon_results, parse_bing_results, parse_google_results, parse_manufacturer_results,
    parse_unsplash_results, AmazonAdapter, BingImagesAdapter, GoogleImagesAdapter,
    ManufacturerSitesAdapter, UnsplashAdapter,
};
pub use open_facts::{parse_open_facts_results, pick_best_image_url, OpenFactsAdapter};

pub const CRATE_NAME: &str = "cif-adapters";

pub const GOOGLE_IMAGES: &str = "google_images";
pub const BING_IMAGES: &str = "bing_images";
pub const AMAZON: &str = "amazon";
pub const UNSPLASH: &str = "unsplash";
pub const MANUFACTURER_WEBSITES: &str = "manufacturer_websites";
pub const OPEN_FACTS: &str = "open_facts";

pub const KNOWN_SOURCES: [&str; 6] = [
    MANUFACTURER_WEBSITES,
    AMAZON,
    GOOGLE_IMAGES,
    BING_IMAGES,
    UNSPLASH,
    OPEN_FACTS,
];

/// Transport-level failure of one source: timeout, non-2xx, malformed response.
/// An empty result list is not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source {source_name} unavailable: {reason}")]
pub struct SourceUnavailable {
    pub source_name: String,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable>;
}

const HIGH_RES_PATTERNS: [&str; 17] = [
    "_ac_ul1500_",
    "_ac_ul2000_",
    "_ac_ul3000_",
    "large",
    "high",
    "hd",
    "4k",
    "ultra",
    "w=800",
    "w=1000",
    "w=1200",
    "w=1500",
    "h=800",
    "h=1000",
    "h=1200",
    "h=1500",
    "=s0",
];

const HIGH_RES_BOOST: f64 = 0.05;

pub fn is_high_resolution(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    HIGH_RES_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Source base confidence, nudged up for URLs that advertise a large rendition.
pub(crate) fn confidence_for(url: &str, base: f64) -> f64 {
    if is_high_resolution(url) {
        (base + HIGH_RES_BOOST).min(1.0)
    } else {
        base
    }
}

pub(crate) fn build_url(
    source_name: &str,
    base: &str,
    path: &str,
    params: &[(&str, &str)],
) -> Result<Url, SourceUnavailable> {
    let mut url = Url::parse(base)
        .and_then(|b| b.join(path))
        .map_err(|e| SourceUnavailable::new(source_name, format!("bad url {base}{path}: {e}")))?;
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params.iter());
    }
    Ok(url)
}

pub(crate) async fn fetch_page(
    http: &HttpFetcher,
    source_name: &str,
    url: &Url,
) -> Result<String, SourceUnavailable> {
    http.fetch_text(source_name, url.as_str())
        .await
        .map_err(|e| SourceUnavailable::new(source_name, e.to_string()))
}

pub(crate) fn selector(source_name: &str, css: &str) -> Result<Selector, SourceUnavailable> {
    Selector::parse(css)
        .map_err(|e| SourceUnavailable::new(source_name, format!("invalid selector {css}: {e}")))
}

pub(crate) fn img_src(img: &ElementRef<'_>) -> Option<String> {
    ["src", "data-src"]
        .iter()
        .filter_map(|attr| img.value().attr(attr))
        .map(str::trim)
        .find(|s| !s.is_empty() && !s.starts_with("data:"))
        .map(ToString::to_string)
}

pub(crate) fn img_text(img: &ElementRef<'_>) -> String {
    ["alt", "title"]
        .iter()
        .filter_map(|attr| img.value().attr(attr))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Build the adapter registered under `name`, sharing one HTTP client.
pub fn adapter_for_source(name: &str, http: &HttpFetcher) -> Option<Box<dyn SourceAdapter>> {
    match name {
        GOOGLE_IMAGES => Some(Box::new(GoogleImagesAdapter::new(http.clone()))),
        BING_IMAGES => Some(Box::new(BingImagesAdapter::new(http.clone()))),
        AMAZON => Some(Box::new(AmazonAdapter::new(http.clone()))),
        UNSPLASH => Some(Box::new(UnsplashAdapter::new(http.clone()))),
        MANUFACTURER_WEBSITES => Some(Box::new(ManufacturerSitesAdapter::new(http.clone()))),
        OPEN_FACTS => Some(Box::new(OpenFactsAdapter::new(http.clone()))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cif_storage::HttpClientConfig;

    #[test]
    fn every_known_source_has_an_adapter() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        for name in KNOWN_SOURCES {
            let adapter = adapter_for_source(name, &http).expect(name);
            assert_eq!(adapter.name(), name);
        }
        assert!(adapter_for_source("altavista", &http).is_none());
    }

    #[test]
    fn high_resolution_urls_get_a_capped_boost() {
        assert!(is_high_resolution("https://m.media-amazon.com/images/I/a._AC_UL1500_.jpg"));
        assert!(!is_high_resolution("https://cdn.example.com/p/thumb.jpg"));
        assert!((confidence_for("https://x/y.jpg?w=1200", 0.9) - 0.95).abs() < 1e-9);
        assert_eq!(confidence_for("https://x/y.jpg?w=1200", 0.98), 1.0);
        assert_eq!(confidence_for("https://x/y.jpg", 0.7), 0.7);
    }

    #[test]
    fn build_url_encodes_query_params() {
        let url = build_url(
            GOOGLE_IMAGES,
            "https://www.google.com",
            "/search",
            &[("q", "AOR Cortisol & more"), ("tbm", "isch")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.google.com/search?q=AOR+Cortisol+%26+more&tbm=isch"
        );
    }
}
