use std::collections::BTreeMap;

use async_trait::async_trait;
use cif_core::Candidate;
use cif_storage::HttpFetcher;
use scraper::{ElementRef, Html};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    build_url, confidence_for, fetch_page, img_src, img_text, selector, SourceAdapter,
    SourceUnavailable, AMAZON, BING_IMAGES, GOOGLE_IMAGES, MANUFACTURER_WEBSITES, UNSPLASH,
};

const IMAGE_HINT: &str = "image/*";
const PRODUCT_KEYWORDS: [&str; 5] = ["product", "supplement", "vitamin", "capsule", "tablet"];

fn to_candidates(
    source_name: &str,
    base_confidence: f64,
    hint: Option<&str>,
    items: impl Iterator<Item = (String, String)>,
    max_results: usize,
) -> Vec<Candidate> {
    items
        .take(max_results)
        .enumerate()
        .map(|(position, (url, title))| {
            let confidence = confidence_for(&url, base_confidence);
            let candidate = Candidate::new(source_name, url, confidence)
                .with_title(title)
                .at_position(position);
            match hint {
                Some(hint) => candidate.with_content_type_hint(hint),
                None => candidate,
            }
        })
        .collect()
}

/// `...googleusercontent.com/abc=s220` -> `...=s0` (original size).
fn upscale_google(url: &str) -> String {
    if !url.contains("googleusercontent.com") {
        return url.to_string();
    }
    match url.rsplit_once('=') {
        Some((head, sizing))
            if sizing.starts_with(['s', 'w'])
                && sizing[1..].chars().next().is_some_and(|c| c.is_ascii_digit()) =>
        {
            format!("{head}=s0")
        }
        _ => url.to_string(),
    }
}

pub fn parse_google_results(
    html: &str,
    max_results: usize,
) -> Result<Vec<Candidate>, SourceUnavailable> {
    let document = Html::parse_document(html);
    let in_results = selector(GOOGLE_IMAGES, "div.islrc img")?;
    let any_img = selector(GOOGLE_IMAGES, "img")?;

    let mut imgs: Vec<ElementRef<'_>> = document.select(&in_results).collect();
    if imgs.is_empty() {
        imgs = document.select(&any_img).collect();
    }
    let items = imgs.iter().filter_map(|img| {
        let src = img_src(img).filter(|s| s.starts_with("http"))?;
        Some((upscale_google(&src), img_text(img)))
    });
    Ok(to_candidates(GOOGLE_IMAGES, 0.8, Some(IMAGE_HINT), items, max_results))
}

#[derive(Debug, Deserialize)]
struct BingMetadata {
    murl: Option<String>,
    t: Option<String>,
}

pub fn parse_bing_results(
    html: &str,
    max_results: usize,
) -> Result<Vec<Candidate>, SourceUnavailable> {
    let document = Html::parse_document(html);
    let tiles = selector(BING_IMAGES, "a.iusc")?;
    let thumbs = selector(BING_IMAGES, "div.img_cont img")?;

    let mut items: Vec<(String, String)> = Vec::new();
    for tile in document.select(&tiles) {
        let Some(raw) = tile.value().attr("m") else {
            continue;
        };
        match serde_json::from_str::<BingMetadata>(raw) {
            Ok(BingMetadata { murl: Some(url), t }) if url.starts_with("http") => {
                items.push((url, t.unwrap_or_default()));
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "skipping unparseable bing tile"),
        }
    }
    if items.is_empty() {
        items = document
            .select(&thumbs)
            .filter_map(|img| Some((img_src(&img)?, img_text(&img))))
            .filter(|(url, _)| url.starts_with("http"))
            .collect();
    }
    Ok(to_candidates(
        BING_IMAGES,
        0.7,
        Some(IMAGE_HINT),
        items.into_iter(),
        max_results,
    ))
}

fn upscale_amazon(url: &str) -> String {
    if !url.contains("media-amazon.com") {
        return url.to_string();
    }
    ["_AC_UL160_", "_AC_UL218_", "_AC_UL320_"]
        .iter()
        .fold(url.to_string(), |acc, size| acc.replace(size, "_AC_UL1500_"))
}

pub fn parse_amazon_results(
    html: &str,
    max_results: usize,
) -> Result<Vec<Candidate>, SourceUnavailable> {
    let document = Html::parse_document(html);
    let results = selector(AMAZON, r#"div[data-component-type="s-search-result"]"#)?;
    let image = selector(AMAZON, "img.s-image")?;

    let items = document.select(&results).filter_map(|result| {
        let img = result.select(&image).next()?;
        let src = img_src(&img)?;
        Some((upscale_amazon(&src), img_text(&img)))
    });
    Ok(to_candidates(AMAZON, 0.9, None, items, max_results))
}

fn upscale_unsplash(url: &str) -> String {
    if !url.contains("unsplash.com") {
        return url.to_string();
    }
    url.replace("w=400", "w=1200").replace("h=300", "h=900")
}

pub fn parse_unsplash_results(
    html: &str,
    max_results: usize,
) -> Result<Vec<Candidate>, SourceUnavailable> {
    let document = Html::parse_document(html);
    let figures = selector(UNSPLASH, "figure img")?;
    let legacy = selector(UNSPLASH, "div.MorZF img")?;

    let mut imgs: Vec<ElementRef<'_>> = document.select(&figures).collect();
    if imgs.is_empty() {
        imgs = document.select(&legacy).collect();
    }
    let items = imgs.iter().filter_map(|img| {
        let src = img_src(img).filter(|s| s.starts_with("http") && !s.contains("/profile-"))?;
        Some((upscale_unsplash(&src), img_text(img)))
    });
    Ok(to_candidates(UNSPLASH, 0.85, Some(IMAGE_HINT), items, max_results))
}

/// Product-looking images on a manufacturer's own search page.
pub fn parse_manufacturer_results(
    html: &str,
    page_url: &str,
    max_results: usize,
) -> Result<Vec<Candidate>, SourceUnavailable> {
    let base = Url::parse(page_url).map_err(|e| {
        SourceUnavailable::new(MANUFACTURER_WEBSITES, format!("bad page url {page_url}: {e}"))
    })?;
    let document = Html::parse_document(html);
    let imgs = selector(MANUFACTURER_WEBSITES, "img")?;

    let items = document.select(&imgs).filter_map(|img| {
        let text = img_text(&img);
        let lower = text.to_ascii_lowercase();
        if !PRODUCT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return None;
        }
        let src = img_src(&img)?;
        let absolute = base.join(&src).ok()?;
        Some((absolute.to_string(), text))
    });
    Ok(to_candidates(MANUFACTURER_WEBSITES, 0.95, None, items, max_results))
}

#[derive(Debug, Clone)]
pub struct GoogleImagesAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl GoogleImagesAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, "https://www.google.com")
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for GoogleImagesAdapter {
    fn name(&self) -> &'static str {
        GOOGLE_IMAGES
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable> {
        let url = build_url(
            GOOGLE_IMAGES,
            &self.base_url,
            "/search",
            &[("q", query), ("tbm", "isch"), ("tbs", "isz:l")],
        )?;
        let body = fetch_page(&self.http, GOOGLE_IMAGES, &url).await?;
        parse_google_results(&body, max_results)
    }
}

#[derive(Debug, Clone)]
pub struct BingImagesAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl BingImagesAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, "https://www.bing.com")
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for BingImagesAdapter {
    fn name(&self) -> &'static str {
        BING_IMAGES
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable> {
        let url = build_url(BING_IMAGES, &self.base_url, "/images/search", &[("q", query)])?;
        let body = fetch_page(&self.http, BING_IMAGES, &url).await?;
        parse_bing_results(&body, max_results)
    }
}

#[derive(Debug, Clone)]
pub struct AmazonAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl AmazonAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, "https://www.amazon.com")
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for AmazonAdapter {
    fn name(&self) -> &'static str {
        AMAZON
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable> {
        let url = build_url(AMAZON, &self.base_url, "/s", &[("k", query)])?;
        let body = fetch_page(&self.http, AMAZON, &url).await?;
        parse_amazon_results(&body, max_results)
    }
}

#[derive(Debug, Clone)]
pub struct UnsplashAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl UnsplashAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, "https://unsplash.com")
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for UnsplashAdapter {
    fn name(&self) -> &'static str {
        UNSPLASH
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable> {
        let mut url = build_url(UNSPLASH, &self.base_url, "/s/photos/", &[])?;
        url.path_segments_mut()
            .map_err(|_| SourceUnavailable::new(UNSPLASH, "base url cannot carry a path"))?
            .pop_if_empty()
            .push(query);
        let body = fetch_page(&self.http, UNSPLASH, &url).await?;
        parse_unsplash_results(&body, max_results)
    }
}

const MANUFACTURER_DOMAINS: &[(&str, &[&str])] = &[
    ("AOR", &["aor.ca", "aor.health"]),
    ("ATP", &["atpscience.com", "atpnutrition.com"]),
    ("AXEL KRAFT", &["axelkraft.com", "basicare.com"]),
    ("NATURE'S SUNSHINE", &["naturessunshine.com", "nsp.com"]),
    ("NOW", &["nowfoods.com", "nowsupplements.com"]),
    ("THORNE", &["thorne.com", "thorne.co"]),
    ("GARDEN OF LIFE", &["gardenoflife.com"]),
    ("NATURE'S WAY", &["naturesway.com"]),
    ("SOLGAR", &["solgar.com"]),
    ("JARROW", &["jarrow.com"]),
];

fn default_manufacturer_sites() -> BTreeMap<String, Vec<String>> {
    MANUFACTURER_DOMAINS
        .iter()
        .map(|(vendor, domains)| {
            (
                vendor.to_string(),
                domains.iter().map(|d| format!("https://www.{d}")).collect(),
            )
        })
        .collect()
}

/// Searches the vendor's own websites. The vendor is recognised from the
/// query's tokens, so queries without a known vendor name return nothing.
#[derive(Debug, Clone)]
pub struct ManufacturerSitesAdapter {
    http: HttpFetcher,
    sites: BTreeMap<String, Vec<String>>,
}

impl ManufacturerSitesAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_sites(http, default_manufacturer_sites())
    }

    /// `sites` maps an upper-case vendor name to site base URLs.
    pub fn with_sites(http: HttpFetcher, sites: BTreeMap<String, Vec<String>>) -> Self {
        Self { http, sites }
    }

    pub fn sites_for_query(&self, query: &str) -> Option<(&str, &[String])> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_uppercase())
            .collect();
        self.sites
            .iter()
            .filter(|(vendor, _)| {
                vendor
                    .split_whitespace()
                    .all(|v| tokens.iter().any(|t| t == v))
            })
            .max_by_key(|(vendor, _)| vendor.split_whitespace().count())
            .map(|(vendor, sites)| (vendor.as_str(), sites.as_slice()))
    }
}

#[async_trait]
impl SourceAdapter for ManufacturerSitesAdapter {
    fn name(&self) -> &'static str {
        MANUFACTURER_WEBSITES
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable> {
        let Some((vendor, sites)) = self.sites_for_query(query) else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        let mut failures = Vec::new();
        for site in sites {
            let url = build_url(MANUFACTURER_WEBSITES, site, "/search", &[("q", query)])?;
            match fetch_page(&self.http, MANUFACTURER_WEBSITES, &url).await {
                Ok(body) => found.extend(parse_manufacturer_results(
                    &body,
                    url.as_str(),
                    max_results,
                )?),
                Err(err) => {
                    debug!(vendor, site = %site, error = %err, "manufacturer site failed");
                    failures.push(err.reason);
                }
            }
        }

        if !sites.is_empty() && failures.len() == sites.len() {
            return Err(SourceUnavailable::new(
                MANUFACTURER_WEBSITES,
                failures.join("; "),
            ));
        }
        Ok(found
            .into_iter()
            .take(max_results)
            .enumerate()
            .map(|(position, c)| c.at_position(position))
            .collect())
    }
}
