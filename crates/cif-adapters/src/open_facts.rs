use async_trait::async_trait;
use cif_core::Candidate;
use cif_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{build_url, confidence_for, fetch_page, SourceAdapter, SourceUnavailable, OPEN_FACTS};

const PREFERRED_IMAGE_KEYS: [&str; 7] = [
    "image_front_url",
    "image_url",
    "image_pack_url",
    "image_ingredients_url",
    "image_nutrition_url",
    "image_small_url",
    "image_thumb_url",
];

fn non_empty_str(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Best image of an Open Facts product: the flat `image_*_url` fields first,
/// then `selected_images.{front,ingredients,nutrition}.{display,small,thumb}`
/// preferring the `en` rendition.
pub fn pick_best_image_url(product: &JsonValue) -> Option<String> {
    if let Some(url) = PREFERRED_IMAGE_KEYS
        .iter()
        .find_map(|key| non_empty_str(product.get(*key)))
    {
        return Some(url);
    }

    let selected = product.get("selected_images")?.as_object()?;
    for section in ["front", "ingredients", "nutrition"] {
        let Some(section) = selected.get(section).and_then(JsonValue::as_object) else {
            continue;
        };
        for size in ["display", "small", "thumb"] {
            let Some(by_lang) = section.get(size).and_then(JsonValue::as_object) else {
                continue;
            };
            if let Some(url) = non_empty_str(by_lang.get("en")) {
                return Some(url);
            }
            // serde_json maps iterate in key order
            if let Some(url) = by_lang.values().find_map(|v| non_empty_str(Some(v))) {
                return Some(url);
            }
        }
    }
    None
}

fn product_title(product: &JsonValue) -> String {
    let name = ["product_name", "product_name_en", "generic_name"]
        .iter()
        .find_map(|key| non_empty_str(product.get(*key)));
    let brands = non_empty_str(product.get("brands"));
    match (brands, name) {
        (Some(b), Some(n)) => format!("{b} {n}"),
        (Some(b), None) => b,
        (None, Some(n)) => n,
        (None, None) => String::new(),
    }
}

pub fn parse_open_facts_results(
    body: &str,
    max_results: usize,
) -> Result<Vec<Candidate>, SourceUnavailable> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| SourceUnavailable::new(OPEN_FACTS, format!("invalid search JSON: {e}")))?;
    let Some(products) = value.get("products").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    Ok(products
        .iter()
        .filter_map(|p| Some((pick_best_image_url(p)?, product_title(p))))
        .take(max_results)
        .enumerate()
        .map(|(position, (url, title))| {
            let confidence = confidence_for(&url, 0.9);
            Candidate::new(OPEN_FACTS, url, confidence)
                .with_title(title)
                .at_position(position)
        })
        .collect())
}

/// Open Food/Beauty/Pet Facts full-text search, first host with results wins.
#[derive(Debug, Clone)]
pub struct OpenFactsAdapter {
    http: HttpFetcher,
    hosts: Vec<String>,
}

impl OpenFactsAdapter {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_hosts(
            http,
            vec![
                "https://world.openfoodfacts.org".to_string(),
                "https://world.openbeautyfacts.org".to_string(),
                "https://world.openpetfoodfacts.org".to_string(),
            ],
        )
    }

    pub fn with_hosts(http: HttpFetcher, hosts: Vec<String>) -> Self {
        Self { http, hosts }
    }
}

#[async_trait]
impl SourceAdapter for OpenFactsAdapter {
    fn name(&self) -> &'static str {
        OPEN_FACTS
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SourceUnavailable> {
        let page_size = max_results.to_string();
        let mut last_error = None;
        let mut answered = false;

        for host in &self.hosts {
            let url = build_url(
                OPEN_FACTS,
                host,
                "/cgi/search.pl",
                &[
                    ("search_terms", query),
                    ("search_simple", "1"),
                    ("action", "process"),
                    ("json", "1"),
                    ("page_size", &page_size),
                ],
            )?;
            let parsed = match fetch_page(&self.http, OPEN_FACTS, &url).await {
                Ok(body) => parse_open_facts_results(&body, max_results),
                Err(err) => Err(err),
            };
            match parsed {
                Ok(found) if !found.is_empty() => return Ok(found),
                Ok(_) => answered = true,
                Err(err) => {
                    debug!(host = %host, error = %err, "open facts host failed");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if !answered => Err(err),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_image_fields_win_in_preference_order() {
        let product = json!({
            "image_small_url": "https://images.openfoodfacts.org/small.jpg",
            "image_front_url": "  ",
            "image_url": "https://images.openfoodfacts.org/full.jpg"
        });
        assert_eq!(
            pick_best_image_url(&product).as_deref(),
            Some("https://images.openfoodfacts.org/full.jpg")
        );
    }

    #[test]
    fn selected_images_prefer_english_then_any_language() {
        let product = json!({
            "selected_images": {
                "front": {
                    "display": { "fr": "https://img/fr.jpg", "en": "https://img/en.jpg" }
                }
            }
        });
        assert_eq!(pick_best_image_url(&product).as_deref(), Some("https://img/en.jpg"));

        let product = json!({
            "selected_images": {
                "ingredients": { "small": { "fr": "https://img/fr-small.jpg" } }
            }
        });
        assert_eq!(
            pick_best_image_url(&product).as_deref(),
            Some("https://img/fr-small.jpg")
        );
        assert!(pick_best_image_url(&json!({})).is_none());
    }

    #[test]
    fn search_json_becomes_ranked_candidates() {
        let body = json!({
            "count": 3,
            "products": [
                { "product_name": "Cortisol Adapt", "brands": "AOR",
                  "image_front_url": "https://images.openfoodfacts.org/1/front_en.400.jpg" },
                { "product_name": "No picture" },
                { "product_name": "Adrenal", "image_url": "https://images.openfoodfacts.org/2.jpg" }
            ]
        })
        .to_string();
        let results = parse_open_facts_results(&body, 5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "AOR Cortisol Adapt");
        assert_eq!(results[1].position, 1);

        assert!(parse_open_facts_results("<html>", 5).is_err());
        assert!(parse_open_facts_results("{}", 5).unwrap().is_empty());
    }
}
