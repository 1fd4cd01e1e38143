use std::collections::HashSet;

use cif_core::{Candidate, ScoredCandidate};
use strsim::jaro_winkler;
use url::Url;

use crate::config::ScoringWeights;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];
const FORMAT_HINTS: [&str; 3] = ["fm=", "format=", "auto=format"];
/// Similarity used when a source gave no text for the image.
const UNKNOWN_SIMILARITY: f64 = 0.5;

/// A candidate as it came back from the search phase.
#[derive(Debug, Clone)]
pub struct FoundCandidate {
    pub query_index: usize,
    pub candidate: Candidate,
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// http(s) URL that names an image by extension, carries a format hint in
/// its query, or was reported with an `image/*` content type.
pub fn looks_like_image_url(candidate: &Candidate) -> bool {
    let Ok(url) = Url::parse(candidate.url.trim()) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return false;
    }
    let path = url.path().to_ascii_lowercase();
    let has_extension = path
        .rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext));
    let has_format_hint = url
        .query()
        .map(str::to_ascii_lowercase)
        .is_some_and(|q| FORMAT_HINTS.iter().any(|hint| q.contains(hint)));
    let has_type_hint = candidate
        .content_type_hint
        .as_deref()
        .is_some_and(|hint| hint.trim().to_ascii_lowercase().starts_with("image/"));
    has_extension || has_format_hint || has_type_hint
}

pub struct CandidateScorer {
    priority: Vec<String>,
    weights: ScoringWeights,
    threshold: f64,
}

impl CandidateScorer {
    /// `priority` lists source names highest first.
    pub fn new(priority: Vec<String>, weights: ScoringWeights, threshold: f64) -> Self {
        Self {
            priority,
            weights: weights.normalized(),
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn priority_rank(&self, source: &str) -> usize {
        self.priority
            .iter()
            .position(|p| p == source)
            .unwrap_or(self.priority.len())
    }

    /// 1.0 for the first-ranked source, linearly down; unranked sources get 0.
    pub fn priority_score(&self, source: &str) -> f64 {
        let n = self.priority.len();
        if n == 0 {
            return 0.0;
        }
        let rank = self.priority_rank(source);
        (n.saturating_sub(rank)) as f64 / n as f64
    }

    pub fn similarity(query: &str, title: &str) -> f64 {
        let title = normalize_text(title);
        if title.is_empty() {
            return UNKNOWN_SIMILARITY;
        }
        jaro_winkler(&normalize_text(query), &title)
    }

    pub fn score(&self, query: &str, candidate: &Candidate) -> f64 {
        let w = &self.weights;
        let position = 1.0 / (1.0 + candidate.position as f64);
        let score = w.priority * self.priority_score(&candidate.source_name)
            + w.similarity * Self::similarity(query, &candidate.title)
            + w.position * position
            + w.confidence * candidate.confidence_score.clamp(0.0, 1.0);
        score.clamp(0.0, 1.0)
    }

    /// Valid, de-duplicated candidates, best first.
    pub fn rank(&self, queries: &[String], found: Vec<FoundCandidate>) -> Vec<ScoredCandidate> {
        let mut seen = HashSet::new();
        let mut scored: Vec<ScoredCandidate> = found
            .into_iter()
            .filter(|f| looks_like_image_url(&f.candidate))
            .filter(|f| seen.insert(f.candidate.url.trim().to_string()))
            .map(|f| {
                let query = queries.get(f.query_index).map(String::as_str).unwrap_or("");
                ScoredCandidate {
                    score: self.score(query, &f.candidate),
                    query_index: f.query_index,
                    candidate: f.candidate,
                }
            })
            .collect();

        // stable: equal keys keep encounter order (query, then source, then position)
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    self.priority_rank(&a.candidate.source_name)
                        .cmp(&self.priority_rank(&b.candidate.source_name))
                })
                .then_with(|| a.query_index.cmp(&b.query_index))
        });
        scored
    }

    /// Best candidate if it clears the acceptance threshold; never a forced pick.
    pub fn select(&self, queries: &[String], found: Vec<FoundCandidate>) -> Option<ScoredCandidate> {
        self.rank(queries, found)
            .into_iter()
            .next()
            .filter(|best| best.score >= self.threshold)
    }
}
