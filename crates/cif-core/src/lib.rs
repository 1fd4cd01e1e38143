//! Core domain model and query derivation for the catalog image finder.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cif-core";

/// Stable identity of a catalog row across runs: `"{index}:{sku}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(index: usize, sku: &str) -> Self {
        Self(format!("{index}:{}", sku.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifying view of one catalog line. `index` is the 1-based data row number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub id: RowId,
    pub index: usize,
    pub title: String,
    pub vendor: String,
    pub sku: String,
    pub image_url: Option<String>,
}

impl CatalogRow {
    pub fn new(
        index: usize,
        title: impl Into<String>,
        vendor: impl Into<String>,
        sku: impl Into<String>,
    ) -> Self {
        let sku = sku.into();
        Self {
            id: RowId::new(index, &sku),
            index,
            title: title.into(),
            vendor: vendor.into(),
            sku,
            image_url: None,
        }
    }

    pub fn has_image(&self) -> bool {
        self.image_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

/// A single proposed image returned by one source for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub source_name: String,
    pub url: String,
    /// Alt/title text the source associated with the image.
    pub title: String,
    /// Zero-based rank in the originating source's result list.
    pub position: usize,
    /// Source-reported confidence in [0, 1].
    pub confidence_score: f64,
    pub content_type_hint: Option<String>,
}

impl Candidate {
    pub fn new(
        source_name: impl Into<String>,
        url: impl Into<String>,
        confidence_score: f64,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            url: url.into(),
            title: String::new(),
            position: 0,
            confidence_score: confidence_score.clamp(0.0, 1.0),
            content_type_hint: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    pub fn with_content_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.content_type_hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
    /// Index of the producing query in the row's query list.
    pub query_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoMatch,
    DownloadError,
    InvalidImage,
    IoError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NoMatch => "no_match",
            FailureReason::DownloadError => "download_error",
            FailureReason::InvalidImage => "invalid_image",
            FailureReason::IoError => "io_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the search and selection phases for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub row_id: RowId,
    pub chosen: Option<ScoredCandidate>,
    pub attempted_sources: BTreeSet<String>,
    pub error_reason: Option<FailureReason>,
}

impl SelectionResult {
    pub fn no_match(row_id: RowId, attempted_sources: BTreeSet<String>) -> Self {
        Self {
            row_id,
            chosen: None,
            attempted_sources,
            error_reason: Some(FailureReason::NoMatch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Pending,
    Done,
    Failed,
}

impl RowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RowStatus::Done | RowStatus::Failed)
    }

    /// Statuses only move forward: pending -> done|failed, terminal is final.
    pub fn can_transition_to(&self, _next: RowStatus) -> bool {
        !self.is_terminal()
    }
}

/// Durable per-row processing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub row_id: RowId,
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn pending(row_id: RowId) -> Self {
        Self {
            row_id,
            status: RowStatus::Pending,
            image_path: None,
            image_url: None,
            image_alt: None,
            source: None,
            sha256: None,
            reason: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn done(row_id: RowId, image_url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            status: RowStatus::Done,
            image_url: Some(image_url.into()),
            source: Some(source.into()),
            ..Self::pending(row_id)
        }
    }

    pub fn failed(row_id: RowId, reason: FailureReason, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            status: RowStatus::Failed,
            reason: Some(reason),
            detail: (!detail.is_empty()).then_some(detail),
            ..Self::pending(row_id)
        }
    }

    /// Title text of the accepted image; blank titles are not recorded.
    pub fn with_image_alt(mut self, alt: &str) -> Self {
        let alt = alt.trim();
        self.image_alt = (!alt.is_empty()).then(|| alt.to_string());
        self
    }

    pub fn with_stored_image(mut self, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self.sha256 = Some(sha256.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient data for row {row_id}: title is empty")]
pub struct InsufficientDataError {
    pub row_id: RowId,
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn join_terms(terms: &[&str]) -> String {
    terms
        .iter()
        .filter(|t| !t.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derive search strings for a row, most specific first:
/// `title+vendor`, `title+sku`, `title`, `vendor+sku`.
pub fn build_queries(row: &CatalogRow) -> Result<Vec<String>, InsufficientDataError> {
    let title = collapse_whitespace(&row.title);
    if title.is_empty() {
        return Err(InsufficientDataError {
            row_id: row.id.clone(),
        });
    }
    let vendor = collapse_whitespace(&row.vendor);
    let sku = collapse_whitespace(&row.sku);

    let ordered = [
        join_terms(&[&title, &vendor]),
        join_terms(&[&title, &sku]),
        title.clone(),
        join_terms(&[&vendor, &sku]),
    ];

    let mut queries: Vec<String> = Vec::with_capacity(ordered.len());
    for query in ordered {
        if !query.is_empty() && !queries.contains(&query) {
            queries.push(query);
        }
    }
    Ok(queries)
}
