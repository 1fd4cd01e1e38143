//! Batch orchestration: search, select, fetch and checkpoint each catalog row.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cif_adapters::{adapter_for_source, SourceAdapter};
use cif_core::{
    build_queries, Candidate, CatalogRow, CheckpointRecord, FailureReason, RowStatus,
    SelectionResult,
};
use cif_storage::{
    backup_catalog, BackoffPolicy, Catalog, CatalogError, CheckpointError, CheckpointStore,
    HttpFetcher, ImageFetchError, ImageFetcher, ImageStore, JsonlCheckpointStore, StoredImage,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod scoring;

pub use config::{ConfigError, FinderConfig, ScoringWeights, DEFAULT_CONFIG_FILE};
pub use scoring::{looks_like_image_url, normalize_text, CandidateScorer, FoundCandidate};

pub const CRATE_NAME: &str = "cif-batch";

/// Errors that stop a run. Row-level failures are recorded, not returned.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("persistent filesystem failure on row {row_id}: {source}")]
    PersistentIo {
        row_id: String,
        #[source]
        source: ImageFetchError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Skipped,
    Done,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_rows: usize,
    pub processed: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Rows beyond `limit`, passed through untouched.
    pub not_attempted: usize,
    pub flushes: usize,
    pub output_file: String,
    pub backup_file: Option<String>,
    pub checkpoint_file: Option<String>,
}

impl BatchSummary {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Done => {
                self.processed += 1;
                self.done += 1;
            }
            RowOutcome::Failed(_) => {
                self.processed += 1;
                self.failed += 1;
            }
        }
    }
}

/// Terminal result of one processed row, before it is checkpointed.
struct RowResult {
    record: CheckpointRecord,
    halt: Option<ImageFetchError>,
}

impl RowResult {
    fn record(record: CheckpointRecord) -> Self {
        Self { record, halt: None }
    }
}

/// Keeps source requests at least `delay` apart for the whole run, across
/// row boundaries.
struct RequestPacer {
    delay: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        if self.delay.is_zero() {
            return;
        }
        let send_at = {
            let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let send_at = next_slot.map_or(now, |slot| slot.max(now));
            *next_slot = Some(send_at + self.delay);
            send_at
        };
        tokio::time::sleep_until(send_at).await;
    }
}

pub struct BatchOrchestrator {
    config: FinderConfig,
    adapters: Vec<Box<dyn SourceAdapter>>,
    scorer: CandidateScorer,
    fetcher: Option<ImageFetcher>,
    backoff: BackoffPolicy,
    pacer: RequestPacer,
}

impl BatchOrchestrator {
    /// Wire the enabled sources from the registry, in priority order.
    pub fn new(config: FinderConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let adapters = config
            .enabled_sources()
            .iter()
            .map(|name| {
                adapter_for_source(name, &http)
                    .with_context(|| format!("no adapter registered for {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_adapters(config, adapters, http))
    }

    pub fn with_adapters(
        config: FinderConfig,
        adapters: Vec<Box<dyn SourceAdapter>>,
        http: HttpFetcher,
    ) -> Self {
        let priority = adapters.iter().map(|a| a.name().to_string()).collect();
        let scorer = CandidateScorer::new(priority, config.scoring, config.acceptance_threshold);
        let fetcher = config.save_images_locally.then(|| {
            ImageFetcher::new(
                http,
                ImageStore::new(config.images_folder.clone()),
                config.image_rules(),
            )
        });
        Self {
            backoff: config.backoff(),
            pacer: RequestPacer::new(config.request_delay()),
            config,
            adapters,
            scorer,
            fetcher,
        }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// Process every row of `catalog` not already terminal in `checkpoints`,
    /// flushing the catalog to `output` periodically and at the end.
    pub async fn run(
        &self,
        catalog: &mut Catalog,
        checkpoints: &mut dyn CheckpointStore,
        output: &Path,
    ) -> Result<BatchSummary, BatchError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let rows = catalog.rows();
        let total = rows.len();
        let attempt_limit = self.config.limit.unwrap_or(total).min(total);
        let existing = checkpoints.load_all();

        let mut summary = BatchSummary {
            run_id,
            started_at,
            finished_at: started_at,
            total_rows: total,
            processed: 0,
            done: 0,
            failed: 0,
            skipped: 0,
            not_attempted: total - attempt_limit,
            flushes: 0,
            output_file: output.display().to_string(),
            backup_file: None,
            checkpoint_file: None,
        };

        info!(%run_id, total, limit = attempt_limit, resumed = existing.len(), "batch started");

        for row in rows.iter().take(attempt_limit) {
            if let Some(record) = existing.get(&row.id).filter(|r| r.status.is_terminal()) {
                apply_record(catalog, row.index, record);
                debug!(row = row.index, id = %row.id, status = ?record.status, "skipping checkpointed row");
                summary.record(RowOutcome::Skipped);
                continue;
            }
            if row.has_image() {
                debug!(row = row.index, "skipping row with image already set");
                summary.record(RowOutcome::Skipped);
                continue;
            }

            let span = info_span!("row", index = row.index, total, sku = %row.sku);
            let result = self.process_row(row, checkpoints).instrument(span).await?;

            let outcome = match result.record.status {
                RowStatus::Failed => {
                    RowOutcome::Failed(result.record.reason.unwrap_or(FailureReason::NoMatch))
                }
                _ => RowOutcome::Done,
            };
            apply_record(catalog, row.index, &result.record);
            checkpoints.put(result.record)?;
            summary.record(outcome);

            if let Some(err) = result.halt {
                if let Err(flush_err) = catalog.write_atomic(output) {
                    warn!(error = %flush_err, "flush after persistent io failure failed");
                }
                return Err(BatchError::PersistentIo {
                    row_id: row.id.to_string(),
                    source: err,
                });
            }

            if summary.processed % self.config.checkpoint_interval == 0 {
                catalog.write_atomic(output)?;
                summary.flushes += 1;
                info!(processed = summary.processed, "flushed catalog");
            }
        }

        catalog.write_atomic(output)?;
        summary.flushes += 1;
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            processed = summary.processed,
            done = summary.done,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch finished"
        );
        Ok(summary)
    }

    async fn process_row(
        &self,
        row: &CatalogRow,
        checkpoints: &mut dyn CheckpointStore,
    ) -> Result<RowResult, BatchError> {
        checkpoints.put(CheckpointRecord::pending(row.id.clone()))?;

        let queries = match build_queries(row) {
            Ok(queries) => queries,
            Err(err) => {
                info!(error = %err, "row has no title");
                return Ok(RowResult::record(CheckpointRecord::failed(
                    row.id.clone(),
                    FailureReason::NoMatch,
                    "insufficient data",
                )));
            }
        };

        let selection = self.search_and_select(row, &queries).await;
        let Some(chosen) = selection.chosen else {
            info!(sources = ?selection.attempted_sources, "no candidate accepted");
            return Ok(RowResult::record(CheckpointRecord::failed(
                row.id.clone(),
                FailureReason::NoMatch,
                format!(
                    "no candidate at or above {:.2} from {} source(s)",
                    self.scorer.threshold(),
                    selection.attempted_sources.len()
                ),
            )));
        };
        let candidate = chosen.candidate;
        info!(
            source = %candidate.source_name,
            url = %candidate.url,
            score = chosen.score,
            "candidate selected"
        );

        let Some(fetcher) = &self.fetcher else {
            return Ok(RowResult::record(
                CheckpointRecord::done(row.id.clone(), candidate.url, candidate.source_name)
                    .with_image_alt(&candidate.title),
            ));
        };

        match self.fetch_with_retry(fetcher, &candidate, row).await {
            Ok(stored) => Ok(RowResult::record(
                CheckpointRecord::done(row.id.clone(), candidate.url, candidate.source_name)
                    .with_image_alt(&candidate.title)
                    .with_stored_image(stored.path.display().to_string(), stored.sha256),
            )),
            Err(err) => {
                warn!(error = %err, "image fetch failed");
                let (reason, halt) = match &err {
                    ImageFetchError::Download { .. } => (FailureReason::DownloadError, false),
                    ImageFetchError::InvalidImage { .. } => (FailureReason::InvalidImage, false),
                    ImageFetchError::Io { .. } => (FailureReason::IoError, true),
                };
                let record = CheckpointRecord::failed(row.id.clone(), reason, err.to_string());
                Ok(RowResult {
                    record,
                    halt: halt.then_some(err),
                })
            }
        }
    }

    /// Query every source for every query, paced by the configured delay. A
    /// source that fails is skipped for the rest of the row.
    pub async fn search_and_select(&self, row: &CatalogRow, queries: &[String]) -> SelectionResult {
        let max_results = self.config.max_results_per_source;
        let search_timeout = self.config.request_timeout() * 2;

        let mut attempted = BTreeSet::new();
        let mut unavailable = BTreeSet::new();
        let mut found = Vec::new();

        for (query_index, query) in queries.iter().enumerate() {
            for adapter in &self.adapters {
                let name = adapter.name();
                if unavailable.contains(name) {
                    continue;
                }
                self.pacer.wait_turn().await;
                attempted.insert(name.to_string());

                match tokio::time::timeout(search_timeout, adapter.search(query, max_results)).await
                {
                    Ok(Ok(candidates)) => {
                        debug!(source = name, query = %query, count = candidates.len(), "search results");
                        found.extend(candidates.into_iter().map(|candidate| FoundCandidate {
                            query_index,
                            candidate,
                        }));
                    }
                    Ok(Err(err)) => {
                        warn!(source = name, error = %err, "source unavailable for this row");
                        unavailable.insert(name);
                    }
                    Err(_) => {
                        warn!(source = name, timeout = ?search_timeout, "source timed out for this row");
                        unavailable.insert(name);
                    }
                }
            }
        }

        match self.scorer.select(queries, found) {
            Some(chosen) => SelectionResult {
                row_id: row.id.clone(),
                chosen: Some(chosen),
                attempted_sources: attempted,
                error_reason: None,
            },
            None => SelectionResult::no_match(row.id.clone(), attempted),
        }
    }

    /// Retryable downloads up to the attempt budget with backoff; transient
    /// filesystem errors once; anything else fails immediately.
    async fn fetch_with_retry(
        &self,
        fetcher: &ImageFetcher,
        candidate: &Candidate,
        row: &CatalogRow,
    ) -> Result<StoredImage, ImageFetchError> {
        let mut attempt = 0usize;
        let mut io_retried = false;
        loop {
            attempt += 1;
            match fetcher.fetch(candidate, row).await {
                Ok(stored) => return Ok(stored),
                Err(ImageFetchError::Download {
                    retryable: true,
                    ref message,
                    ..
                }) if attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    debug!(attempt, ?delay, error = %message, "retrying download");
                    tokio::time::sleep(delay).await;
                }
                Err(ImageFetchError::Io {
                    persistent: false,
                    ref source,
                    ..
                }) if !io_retried => {
                    debug!(error = %source, "retrying after transient io error");
                    io_retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Copy a record's image URL and alt text into the output catalog.
fn apply_record(catalog: &mut Catalog, index: usize, record: &CheckpointRecord) {
    if let Some(url) = record.image_url.as_deref() {
        catalog.set_image_url(index, url);
    }
    if let Some(alt) = record.image_alt.as_deref() {
        catalog.set_image_alt_text(index, alt);
    }
}

/// Load the catalog, back it up, open the checkpoint log and run the batch.
pub async fn run_from_config(config: FinderConfig, input: &Path) -> Result<BatchSummary> {
    config.validate()?;

    let output = config.output_path_for(input);
    let checkpoint_path = config.checkpoint_path_for(input);

    let mut catalog = Catalog::read(input, &config.columns)
        .with_context(|| format!("reading catalog {}", input.display()))?;
    ensure_parent_dir(&output).await?;
    if config.save_images_locally {
        tokio::fs::create_dir_all(&config.images_folder)
            .await
            .with_context(|| format!("creating {}", config.images_folder.display()))?;
    }

    let backup = if config.backup_original_csv {
        let path = backup_catalog(input).context("backing up input catalog")?;
        info!(backup = %path.display(), "input catalog backed up");
        Some(path)
    } else {
        None
    };

    let mut checkpoints = JsonlCheckpointStore::open(checkpoint_path.clone())
        .with_context(|| format!("opening checkpoint log {}", checkpoint_path.display()))?;

    let orchestrator = BatchOrchestrator::new(config)?;
    let mut summary = orchestrator
        .run(&mut catalog, &mut checkpoints, &output)
        .await
        .context("batch run halted")?;
    checkpoints.compact().context("compacting checkpoint log")?;

    summary.backup_file = backup.map(|p| p.display().to_string());
    summary.checkpoint_file = Some(checkpoint_path.display().to_string());
    Ok(summary)
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cif_adapters::SourceUnavailable;
    use cif_storage::{ColumnNames, HttpClientConfig, MemoryCheckpointStore};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct CountingAdapter {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
        results: Vec<Candidate>,
    }

    #[async_trait]
    impl SourceAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(
            &self,
            _query: &str,
            max_results: usize,
        ) -> Result<Vec<Candidate>, SourceUnavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceUnavailable::new(self.name, "HTTP 503"));
            }
            Ok(self.results.iter().take(max_results).cloned().collect())
        }
    }

    struct StampingAdapter {
        calls: Arc<Mutex<Vec<std::time::Instant>>>,
    }

    #[async_trait]
    impl SourceAdapter for StampingAdapter {
        fn name(&self) -> &'static str {
            "amazon"
        }

        async fn search(
            &self,
            _query: &str,
            _max_results: usize,
        ) -> Result<Vec<Candidate>, SourceUnavailable> {
            self.calls.lock().unwrap().push(std::time::Instant::now());
            Ok(vec![])
        }
    }

    fn url_only_config() -> FinderConfig {
        FinderConfig {
            save_images_locally: false,
            delay_between_requests: 0.0,
            ..FinderConfig::default()
        }
    }

    fn orchestrator(config: FinderConfig, adapters: Vec<Box<dyn SourceAdapter>>) -> BatchOrchestrator {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        BatchOrchestrator::with_adapters(config, adapters, http)
    }

    fn write_catalog(dir: &Path, body: &str) -> (PathBuf, Catalog) {
        let path = dir.join("products.csv");
        std::fs::write(&path, body).unwrap();
        let catalog = Catalog::read(&path, &ColumnNames::default()).unwrap();
        (path, catalog)
    }

    #[tokio::test]
    async fn unavailable_source_is_skipped_for_the_rest_of_the_row() {
        let broken_calls = Arc::new(AtomicUsize::new(0));
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            url_only_config(),
            vec![
                Box::new(CountingAdapter {
                    name: "amazon",
                    calls: broken_calls.clone(),
                    fail: true,
                    results: vec![],
                }),
                Box::new(CountingAdapter {
                    name: "google_images",
                    calls: ok_calls.clone(),
                    fail: false,
                    results: vec![Candidate::new("google_images", "https://cdn.x/z.jpg", 0.8)
                        .with_title("NOW Zinc 50mg")],
                }),
            ],
        );

        let row = CatalogRow::new(1, "Zinc 50mg", "NOW", "Z50");
        let queries = build_queries(&row).unwrap();
        let selection = orch.search_and_select(&row, &queries).await;

        assert_eq!(broken_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok_calls.load(Ordering::SeqCst), queries.len());
        assert_eq!(selection.attempted_sources.len(), 2);
        assert_eq!(selection.chosen.unwrap().candidate.url, "https://cdn.x/z.jpg");
    }

    #[tokio::test]
    async fn limit_leaves_later_rows_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut catalog) = write_catalog(
            dir.path(),
            "Title,Vendor,Variant SKU\nZinc,NOW,Z1\nIron,NOW,I1\nOmega,NOW,O1\n",
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let config = FinderConfig {
            limit: Some(1),
            ..url_only_config()
        };
        let orch = orchestrator(
            config,
            vec![Box::new(CountingAdapter {
                name: "amazon",
                calls: calls.clone(),
                fail: false,
                results: vec![Candidate::new("amazon", "https://cdn.x/a.jpg", 0.9)],
            })],
        );
        let mut store = MemoryCheckpointStore::new();
        let output = dir.path().join("out.csv");

        let summary = orch.run(&mut catalog, &mut store, &output).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.not_attempted, 2);
        assert_eq!(catalog.image_url(1), Some("https://cdn.x/a.jpg"));
        assert_eq!(catalog.image_url(2), Some(""));
        assert_eq!(store.load_all().len(), 1);
    }

    #[tokio::test]
    async fn prefilled_image_rows_are_skipped_and_flushes_follow_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut catalog) = write_catalog(
            dir.path(),
            "Title,Vendor,Variant SKU,image_url\n\
             Zinc,NOW,Z1,https://cdn.x/already.jpg\n\
             Iron,NOW,I1,\n\
             Omega,NOW,O1,\n\
             Magnesium,NOW,M1,\n",
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let config = FinderConfig {
            checkpoint_interval: 2,
            ..url_only_config()
        };
        let orch = orchestrator(
            config,
            vec![Box::new(CountingAdapter {
                name: "amazon",
                calls: calls.clone(),
                fail: false,
                results: vec![Candidate::new("amazon", "https://cdn.x/a.jpg", 0.9)],
            })],
        );
        let mut store = MemoryCheckpointStore::new();
        let output = dir.path().join("out.csv");

        let summary = orch.run(&mut catalog, &mut store, &output).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.done, 3);
        // one periodic flush after two rows, plus the final one
        assert_eq!(summary.flushes, 2);
        assert_eq!(catalog.image_url(1), Some("https://cdn.x/already.jpg"));
        assert!(store
            .load_all()
            .values()
            .all(|r| r.status == RowStatus::Done));
        assert!(output.exists());
    }

    #[tokio::test]
    async fn request_delay_holds_across_row_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        // title only, so each row issues exactly one query
        let (_, mut catalog) = write_catalog(dir.path(), "Title,Vendor,Variant SKU\nZinc,,\nIron,,\n");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let config = FinderConfig {
            delay_between_requests: 0.2,
            ..url_only_config()
        };
        let orch = orchestrator(
            config,
            vec![Box::new(StampingAdapter {
                calls: calls.clone(),
            })],
        );
        let mut store = MemoryCheckpointStore::new();

        orch.run(&mut catalog, &mut store, &dir.path().join("out.csv"))
            .await
            .unwrap();

        let stamps = calls.lock().unwrap().clone();
        assert_eq!(stamps.len(), 2);
        let gap = stamps[1].duration_since(stamps[0]);
        assert!(gap >= Duration::from_millis(190), "gap {gap:?}");
    }
}
