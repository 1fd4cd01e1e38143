use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cif_adapters::KNOWN_SOURCES;
use cif_storage::{BackoffPolicy, ColumnNames, HttpClientConfig, ImageRules};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "cif.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("serializing config: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Relative weights of the candidate score components. Only their ratios
/// matter; they are normalized to sum to 1 before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub priority: f64,
    pub similarity: f64,
    pub position: f64,
    pub confidence: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority: 0.3,
            similarity: 0.3,
            position: 0.1,
            confidence: 0.3,
        }
    }
}

impl ScoringWeights {
    fn total(&self) -> f64 {
        self.priority + self.similarity + self.position + self.confidence
    }

    pub fn normalized(&self) -> Self {
        let total = self.total();
        if total <= 0.0 || !total.is_finite() {
            return Self::default().normalized();
        }
        Self {
            priority: self.priority / total,
            similarity: self.similarity / total,
            position: self.position / total,
            confidence: self.confidence / total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    pub search_sources: BTreeMap<String, bool>,
    /// Highest priority first. Enabled sources missing here rank after the
    /// listed ones in their default order.
    pub source_priority: Vec<String>,
    pub max_results_per_source: usize,
    /// Seconds to wait between two source requests.
    pub delay_between_requests: f64,
    /// Total download attempts per chosen image.
    pub max_retries: usize,
    pub retry_base_delay_secs: f64,
    pub retry_max_delay_secs: f64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub save_images_locally: bool,
    pub images_folder: PathBuf,
    pub backup_original_csv: bool,
    /// Flush catalog updates every this many processed rows.
    pub checkpoint_interval: usize,
    pub acceptance_threshold: f64,
    pub scoring: ScoringWeights,
    pub min_image_width: u32,
    pub min_image_height: u32,
    pub min_image_bytes: usize,
    pub columns: ColumnNames,
    pub limit: Option<usize>,
    pub output_file: Option<PathBuf>,
    pub checkpoint_file: Option<PathBuf>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        let search_sources = KNOWN_SOURCES
            .iter()
            .map(|name| {
                let enabled = !matches!(*name, cif_adapters::UNSPLASH | cif_adapters::OPEN_FACTS);
                (name.to_string(), enabled)
            })
            .collect();
        Self {
            search_sources,
            source_priority: KNOWN_SOURCES.iter().map(ToString::to_string).collect(),
            max_results_per_source: 5,
            delay_between_requests: 1.0,
            max_retries: 3,
            retry_base_delay_secs: 1.0,
            retry_max_delay_secs: 30.0,
            request_timeout_secs: 10,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) cif/0.1".to_string(),
            save_images_locally: true,
            images_folder: PathBuf::from("scraped_images"),
            backup_original_csv: true,
            checkpoint_interval: 100,
            acceptance_threshold: 0.5,
            scoring: ScoringWeights::default(),
            min_image_width: 200,
            min_image_height: 200,
            min_image_bytes: 1024,
            columns: ColumnNames::default(),
            limit: None,
            output_file: None,
            checkpoint_file: None,
        }
    }
}

impl FinderConfig {
    pub fn from_yaml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw, path)
    }

    /// Explicit path, else `CIF_CONFIG`, else `cif.yaml` when present, else
    /// defaults. Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var("CIF_CONFIG").ok().map(PathBuf::from);
        let config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(folder) = lookup("CIF_IMAGES_FOLDER") {
            self.images_folder = PathBuf::from(folder);
        }
        if let Some(agent) = lookup("CIF_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(secs) = lookup("CIF_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
        self
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Serialize)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for name in self.search_sources.keys().chain(self.source_priority.iter()) {
            if !KNOWN_SOURCES.contains(&name.as_str()) {
                return invalid(format!(
                    "unknown source `{name}` (known: {})",
                    KNOWN_SOURCES.join(", ")
                ));
            }
        }
        if self.enabled_sources().is_empty() {
            return invalid("no search source is enabled".to_string());
        }
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return invalid(format!(
                "acceptance_threshold must be within [0, 1], got {}",
                self.acceptance_threshold
            ));
        }
        let w = &self.scoring;
        if [w.priority, w.similarity, w.position, w.confidence]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return invalid("scoring weights must be finite and non-negative".to_string());
        }
        if w.total() <= 0.0 {
            return invalid("at least one scoring weight must be positive".to_string());
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1".to_string());
        }
        if self.checkpoint_interval == 0 {
            return invalid("checkpoint_interval must be at least 1".to_string());
        }
        if self.max_results_per_source == 0 {
            return invalid("max_results_per_source must be at least 1".to_string());
        }
        for (field, value) in [
            ("delay_between_requests", self.delay_between_requests),
            ("retry_base_delay_secs", self.retry_base_delay_secs),
            ("retry_max_delay_secs", self.retry_max_delay_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{field} must be a non-negative number of seconds"));
            }
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }

    /// Enabled source names, highest priority first.
    pub fn enabled_sources(&self) -> Vec<String> {
        let enabled = |name: &str| self.search_sources.get(name).copied().unwrap_or(false);
        let mut ordered: Vec<String> = Vec::new();
        for name in self
            .source_priority
            .iter()
            .map(String::as_str)
            .chain(KNOWN_SOURCES.iter().copied())
        {
            if enabled(name) && !ordered.iter().any(|o| o == name) {
                ordered.push(name.to_string());
            }
        }
        ordered
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_between_requests.max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: Duration::from_secs_f64(self.retry_base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(self.retry_max_delay_secs.max(0.0)),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.request_timeout(),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn image_rules(&self) -> ImageRules {
        ImageRules {
            min_width: self.min_image_width,
            min_height: self.min_image_height,
            min_bytes: self.min_image_bytes,
        }
    }

    /// `output_file`, or `{stem}_with_images.csv` next to the input.
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        self.output_file
            .clone()
            .unwrap_or_else(|| sibling_with_suffix(input, "_with_images.csv"))
    }

    /// `checkpoint_file`, or `{stem}.checkpoint.jsonl` next to the input.
    pub fn checkpoint_path_for(&self, input: &Path) -> PathBuf {
        self.checkpoint_file
            .clone()
            .unwrap_or_else(|| sibling_with_suffix(input, ".checkpoint.jsonl"))
    }
}

fn sibling_with_suffix(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "catalog".to_string());
    input.with_file_name(format!("{stem}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_follow_priority() {
        let config = FinderConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.enabled_sources(),
            vec!["manufacturer_websites", "amazon", "google_images", "bing_images"]
        );
        assert_eq!(config.checkpoint_interval, 100);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
search_sources:
  amazon: true
  unsplash: true
source_priority: [unsplash]
acceptance_threshold: 0.7
columns:
  sku: SKU
"#;
        let config = FinderConfig::from_yaml_str(yaml, Path::new("cif.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.enabled_sources(), vec!["unsplash", "amazon"]);
        assert_eq!(config.acceptance_threshold, 0.7);
        assert_eq!(config.columns.sku, "SKU");
        assert_eq!(config.columns.title, "Title");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = FinderConfig::default();
        config.acceptance_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = FinderConfig::default();
        config.search_sources.insert("altavista".into(), true);
        assert!(config.validate().is_err());

        let mut config = FinderConfig::default();
        config.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = FinderConfig::default();
        config.scoring.similarity = -0.1;
        assert!(config.validate().is_err());

        let mut config = FinderConfig::default();
        config.search_sources.values_mut().for_each(|v| *v = false);
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let config = FinderConfig::default().with_env_overrides(|key| match key {
            "CIF_IMAGES_FOLDER" => Some("/tmp/imgs".into()),
            "CIF_HTTP_TIMEOUT_SECS" => Some("42".into()),
            "CIF_USER_AGENT" => Some("bad-number".into()),
            _ => None,
        });
        assert_eq!(config.images_folder, PathBuf::from("/tmp/imgs"));
        assert_eq!(config.request_timeout_secs, 42);
        assert_eq!(config.user_agent, "bad-number");
    }

    #[test]
    fn yaml_round_trip_for_init_config() {
        let config = FinderConfig::default();
        let yaml = config.to_yaml().unwrap();
        let back = FinderConfig::from_yaml_str(&yaml, Path::new("x.yaml")).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn derived_paths_sit_next_to_input() {
        let config = FinderConfig::default();
        let input = Path::new("data/products.csv");
        assert_eq!(
            config.output_path_for(input),
            PathBuf::from("data/products_with_images.csv")
        );
        assert_eq!(
            config.checkpoint_path_for(input),
            PathBuf::from("data/products.checkpoint.jsonl")
        );
    }

    #[test]
    fn weights_normalize_to_one() {
        let w = ScoringWeights {
            priority: 2.0,
            similarity: 1.0,
            position: 1.0,
            confidence: 0.0,
        }
        .normalized();
        assert!((w.priority - 0.5).abs() < 1e-9);
        assert!((w.total() - 1.0).abs() < 1e-9);
    }
}
