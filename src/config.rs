//! YAML configuration with `${VAR}` substitution.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{SinkError, ValidationError};
use crate::fetch::{FetchSettings, Fetcher};
use crate::normalize::{MissingScores, Normalizer};
use crate::orchestrator::PipelineSettings;
use crate::parser::HtmlParser;
use crate::retry::RetryPolicy;
use crate::sink::{ConflictPolicy, FileSink, SinkFanout, Snapshots, SqliteSink, TabularFormat, TabularSink};
use crate::stage::StageExecutor;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.yml";

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub scraper: ScraperConfig,
    pub pipeline: PipelineConfig,
    pub processing: ProcessingConfig,
    pub sinks: SinksConfig,
    pub snapshots: SnapshotsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub output_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output_dir: "data".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub year: String,
    pub view: String,
    pub pages: u32,
    pub limit: Option<usize>,
    pub render: bool,
    pub request_delay_secs: f64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.timeshighereducation.com/world-university-rankings".into(),
            year: "2025".into(),
            view: "reputation".into(),
            pages: 1,
            limit: None,
            render: true,
            request_delay_secs: 2.0,
            timeout_secs: 30,
            user_agent: concat!("rankings_scraper/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub university_batch_size: usize,
    pub max_concurrent_requests: usize,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub batch_delay_secs: f64,
    pub min_success_rate: f64,
    pub continue_on_error: bool,
    pub alert_on_long_execution_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            university_batch_size: 10,
            max_concurrent_requests: 1,
            max_retries: 3,
            retry_delay_secs: 5.0,
            batch_delay_secs: 0.0,
            min_success_rate: 0.8,
            continue_on_error: true,
            alert_on_long_execution_secs: Some(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub min_score_threshold: f64,
    pub max_score_threshold: f64,
    pub missing_scores: MissingScores,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            min_score_threshold: 0.0,
            max_score_threshold: 100.0,
            missing_scores: MissingScores::Keep,
        }
    }
}

/// Sink sections share `enabled`, `required` and a `path` template; each
/// has its own defaults. Relative paths live under `general.output_dir`.
macro_rules! sink_config {
    ($name:ident { enabled: $enabled:expr, path: $path:expr $(, $field:ident: $ty:ty = $default:expr)* }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            pub enabled: bool,
            pub required: bool,
            pub path: String,
            $(pub $field: $ty,)*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    enabled: $enabled,
                    required: false,
                    path: $path.into(),
                    $($field: $default,)*
                }
            }
        }
    };
}

sink_config!(FileSinkConfig { enabled: true, path: "universities/universities_{timestamp}.json" });
sink_config!(CsvSinkConfig { enabled: true, path: "exports/csv/rankings_{timestamp}.csv", delimiter: char = ',' });
sink_config!(JsonSinkConfig { enabled: false, path: "exports/json/rankings_{timestamp}.json" });
sink_config!(ExcelSinkConfig { enabled: false, path: "exports/excel/rankings_{timestamp}.xlsx" });
sink_config!(DatabaseSinkConfig {
    enabled: true,
    path: "rankings.sqlite",
    conflict_policy: ConflictPolicy = ConflictPolicy::Replace
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub file: FileSinkConfig,
    pub csv: CsvSinkConfig,
    pub json: JsonSinkConfig,
    pub excel: ExcelSinkConfig,
    pub database: DatabaseSinkConfig,
}

/// Intermediate artifacts. `{year}` and `{view}` in paths take the scraper
/// settings; batch paths also take `{batch}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub rankings: bool,
    pub rankings_path: String,
    pub batches: bool,
    pub batches_path: String,
    pub raw_html: bool,
    pub raw_html_dir: String,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            rankings: true,
            rankings_path: "rankings/rankings_{year}_{view}_{timestamp}.json".into(),
            batches: false,
            batches_path: "universities/batches/universities_batch_{batch}_{timestamp}.json".into(),
            raw_html: false,
            raw_html_dir: "raw".into(),
        }
    }
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// Every missing variable is named in the error.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| match std::env::var(&cap[1]) {
        Ok(val) => val,
        Err(_) => {
            missing.push(cap[1].to_string());
            String::new()
        }
    });
    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let substituted = substitute_env_vars(yaml)?;
        let config: Config = serde_yaml::from_str(&substituted).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the default path if none was given.
    ///
    /// A missing default file falls back to built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let (s, p, proc) = (&self.scraper, &self.pipeline, &self.processing);
        if s.base_url.trim().is_empty() {
            return Err(invalid("scraper.base_url", "must not be empty"));
        }
        if s.pages == 0 {
            return Err(invalid("scraper.pages", "must be at least 1"));
        }
        if p.university_batch_size == 0 {
            return Err(invalid("pipeline.university_batch_size", "must be at least 1"));
        }
        if p.max_concurrent_requests == 0 {
            return Err(invalid("pipeline.max_concurrent_requests", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&p.min_success_rate) {
            return Err(invalid("pipeline.min_success_rate", format!("{} is outside [0, 1]", p.min_success_rate)));
        }
        for (field, value) in [
            ("scraper.request_delay_secs", s.request_delay_secs),
            ("pipeline.retry_delay_secs", p.retry_delay_secs),
            ("pipeline.batch_delay_secs", p.batch_delay_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("{value} must be a non-negative number of seconds")));
            }
        }
        let sinks = &self.sinks;
        for (field, enabled, path) in [
            ("sinks.file.path", sinks.file.enabled, &sinks.file.path),
            ("sinks.csv.path", sinks.csv.enabled, &sinks.csv.path),
            ("sinks.json.path", sinks.json.enabled, &sinks.json.path),
            ("sinks.excel.path", sinks.excel.enabled, &sinks.excel.path),
            ("sinks.database.path", sinks.database.enabled, &sinks.database.path),
        ] {
            if enabled && path.trim().is_empty() {
                return Err(invalid(field, "enabled sink needs a path"));
            }
        }
        let snap = &self.snapshots;
        for (field, enabled, path) in [
            ("snapshots.rankings_path", snap.rankings, &snap.rankings_path),
            ("snapshots.batches_path", snap.batches, &snap.batches_path),
            ("snapshots.raw_html_dir", snap.raw_html, &snap.raw_html_dir),
        ] {
            if enabled && path.trim().is_empty() {
                return Err(invalid(field, "enabled snapshot needs a path"));
            }
        }
        if proc.min_score_threshold > proc.max_score_threshold {
            return Err(invalid(
                "processing.min_score_threshold",
                format!("{} exceeds max_score_threshold {}", proc.min_score_threshold, proc.max_score_threshold),
            ));
        }
        Ok(())
    }

    /// CLI flags win over the file.
    pub fn apply_overrides(
        &mut self,
        limit: Option<usize>,
        batch_size: Option<usize>,
        continue_on_error: bool,
        no_render: bool,
    ) {
        if limit.is_some() {
            self.scraper.limit = limit;
        }
        if let Some(size) = batch_size {
            self.pipeline.university_batch_size = size;
        }
        if continue_on_error {
            self.pipeline.continue_on_error = true;
        }
        if no_render {
            self.scraper.render = false;
        }
    }

    /// First page plain, later pages with `&page=N`.
    pub fn rankings_urls(&self) -> Vec<String> {
        let s = &self.scraper;
        let first = format!(
            "{}/{}/world-ranking/results?view={}",
            s.base_url.trim_end_matches('/'),
            s.year,
            s.view
        );
        (1..=s.pages)
            .map(|page| if page == 1 { first.clone() } else { format!("{first}&page={page}") })
            .collect()
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout: Duration::from_secs(self.scraper.timeout_secs),
            user_agent: self.scraper.user_agent.clone(),
        }
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer {
            min_score: self.processing.min_score_threshold,
            max_score: self.processing.max_score_threshold,
            missing_scores: self.processing.missing_scores,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.pipeline.max_retries, secs(self.pipeline.retry_delay_secs))
    }

    pub fn executor(&self, fetcher: Arc<dyn Fetcher>) -> StageExecutor {
        let executor = StageExecutor::new(fetcher, Arc::new(HtmlParser), self.normalizer(), self.retry_policy())
            .with_request_delay(secs(self.scraper.request_delay_secs))
            .with_render(self.scraper.render);
        match self.raw_html_dir() {
            Some(dir) => executor.with_raw_html_dir(dir),
            None => executor,
        }
    }

    pub fn raw_html_dir(&self) -> Option<PathBuf> {
        self.snapshots
            .raw_html
            .then(|| PathBuf::from(self.output_path(&self.snapshots.raw_html_dir)))
    }

    pub fn snapshots(&self) -> Snapshots {
        let snap = &self.snapshots;
        let resolve = |template: &str| {
            self.output_path(
                &template
                    .replace("{year}", &self.scraper.year)
                    .replace("{view}", &self.scraper.view),
            )
        };
        let mut snapshots = Snapshots::new();
        if snap.rankings {
            snapshots = snapshots.with_rankings(resolve(&snap.rankings_path));
        }
        if snap.batches {
            snapshots = snapshots.with_batches(resolve(&snap.batches_path));
        }
        snapshots
    }

    pub fn pipeline_settings(&self, show_progress: bool) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            rankings_urls: self.rankings_urls(),
            limit: self.scraper.limit,
            university_batch_size: p.university_batch_size,
            max_concurrent_requests: p.max_concurrent_requests,
            batch_delay: secs(p.batch_delay_secs),
            min_success_rate: p.min_success_rate,
            continue_on_error: p.continue_on_error,
            alert_on_long_execution: p.alert_on_long_execution_secs.map(Duration::from_secs),
            show_progress,
        }
    }

    /// Resolve a sink path against the output directory.
    pub fn output_path(&self, path: &str) -> String {
        Path::new(&self.general.output_dir).join(path).to_string_lossy().into_owned()
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(self.output_path(&self.sinks.database.path))
    }

    /// Every enabled sink, in a fixed order.
    pub fn fanout(&self) -> Result<SinkFanout, SinkError> {
        let sinks = &self.sinks;
        let mut fanout = SinkFanout::new();
        if sinks.file.enabled {
            fanout.push(Box::new(FileSink::new(self.output_path(&sinks.file.path), sinks.file.required)));
        }
        if sinks.csv.enabled {
            let format = if sinks.csv.delimiter == '\t' { TabularFormat::Tsv } else { TabularFormat::Csv };
            let sink = TabularSink::new(format, self.output_path(&sinks.csv.path), sinks.csv.required).with_delimiter(sinks.csv.delimiter);
            fanout.push(Box::new(sink));
        }
        if sinks.json.enabled {
            fanout.push(Box::new(TabularSink::new(TabularFormat::Json, self.output_path(&sinks.json.path), sinks.json.required)));
        }
        if sinks.excel.enabled {
            fanout.push(Box::new(TabularSink::new(TabularFormat::Excel, self.output_path(&sinks.excel.path), sinks.excel.required)));
        }
        if sinks.database.enabled {
            let db = &sinks.database;
            fanout.push(Box::new(SqliteSink::open(self.database_path(), db.conflict_policy, db.required)?));
        }
        Ok(fanout)
    }
}
