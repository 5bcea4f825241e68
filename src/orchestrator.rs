use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::{BatchOutcome, BatchRunner};
use crate::combine::combine;
use crate::error::ErrorKind;
use crate::model::{CombinedRecord, DetailRecord, RankingEntry};
use crate::report::{determine_status, DetailCoverage, RunReport, StageName};
use crate::sink::{SinkFanout, SinkReport, Snapshots};
use crate::stage::StageExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    RankingsStage,
    UniversitiesStage,
    CombineStage,
    ExportStage,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::RankingsStage => "rankings_stage",
            Self::UniversitiesStage => "universities_stage",
            Self::CombineStage => "combine_stage",
            Self::ExportStage => "export_stage",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// Run-level knobs, resolved from configuration before the run starts.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// One fetch+parse unit per URL; all pages make up the ranking list.
    pub rankings_urls: Vec<String>,
    pub limit: Option<usize>,
    pub university_batch_size: usize,
    pub max_concurrent_requests: usize,
    pub batch_delay: Duration,
    pub min_success_rate: f64,
    pub continue_on_error: bool,
    pub alert_on_long_execution: Option<Duration>,
    pub show_progress: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rankings_urls: Vec::new(),
            limit: None,
            university_batch_size: 10,
            max_concurrent_requests: 1,
            batch_delay: Duration::ZERO,
            min_success_rate: 0.8,
            continue_on_error: true,
            alert_on_long_execution: None,
            show_progress: false,
        }
    }
}

/// Sequences Rankings → Universities → Combine → Export for one run.
///
/// Every run ends in `Done` or `Failed` and yields a [`RunReport`]; stage
/// failures never escape as errors. With a preloaded ranking list the run
/// goes straight from `Init` to `UniversitiesStage`.
pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    executor: StageExecutor,
    fanout: SinkFanout,
    snapshots: Snapshots,
    preloaded: Option<Vec<RankingEntry>>,
    state: PipelineState,
    clock: Instant,
    alerted: bool,
}

/// What the run carries from one stage to the next.
struct RunState {
    outcomes: BTreeMap<StageName, BatchOutcome>,
    records: Vec<CombinedRecord>,
    sinks: SinkReport,
    failed_stage: Option<StageName>,
}

impl PipelineOrchestrator {
    pub fn new(settings: PipelineSettings, executor: StageExecutor, fanout: SinkFanout) -> Self {
        Self {
            settings,
            executor,
            fanout,
            snapshots: Snapshots::default(),
            preloaded: None,
            state: PipelineState::Init,
            clock: Instant::now(),
            alerted: false,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Snapshots) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Scrape details for `entries` instead of running the rankings stage.
    pub fn with_rankings(mut self, entries: Vec<RankingEntry>) -> Self {
        self.preloaded = Some(entries);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, to: PipelineState) {
        info!(from = %self.state, to = %to, "pipeline transition");
        self.state = to;
        self.check_long_running();
    }

    /// Advisory only: the run keeps going.
    fn check_long_running(&mut self) {
        let Some(limit) = self.settings.alert_on_long_execution else {
            return;
        };
        let elapsed = self.clock.elapsed();
        if !self.alerted && elapsed > limit {
            self.alerted = true;
            warn!(elapsed_secs = elapsed.as_secs(), limit_secs = limit.as_secs(), state = %self.state, "pipeline is running long");
        }
    }

    fn gate_failed(&self, outcome: &BatchOutcome) -> bool {
        !outcome.passed && !self.settings.continue_on_error
    }

    pub async fn run(&mut self) -> RunReport {
        let started_at = Local::now();
        let run_id = started_at.format("run_%Y%m%d_%H%M%S").to_string();
        self.clock = Instant::now();
        self.alerted = false;
        self.state = PipelineState::Init;
        info!(run_id = %run_id, "pipeline starting");

        let mut run = RunState {
            outcomes: BTreeMap::new(),
            records: Vec::new(),
            sinks: SinkReport::default(),
            failed_stage: None,
        };
        self.drive(&mut run).await;

        let finished_at = Local::now();
        self.check_long_running();
        let status = determine_status(&run.outcomes, self.settings.continue_on_error, run.sinks.required_failed());
        let detail_missing = run.records.iter().filter(|r| r.detail_missing).count();
        let coverage = DetailCoverage::from_records(&run.records);
        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            stage_outcomes: run.outcomes,
            sinks: run.sinks.sinks,
            records: run.records.len(),
            detail_missing,
            coverage,
            overall_status: status,
            failed_stage: run.failed_stage,
            final_state: self.state,
            long_running: self.alerted,
        };
        self.fanout.record_run(&report);

        if report.is_failed() {
            error!(run_id = %report.run_id, failed_stage = ?report.failed_stage, "pipeline failed");
        } else {
            info!(run_id = %report.run_id, status = %report.overall_status, records = report.records, "pipeline finished");
        }
        report
    }

    async fn drive(&mut self, run: &mut RunState) {
        let entries = match self.preloaded.clone() {
            Some(entries) => {
                info!(entries = entries.len(), "using preloaded rankings, skipping rankings stage");
                self.prepare_entries(entries)
            }
            None => {
                self.transition(PipelineState::RankingsStage);
                let (entries, outcome) = self.rankings_stage().await;
                let failed = self.gate_failed(&outcome);
                run.outcomes.insert(StageName::Rankings, outcome);
                if failed {
                    return self.fail(run, StageName::Rankings);
                }
                if let Err(e) = self.snapshots.save_rankings(&entries, &Local::now()) {
                    warn!(error = %e, "failed to save rankings snapshot");
                }
                entries
            }
        };

        self.transition(PipelineState::UniversitiesStage);
        let (details, outcome) = self.universities_stage(&entries).await;
        let failed = self.gate_failed(&outcome);
        run.outcomes.insert(StageName::Universities, outcome);
        if failed {
            return self.fail(run, StageName::Universities);
        }

        self.transition(PipelineState::CombineStage);
        run.records = combine(entries, details);
        let mut outcome = BatchOutcome::new(1.0);
        run.records.iter().for_each(|_| outcome.record_success());
        outcome.seal();
        run.outcomes.insert(StageName::Combine, outcome);

        self.transition(PipelineState::ExportStage);
        run.sinks = self.fanout.publish(&run.records);
        let mut outcome = BatchOutcome::new(0.0);
        for sink in &run.sinks.sinks {
            match &sink.error {
                None => outcome.record_success(),
                Some(message) => outcome.record_failure(sink.name.clone(), ErrorKind::SinkError, message.clone()),
            }
        }
        outcome.seal();
        outcome.passed = !run.sinks.required_failed();
        let failed = !outcome.passed;
        run.outcomes.insert(StageName::Export, outcome);
        if failed {
            return self.fail(run, StageName::Export);
        }

        self.transition(PipelineState::Done);
    }

    fn fail(&mut self, run: &mut RunState, stage: StageName) {
        warn!(stage = %stage, continue_on_error = self.settings.continue_on_error, "stage gate failed, aborting run");
        run.failed_stage = Some(stage);
        self.transition(PipelineState::Failed);
    }

    /// Every page is a unit; the ranking list is whatever the good pages held.
    async fn rankings_stage(&self) -> (Vec<RankingEntry>, BatchOutcome) {
        let urls = self.settings.rankings_urls.as_slice();
        let executor = &self.executor;
        let runner = BatchRunner::new(urls.len().max(1), 1.0);
        let (pages, outcome) = runner
            .run("rankings", urls, |url| url.clone(), |url| executor.rankings(url))
            .await;

        let entries = self.prepare_entries(pages.into_iter().flatten().collect());
        info!(entries = entries.len(), pages = outcome.total, "ranking list ready");
        (entries, outcome)
    }

    /// First occurrence of each key wins; then rank order, limit and fill.
    fn prepare_entries(&self, entries: Vec<RankingEntry>) -> Vec<RankingEntry> {
        let mut seen = HashSet::new();
        let mut entries: Vec<RankingEntry> = entries.into_iter().filter(|e| seen.insert(e.key())).collect();
        entries.sort_by_key(|e| e.rank);
        if let Some(limit) = self.settings.limit {
            entries.truncate(limit);
        }
        self.executor.normalizer().fill_missing(&mut entries);
        entries
    }

    async fn universities_stage(
        &self,
        entries: &[RankingEntry],
    ) -> (Vec<DetailRecord>, BatchOutcome) {
        let executor = &self.executor;
        let progress = self.progress_bar(entries.len());
        let runner = BatchRunner::new(self.settings.university_batch_size, self.settings.min_success_rate)
            .with_max_in_flight(self.settings.max_concurrent_requests)
            .with_batch_delay(self.settings.batch_delay)
            .with_progress(progress.clone());
        info!(
            entries = entries.len(),
            batches = runner.batch_count(entries.len()),
            batch_size = self.settings.university_batch_size,
            "scraping university pages"
        );
        let snapshots = &self.snapshots;
        let save_batch = |batch: usize, details: &[DetailRecord]| {
            if !snapshots.saves_batches() || details.is_empty() {
                return;
            }
            if let Err(e) = snapshots.save_batch(batch, details, &Local::now()) {
                warn!(batch, error = %e, "failed to save batch snapshot");
            }
        };
        let result = runner
            .run_each_batch("universities", entries, |e| e.key().to_string(), |e| executor.detail(e), save_batch)
            .await;
        progress.finish_and_clear();
        result
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})",
        )
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let pb = ProgressBar::new(len as u64);
        pb.set_style(style);
        pb
    }
}
