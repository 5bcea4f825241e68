use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::batch::BatchOutcome;
use crate::model::CombinedRecord;
use crate::orchestrator::PipelineState;
use crate::sink::SinkSummary;

/// Failures listed per stage in the console report.
const MAX_FAILURES_SHOWN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Rankings,
    Universities,
    Combine,
    Export,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rankings => "rankings",
            Self::Universities => "universities",
            Self::Combine => "combine",
            Self::Export => "export",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        })
    }
}

/// Verdict over all stage outcomes.
///
/// Any underperforming stage fails the run unless `continue_on_error`, in
/// which case the run is partial. A failed required sink always fails it.
pub fn determine_status(
    outcomes: &BTreeMap<StageName, BatchOutcome>,
    continue_on_error: bool,
    required_sink_failed: bool,
) -> OverallStatus {
    if required_sink_failed {
        return OverallStatus::Failed;
    }
    match (outcomes.values().all(|o| o.passed), continue_on_error) {
        (true, _) => OverallStatus::Success,
        (false, true) => OverallStatus::PartialSuccess,
        (false, false) => OverallStatus::Failed,
    }
}

/// How much of the detail pages came through, over the combined records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetailCoverage {
    pub total: usize,
    pub with_detail: usize,
    pub with_ranking_data: usize,
    pub with_key_stats: usize,
    pub with_subjects: usize,
    pub unique_countries: usize,
    pub unique_subjects: usize,
}

impl DetailCoverage {
    /// Countries come from the last comma-separated part of a detail page's
    /// location.
    pub fn from_records(records: &[CombinedRecord]) -> Self {
        let mut coverage = Self {
            total: records.len(),
            ..Self::default()
        };
        let mut countries = BTreeSet::new();
        let mut subjects = BTreeSet::new();
        for detail in records.iter().filter_map(|r| r.detail.as_ref()) {
            coverage.with_detail += 1;
            coverage.with_ranking_data += usize::from(!detail.ranking_data.is_empty());
            coverage.with_key_stats += usize::from(!detail.key_stats.is_empty());
            coverage.with_subjects += usize::from(!detail.subjects.is_empty());
            subjects.extend(detail.subjects.iter().map(|s| s.name.as_str()).filter(|n| !n.is_empty()));
            if let Some(country) = detail
                .extra
                .get("location")
                .and_then(|l| l.rsplit(',').next())
                .map(str::trim)
                .filter(|c| !c.is_empty())
            {
                countries.insert(country);
            }
        }
        coverage.unique_countries = countries.len();
        coverage.unique_subjects = subjects.len();
        coverage
    }
}

/// Everything a caller learns about one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub stage_outcomes: BTreeMap<StageName, BatchOutcome>,
    pub sinks: Vec<SinkSummary>,
    pub records: usize,
    pub detail_missing: usize,
    pub coverage: DetailCoverage,
    pub overall_status: OverallStatus,
    pub failed_stage: Option<StageName>,
    pub final_state: PipelineState,
    pub long_running: bool,
}

impl RunReport {
    pub fn is_failed(&self) -> bool {
        self.overall_status == OverallStatus::Failed
    }

    pub fn stage(&self, name: StageName) -> Option<&BatchOutcome> {
        self.stage_outcomes.get(&name)
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))?;
        Ok(())
    }

    pub fn print(&self) {
        println!(
            "\nRun {} | {} | final state {} | {}",
            self.run_id,
            self.overall_status,
            self.final_state,
            format_duration(self.duration())
        );
        if let Some(stage) = self.failed_stage {
            println!("Failed stage: {}", stage);
        }
        if self.long_running {
            println!("Run exceeded its long-execution alert threshold");
        }

        println!(
            "\n{:<13} | {:>6} | {:>6} | {:>6} | {:>7} | {:>5}",
            "Stage", "Total", "OK", "Failed", "Rate", "Gate"
        );
        println!("{}", "-".repeat(58));
        for (name, o) in &self.stage_outcomes {
            println!(
                "{:<13} | {:>6} | {:>6} | {:>6} | {:>6.1}% | {:>5}",
                name.to_string(),
                o.total,
                o.succeeded,
                o.failed,
                o.success_rate() * 100.0,
                if o.passed { "pass" } else { "FAIL" }
            );
        }

        for (name, o) in self.stage_outcomes.iter().filter(|(_, o)| !o.failures.is_empty()) {
            println!("\n--- {} failures ({}) ---", name, o.failures.len());
            for failure in o.failures.iter().take(MAX_FAILURES_SHOWN) {
                println!(
                    "  [{}] {}: {}",
                    failure.error_kind,
                    truncate(&failure.item_key, 48),
                    truncate(&failure.message, 80)
                );
            }
            if o.failures.len() > MAX_FAILURES_SHOWN {
                println!("  ... and {} more", o.failures.len() - MAX_FAILURES_SHOWN);
            }
        }

        if !self.sinks.is_empty() {
            println!("\n{:<10} | {:<6} | {:>6} | {}", "Sink", "Status", "Rows", "Target");
            println!("{}", "-".repeat(72));
            for s in &self.sinks {
                let status = match (s.success, s.required) {
                    (true, _) => "ok",
                    (false, true) => "FAILED",
                    (false, false) => "error",
                };
                let detail = s.target.as_deref().or(s.error.as_deref()).unwrap_or("-");
                println!("{:<10} | {:<6} | {:>6} | {}", s.name, status, s.rows, truncate(detail, 60));
            }
        }

        println!(
            "\n{} records ({} without detail)",
            self.records, self.detail_missing
        );
        let c = &self.coverage;
        if c.with_detail > 0 {
            println!(
                "Detail coverage: {} ranking data, {} key stats, {} subjects | {} countries, {} distinct subjects",
                c.with_ranking_data, c.with_key_stats, c.with_subjects, c.unique_countries, c.unique_subjects
            );
        }
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

pub fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
