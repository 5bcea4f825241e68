//! Fakes shared by unit tests across modules.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Local, TimeZone};

use crate::batch::BatchOutcome;
use crate::error::{FetchError, ParseError, SinkError};
use crate::fetch::{Fetcher, RawMarkup};
use crate::model::{CombinedRecord, DetailRecord, RankingEntry, Record, RecordType, Scores, Subject};
use crate::orchestrator::PipelineState;
use crate::parser::Parser;
use crate::report::{DetailCoverage, OverallStatus, RunReport, StageName};
use crate::sink::{Sink, WriteSummary};

pub const RANKINGS_URL: &str = "https://rankings.example.com/2025/world-ranking/results?view=reputation";

pub fn detail_url(name: &str) -> String {
    format!(
        "https://rankings.example.com/world-university-rankings/{}",
        name.to_lowercase().replace(' ', "-")
    )
}

pub fn ranking_entry(rank: u32, name: &str) -> RankingEntry {
    RankingEntry {
        rank,
        name: name.to_string(),
        country: "Narnia".to_string(),
        detail_url: detail_url(name),
        scores: Scores {
            overall: Some(100.0 - f64::from(rank)),
            teaching: Some(60.0),
            ..Default::default()
        },
    }
}

pub fn detail_record(name: &str) -> DetailRecord {
    let mut record = DetailRecord {
        source_url: detail_url(name),
        name: Some(name.to_string()),
        ..Default::default()
    };
    record.key_stats.insert("students".into(), "12,000".into());
    record.subjects.push(Subject {
        name: "Physics".into(),
        rank: Some("4".into()),
        score: Some(81.5),
    });
    record
}

pub fn combined(rank: u32, name: &str, with_detail: bool) -> CombinedRecord {
    let detail = with_detail.then(|| detail_record(name));
    CombinedRecord::new(ranking_entry(rank, name), detail)
}

/// Markup of a rankings page listing `entries`.
pub fn rankings_html(entries: &[RankingEntry]) -> String {
    let rows: String = entries
        .iter()
        .map(|e| {
            let score = |s: Option<f64>| s.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into());
            format!(
                r#"<tr><td>{}</td><td><a class="ranking-institution-title" href="{}">{}</a><div class="location"><a>{}</a></div></td><td>{}</td><td>{}</td></tr>"#,
                e.rank,
                e.detail_url,
                e.name,
                e.country,
                score(e.scores.overall),
                score(e.scores.teaching)
            )
        })
        .collect();
    format!(r#"<html><body><table id="datatable-1"><tr><th>Rank</th><th>Name</th></tr>{rows}</table></body></html>"#)
}

pub fn profile_html(name: &str) -> String {
    format!(
        r#"<html><body><h1 class="hero-title">{name}</h1><dl><dt>Students</dt><dd>12,000</dd></dl></body></html>"#
    )
}

#[derive(Debug, Clone, Default)]
struct Script {
    body: Option<String>,
    failures_left: u32,
    always_fail: bool,
    error: Option<FetchError>,
}

/// Serves canned pages per URL, optionally failing first.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, body: &str) {
        self.scripts.lock().unwrap().entry(url.to_string()).or_default().body = Some(body.to_string());
    }

    pub fn fail_times(&self, url: &str, times: u32, error: FetchError) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(url.to_string()).or_default();
        script.failures_left = times;
        script.error = Some(error);
    }

    pub fn fail_always(&self, url: &str, error: FetchError) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(url.to_string()).or_default();
        script.always_fail = true;
        script.error = Some(error);
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _render: bool) -> Result<RawMarkup, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let unscripted = || FetchError::Network {
            url: url.to_string(),
            reason: "unscripted url".into(),
        };
        let Some(script) = scripts.get_mut(url) else {
            return Err(unscripted());
        };
        if script.always_fail || script.failures_left > 0 {
            script.failures_left = script.failures_left.saturating_sub(1);
            return Err(script.error.clone().unwrap_or_else(unscripted));
        }
        script.body.clone().map(|body| RawMarkup::new(url, body)).ok_or_else(unscripted)
    }
}

/// Returns the same record for every page.
pub struct StaticParser(Record);

impl StaticParser {
    pub fn rankings(entries: Vec<RankingEntry>) -> Self {
        Self(Record::Rankings(entries))
    }
}

impl Parser for StaticParser {
    fn parse(&self, markup: &RawMarkup, _record_type: RecordType) -> Result<Record, ParseError> {
        if markup.body.is_empty() {
            return Err(ParseError::MalformedInput("empty".into()));
        }
        Ok(self.0.clone())
    }
}

/// Keeps every record it is asked to write.
pub struct RecordingSink {
    name: String,
    written: Arc<Mutex<Vec<CombinedRecord>>>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            written: Arc::default(),
        }
    }

    pub fn written(&self) -> Arc<Mutex<Vec<CombinedRecord>>> {
        Arc::clone(&self.written)
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, records: &[CombinedRecord]) -> Result<WriteSummary, SinkError> {
        self.written.lock().unwrap().extend_from_slice(records);
        Ok(WriteSummary {
            rows: records.len(),
            target: format!("memory://{}", self.name),
        })
    }
}

pub struct FailingSink {
    name: String,
    required: bool,
}

impl FailingSink {
    pub fn new(name: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            required,
        }
    }
}

impl Sink for FailingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    fn write(&self, _records: &[CombinedRecord]) -> Result<WriteSummary, SinkError> {
        Err(SinkError::ConnectionFailed("connection refused".into()))
    }
}

pub fn report_with_status(run_id: &str, overall_status: OverallStatus) -> RunReport {
    let started_at = Local.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let mut universities = BatchOutcome::new(0.7);
    universities.record_success();
    universities.seal();
    RunReport {
        run_id: run_id.to_string(),
        started_at,
        finished_at: started_at + chrono::Duration::seconds(42),
        stage_outcomes: BTreeMap::from([(StageName::Universities, universities)]),
        sinks: Vec::new(),
        records: 1,
        detail_missing: 0,
        coverage: DetailCoverage::default(),
        overall_status,
        failed_stage: None,
        final_state: PipelineState::Done,
        long_running: false,
    }
}
