//! Intermediate artifacts written while a run is in progress: the ranking
//! list once the rankings stage is done, each batch of detail records as it
//! completes, and optionally the raw markup of every fetched page.
//!
//! Snapshot writes are best-effort. A failure is logged by the caller and
//! never changes a stage verdict.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use super::render_path;
use crate::error::SinkError;
use crate::model::{DetailRecord, RankingEntry};

/// Placeholder replaced with the 1-based batch number in batch paths.
pub const BATCH_PLACEHOLDER: &str = "{batch}";

/// Longest file stem derived from a URL for raw markup files.
const MAX_STEM_LEN: usize = 120;

#[derive(Debug, Clone, Default)]
pub struct Snapshots {
    rankings_path: Option<String>,
    batch_path: Option<String>,
}

impl Snapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rankings(mut self, template: impl Into<String>) -> Self {
        self.rankings_path = Some(template.into());
        self
    }

    pub fn with_batches(mut self, template: impl Into<String>) -> Self {
        self.batch_path = Some(template.into());
        self
    }

    pub fn saves_batches(&self) -> bool {
        self.batch_path.is_some()
    }

    /// Write the ranking list. `Ok(None)` when rankings snapshots are off.
    pub fn save_rankings(&self, entries: &[RankingEntry], now: &DateTime<Local>) -> Result<Option<PathBuf>, SinkError> {
        let Some(template) = &self.rankings_path else {
            return Ok(None);
        };
        let path = write_json(template, now, entries)?;
        info!(path = %path.display(), entries = entries.len(), "saved rankings snapshot");
        Ok(Some(path))
    }

    /// Write one finished batch of detail records.
    pub fn save_batch(
        &self,
        batch: usize,
        details: &[DetailRecord],
        now: &DateTime<Local>,
    ) -> Result<Option<PathBuf>, SinkError> {
        let Some(template) = &self.batch_path else {
            return Ok(None);
        };
        let template = template.replace(BATCH_PLACEHOLDER, &batch.to_string());
        let path = write_json(&template, now, details)?;
        info!(path = %path.display(), batch, records = details.len(), "saved batch snapshot");
        Ok(Some(path))
    }
}

fn write_json<T: Serialize + ?Sized>(template: &str, now: &DateTime<Local>, value: &T) -> Result<PathBuf, SinkError> {
    let path = render_path(template, now)?;
    let mut out = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut out, value)?;
    out.flush()?;
    Ok(path)
}

/// Read a ranking list written by [`Snapshots::save_rankings`].
///
/// Entries without an http(s) detail URL cannot be scraped and are dropped.
pub fn load_rankings(path: &Path) -> Result<Vec<RankingEntry>> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read rankings file {}", path.display()))?;
    let entries: Vec<RankingEntry> =
        serde_json::from_str(&text).with_context(|| format!("Invalid rankings JSON in {}", path.display()))?;
    let total = entries.len();
    let entries: Vec<RankingEntry> = entries
        .into_iter()
        .filter(|e| e.detail_url.starts_with("http://") || e.detail_url.starts_with("https://"))
        .collect();
    if entries.len() < total {
        warn!(path = %path.display(), dropped = total - entries.len(), "rankings entries without a usable URL");
    }
    info!(path = %path.display(), entries = entries.len(), "loaded rankings");
    Ok(entries)
}

/// Store the markup of one fetched page under `dir`.
pub fn save_raw_html(dir: &Path, url: &str, body: &str, now: &DateTime<Local>) -> Result<PathBuf, SinkError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{}.html", url_stem(url), now.format("%Y%m%d_%H%M%S")));
    fs::write(&path, body)?;
    Ok(path)
}

/// Filesystem-safe stem: scheme dropped, every other non-alphanumeric run
/// collapsed to one underscore.
fn url_stem(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let mut stem = String::with_capacity(rest.len());
    for c in rest.chars() {
        if c.is_ascii_alphanumeric() {
            stem.push(c);
        } else if !stem.ends_with('_') {
            stem.push('_');
        }
    }
    let stem: String = stem.trim_matches('_').chars().take(MAX_STEM_LEN).collect();
    if stem.is_empty() {
        "page".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::testing::{detail_record, ranking_entry};

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn disabled_snapshots_write_nothing() {
        let snapshots = Snapshots::new();
        assert!(!snapshots.saves_batches());
        assert_eq!(snapshots.save_rankings(&[ranking_entry(1, "A")], &now()).unwrap(), None);
        assert_eq!(snapshots.save_batch(1, &[detail_record("A")], &now()).unwrap(), None);
    }

    #[test]
    fn rankings_snapshot_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("rankings/rankings_2025_reputation_{timestamp}.json");
        let snapshots = Snapshots::new().with_rankings(template.to_str().unwrap());
        let entries = vec![ranking_entry(1, "Alpha"), ranking_entry(2, "Beta")];

        let path = snapshots.save_rankings(&entries, &now()).unwrap().unwrap();
        assert!(path.ends_with("rankings/rankings_2025_reputation_20250601_120000.json"));
        assert_eq!(load_rankings(&path).unwrap(), entries);
    }

    #[test]
    fn load_drops_entries_without_http_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rankings.json");
        let mut broken = ranking_entry(2, "Beta");
        broken.detail_url = "/relative/beta".into();
        fs::write(&path, serde_json::to_string(&vec![ranking_entry(1, "Alpha"), broken]).unwrap()).unwrap();

        let loaded = load_rankings(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Alpha");
    }

    #[test]
    fn load_rejects_missing_or_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_rankings(&dir.path().join("absent.json")).is_err());
        let path = dir.path().join("bad.json");
        fs::write(&path, "{\"not\": \"a list\"}").unwrap();
        assert!(load_rankings(&path).is_err());
    }

    #[test]
    fn batch_snapshot_is_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("universities_batch_{batch}_{timestamp}.json");
        let snapshots = Snapshots::new().with_batches(template.to_str().unwrap());

        let path = snapshots.save_batch(3, &[detail_record("A")], &now()).unwrap().unwrap();
        assert!(path.ends_with("universities_batch_3_20250601_120000.json"));
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["name"], "A");
    }

    #[test]
    fn raw_html_lands_under_url_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_raw_html(
            &dir.path().join("raw"),
            "https://www.example.com/world-university-rankings/university-oxford?x=1",
            "<html></html>",
            &now(),
        )
        .unwrap();
        assert_eq!(
            path.file_name().unwrap(),
            "www_example_com_world_university_rankings_university_oxford_x_1_20250601_120000.html"
        );
        assert_eq!(fs::read_to_string(path).unwrap(), "<html></html>");
        assert_eq!(url_stem("://"), "page");
    }
}
