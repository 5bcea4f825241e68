use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::debug;

use super::{ConflictPolicy, Sink, WriteSummary};
use crate::error::SinkError;
use crate::model::{CombinedRecord, EntityKey};
use crate::report::RunReport;

/// Relational sink. Rows are keyed by (university_name, university_url)
/// without a uniqueness constraint, so `append` may store duplicates.
pub struct SqliteSink {
    conn: Connection,
    target: String,
    policy: ConflictPolicy,
    required: bool,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>, policy: ConflictPolicy, required: bool) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = connect(path)?;
        Ok(Self {
            conn,
            target: path.display().to_string(),
            policy,
            required,
        })
    }

    pub fn in_memory(policy: ConflictPolicy) -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory().map_err(|e| SinkError::ConnectionFailed(e.to_string()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn,
            target: ":memory:".to_string(),
            policy,
            required: false,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Open the database file and make sure the schema exists.
pub fn connect(path: &Path) -> Result<Connection, SinkError> {
    let conn = Connection::open(path).map_err(|e| SinkError::ConnectionFailed(format!("{}: {}", path.display(), e)))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| SinkError::ConnectionFailed(e.to_string()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<(), SinkError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS university_rankings (
            id                          INTEGER PRIMARY KEY,
            university_name             TEXT NOT NULL,
            university_url              TEXT NOT NULL,
            rank                        INTEGER NOT NULL,
            country                     TEXT,
            overall_score               REAL,
            teaching_score              REAL,
            research_score              REAL,
            citations_score             REAL,
            industry_income_score       REAL,
            international_outlook_score REAL,
            score_category              TEXT,
            detail_missing              BOOLEAN NOT NULL DEFAULT 0,
            detail                      TEXT,
            updated_at                  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_rankings_key ON university_rankings(university_name, university_url);
        CREATE INDEX IF NOT EXISTS idx_rankings_rank ON university_rankings(rank);

        CREATE TABLE IF NOT EXISTS scrape_sessions (
            run_id         TEXT PRIMARY KEY,
            started_at     TEXT NOT NULL,
            finished_at    TEXT NOT NULL,
            status         TEXT NOT NULL,
            final_state    TEXT NOT NULL,
            failed_stage   TEXT,
            records        INTEGER NOT NULL,
            detail_missing INTEGER NOT NULL,
            stages         TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

const INSERT_SQL: &str = "INSERT INTO university_rankings
     (university_name, university_url, rank, country, overall_score, teaching_score,
      research_score, citations_score, industry_income_score, international_outlook_score,
      score_category, detail_missing, detail)
     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)";

const UPDATE_SQL: &str = "UPDATE university_rankings SET
     rank = ?3, country = ?4, overall_score = ?5, teaching_score = ?6, research_score = ?7,
     citations_score = ?8, industry_income_score = ?9, international_outlook_score = ?10,
     score_category = ?11, detail_missing = ?12, detail = ?13, updated_at = datetime('now')
     WHERE university_name = ?1 AND university_url = ?2";

fn key_exists(tx: &Transaction<'_>, key: &EntityKey) -> Result<bool, SinkError> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM university_rankings WHERE university_name = ?1 AND university_url = ?2 LIMIT 1",
            params![key.name, key.detail_url],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Reject the whole batch if any key is already stored or repeats in it.
fn check_conflicts(tx: &Transaction<'_>, records: &[CombinedRecord]) -> Result<(), SinkError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        let key = record.key();
        if !seen.insert(key.clone()) || key_exists(tx, &key)? {
            return Err(SinkError::ConflictDetected { key: key.to_string() });
        }
    }
    Ok(())
}

impl Sink for SqliteSink {
    fn name(&self) -> &str {
        "database"
    }

    fn required(&self) -> bool {
        self.required
    }

    /// One transaction per call. Any error rolls the whole write back.
    fn write(&self, records: &[CombinedRecord]) -> Result<WriteSummary, SinkError> {
        let tx = self.conn.unchecked_transaction()?;
        if self.policy == ConflictPolicy::Fail {
            check_conflicts(&tx, records)?;
        }
        let (mut inserted, mut updated) = (0usize, 0usize);
        {
            let mut insert = tx.prepare(INSERT_SQL)?;
            let mut update = tx.prepare(UPDATE_SQL)?;
            for r in records {
                let e = &r.ranking;
                let s = &e.scores;
                let detail = r.detail.as_ref().map(serde_json::to_string).transpose()?;
                let category = r.score_category.map(|c| c.as_str());
                let values = params![
                    e.name, e.detail_url, e.rank, e.country, s.overall, s.teaching, s.research,
                    s.citations, s.industry_income, s.international_outlook, category,
                    r.detail_missing, detail,
                ];
                if self.policy == ConflictPolicy::Replace && update.execute(values)? > 0 {
                    updated += 1;
                    continue;
                }
                insert.execute(values)?;
                inserted += 1;
            }
        }
        tx.commit()?;
        debug!(inserted, updated, policy = ?self.policy, "database write committed");
        Ok(WriteSummary {
            rows: inserted + updated,
            target: self.target.clone(),
        })
    }

    fn record_run(&self, report: &RunReport) -> Result<(), SinkError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO scrape_sessions
             (run_id, started_at, finished_at, status, final_state, failed_stage, records, detail_missing, stages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.run_id,
                report.started_at.to_rfc3339(),
                report.finished_at.to_rfc3339(),
                report.overall_status.to_string(),
                report.final_state.to_string(),
                report.failed_stage.map(|s| s.to_string()),
                report.records,
                report.detail_missing,
                serde_json::to_string(&report.stage_outcomes)?,
            ],
        )?;
        Ok(())
    }
}

// ── Stats ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub rows: usize,
    pub entities: usize,
    pub detail_missing: usize,
    pub runs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRow {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: String,
    pub records: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats, SinkError> {
    let rows: usize = conn.query_row("SELECT COUNT(*) FROM university_rankings", [], |r| r.get(0))?;
    let entities: usize = conn.query_row(
        "SELECT COUNT(*) FROM (SELECT DISTINCT university_name, university_url FROM university_rankings)",
        [],
        |r| r.get(0),
    )?;
    let detail_missing: usize = conn.query_row(
        "SELECT COUNT(*) FROM university_rankings WHERE detail_missing = 1",
        [],
        |r| r.get(0),
    )?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM scrape_sessions", [], |r| r.get(0))?;
    Ok(Stats {
        rows,
        entities,
        detail_missing,
        runs,
    })
}

pub fn recent_sessions(conn: &Connection, limit: usize) -> Result<Vec<SessionRow>, SinkError> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, finished_at, status, records
         FROM scrape_sessions
         ORDER BY started_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(SessionRow {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                finished_at: row.get(2)?,
                status: row.get(3)?,
                records: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{combined, report_with_status};
    use crate::report::OverallStatus;

    fn count(sink: &SqliteSink) -> usize {
        get_stats(sink.connection()).unwrap().rows
    }

    #[test]
    fn replace_updates_in_place() {
        let sink = SqliteSink::in_memory(ConflictPolicy::Replace).unwrap();
        sink.write(&[combined(1, "A", true), combined(2, "B", false)]).unwrap();

        let mut moved = combined(1, "A", true);
        moved.ranking.rank = 5;
        let summary = sink.write(&[moved, combined(3, "C", true)]).unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(count(&sink), 3);

        let rank: u32 = sink
            .connection()
            .query_row("SELECT rank FROM university_rankings WHERE university_name = 'A'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rank, 5);
    }

    #[test]
    fn append_allows_duplicates() {
        let sink = SqliteSink::in_memory(ConflictPolicy::Append).unwrap();
        sink.write(&[combined(1, "A", true)]).unwrap();
        sink.write(&[combined(1, "A", true)]).unwrap();
        let stats = get_stats(sink.connection()).unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.entities, 1);
    }

    #[test]
    fn fail_rejects_existing_key_and_writes_nothing() {
        let sink = SqliteSink::in_memory(ConflictPolicy::Fail).unwrap();
        sink.write(&[combined(1, "A", true)]).unwrap();

        let err = sink.write(&[combined(2, "B", true), combined(1, "A", true)]).unwrap_err();
        assert!(matches!(err, SinkError::ConflictDetected { ref key } if key.starts_with("A <")));
        assert_eq!(count(&sink), 1, "no partial write");
    }

    #[test]
    fn fail_rejects_duplicates_within_batch() {
        let sink = SqliteSink::in_memory(ConflictPolicy::Fail).unwrap();
        let err = sink.write(&[combined(1, "A", true), combined(1, "A", true)]).unwrap_err();
        assert!(matches!(err, SinkError::ConflictDetected { .. }));
        assert_eq!(count(&sink), 0);
    }

    #[test]
    fn records_runs() {
        let sink = SqliteSink::in_memory(ConflictPolicy::Replace).unwrap();
        let report = report_with_status("run_20250101_000000", OverallStatus::PartialSuccess);
        sink.record_run(&report).unwrap();
        sink.record_run(&report).unwrap();

        let sessions = recent_sessions(sink.connection(), 10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].run_id, "run_20250101_000000");
        assert_eq!(sessions[0].status, "partial_success");
    }

    #[test]
    fn file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/rankings.sqlite");
        let sink = SqliteSink::open(&path, ConflictPolicy::Append, true).unwrap();
        sink.write(&[combined(1, "A", false)]).unwrap();
        assert!(path.exists());
        assert!(sink.required());
    }
}
