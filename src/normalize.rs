use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;
use crate::model::{DetailRecord, RankingEntry, SCORE_FIELDS};

/// How absent scores are filled once the ranking list is complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingScores {
    #[default]
    Keep,
    Zero,
    Mean,
    Median,
}

/// The "process" step applied after parsing: trim, drop blanks, validate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    pub min_score: f64,
    pub max_score: f64,
    pub missing_scores: MissingScores,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            max_score: 100.0,
            missing_scores: MissingScores::Keep,
        }
    }
}

impl Normalizer {
    /// Clean and validate one parsed rankings page.
    pub fn rankings(&self, entries: Vec<RankingEntry>) -> Result<Vec<RankingEntry>, ValidationError> {
        let mut seen = HashSet::with_capacity(entries.len());
        entries
            .into_iter()
            .map(|mut entry| {
                entry.name = entry.name.trim().to_string();
                entry.country = entry.country.trim().to_string();
                entry.detail_url = entry.detail_url.trim().to_string();
                self.validate_entry(&entry)?;
                if !seen.insert(entry.key()) {
                    return Err(ValidationError::DuplicateKey(entry.key().to_string()));
                }
                Ok(entry)
            })
            .collect()
    }

    /// Clean and validate one parsed detail page.
    pub fn detail(&self, mut record: DetailRecord) -> Result<DetailRecord, ValidationError> {
        record.source_url = record.source_url.trim().to_string();
        check_url("source_url", &record.source_url)?;
        record.name = record.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

        for map in [&mut record.ranking_data, &mut record.key_stats, &mut record.extra] {
            map.retain(|_, v| !v.trim().is_empty());
            map.values_mut().for_each(|v| *v = v.trim().to_string());
        }

        record.subjects.retain(|s| !s.name.trim().is_empty());
        for subject in &mut record.subjects {
            subject.name = subject.name.trim().to_string();
            subject.rank = subject.rank.take().map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
            if let Some(score) = subject.score {
                self.check_score(&format!("subject '{}' score", subject.name), score)?;
            }
        }
        Ok(record)
    }

    /// Fill absent scores column by column across the whole ranking list.
    pub fn fill_missing(&self, entries: &mut [RankingEntry]) {
        if self.missing_scores == MissingScores::Keep || entries.is_empty() {
            return;
        }
        for (column, field) in SCORE_FIELDS.iter().enumerate() {
            let present: Vec<f64> = entries
                .iter()
                .filter_map(|e| e.scores.fields()[column].1)
                .collect();
            let Some(fill) = self.fill_value(present) else {
                continue;
            };
            let mut filled = 0usize;
            for entry in entries.iter_mut() {
                if let Some(slot) = entry.scores.fields_mut().into_iter().nth(column) {
                    if slot.is_none() {
                        *slot = Some(fill);
                        filled += 1;
                    }
                }
            }
            if filled > 0 {
                debug!(field, filled, fill, "filled missing scores");
            }
        }
    }

    fn fill_value(&self, mut present: Vec<f64>) -> Option<f64> {
        match self.missing_scores {
            MissingScores::Keep => None,
            MissingScores::Zero => Some(0.0),
            _ if present.is_empty() => None,
            MissingScores::Mean => Some(present.iter().sum::<f64>() / present.len() as f64),
            MissingScores::Median => {
                present.sort_by(f64::total_cmp);
                let mid = present.len() / 2;
                Some(if present.len() % 2 == 0 {
                    (present[mid - 1] + present[mid]) / 2.0
                } else {
                    present[mid]
                })
            }
        }
    }

    fn validate_entry(&self, entry: &RankingEntry) -> Result<(), ValidationError> {
        if entry.rank < 1 {
            return Err(ValidationError::Invalid {
                field: "rank".into(),
                reason: format!("{} must be at least 1", entry.rank),
            });
        }
        if entry.name.is_empty() {
            return Err(ValidationError::Invalid {
                field: "name".into(),
                reason: format!("blank name at rank {}", entry.rank),
            });
        }
        check_url("detail_url", &entry.detail_url)?;
        for (field, score) in entry.scores.fields() {
            if let Some(score) = score {
                self.check_score(field, score)?;
            }
        }
        Ok(())
    }

    fn check_score(&self, field: &str, value: f64) -> Result<(), ValidationError> {
        if value.is_finite() && (self.min_score..=self.max_score).contains(&value) {
            return Ok(());
        }
        Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            min: self.min_score,
            max: self.max_score,
        })
    }
}

fn check_url(field: &str, url: &str) -> Result<(), ValidationError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(());
    }
    Err(ValidationError::Invalid {
        field: field.to_string(),
        reason: format!("'{url}' is not an http(s) URL"),
    })
}
