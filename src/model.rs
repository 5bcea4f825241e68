use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The six score columns of the rankings table.
pub const SCORE_FIELDS: [&str; 6] = [
    "overall_score",
    "teaching_score",
    "research_score",
    "citations_score",
    "industry_income_score",
    "international_outlook_score",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub overall: Option<f64>,
    pub teaching: Option<f64>,
    pub research: Option<f64>,
    pub citations: Option<f64>,
    pub industry_income: Option<f64>,
    pub international_outlook: Option<f64>,
}

impl Scores {
    /// Scores in table column order, paired with their export names.
    pub fn fields(&self) -> [(&'static str, Option<f64>); 6] {
        [
            (SCORE_FIELDS[0], self.overall),
            (SCORE_FIELDS[1], self.teaching),
            (SCORE_FIELDS[2], self.research),
            (SCORE_FIELDS[3], self.citations),
            (SCORE_FIELDS[4], self.industry_income),
            (SCORE_FIELDS[5], self.international_outlook),
        ]
    }

    pub fn fields_mut(&mut self) -> [&mut Option<f64>; 6] {
        [
            &mut self.overall,
            &mut self.teaching,
            &mut self.research,
            &mut self.citations,
            &mut self.industry_income,
            &mut self.international_outlook,
        ]
    }

    /// Build from up to six parsed columns; missing columns stay absent.
    pub fn from_columns(columns: &[Option<f64>]) -> Self {
        let at = |i: usize| columns.get(i).copied().flatten();
        Self {
            overall: at(0),
            teaching: at(1),
            research: at(2),
            citations: at(3),
            industry_income: at(4),
            international_outlook: at(5),
        }
    }
}

/// Identity of a ranked entity. Rank is not part of it: re-scrapes reorder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub name: String,
    pub detail_url: String,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.detail_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: u32,
    pub name: String,
    pub country: String,
    pub detail_url: String,
    pub scores: Scores,
}

impl RankingEntry {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            name: self.name.clone(),
            detail_url: self.detail_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub rank: Option<String>,
    pub score: Option<f64>,
}

/// Everything scraped from one entity's detail page. Keyed by `source_url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub source_url: String,
    pub name: Option<String>,
    pub ranking_data: BTreeMap<String, String>,
    pub key_stats: BTreeMap<String, String>,
    pub subjects: Vec<Subject>,
    pub extra: BTreeMap<String, String>,
}

/// A ranking entry joined with its detail page, if one was scraped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedRecord {
    #[serde(flatten)]
    pub ranking: RankingEntry,
    pub detail: Option<DetailRecord>,
    pub detail_missing: bool,
    pub score_category: Option<ScoreCategory>,
}

impl CombinedRecord {
    pub fn new(ranking: RankingEntry, detail: Option<DetailRecord>) -> Self {
        let score_category = ranking.scores.overall.and_then(ScoreCategory::from_score);
        Self {
            detail_missing: detail.is_none(),
            ranking,
            detail,
            score_category,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.ranking.key()
    }
}

/// Banding of the overall score into (0, 30], (30, 50], (50, 70], (70, 90]
/// and (90, 100]. A score of exactly 0 falls in no band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScoreCategory {
    Poor,
    Fair,
    Good,
    #[serde(rename = "Very Good")]
    VeryGood,
    Excellent,
}

impl ScoreCategory {
    pub fn from_score(score: f64) -> Option<Self> {
        match score {
            s if s <= 0.0 || s > 100.0 || s.is_nan() => None,
            s if s <= 30.0 => Some(Self::Poor),
            s if s <= 50.0 => Some(Self::Fair),
            s if s <= 70.0 => Some(Self::Good),
            s if s <= 90.0 => Some(Self::VeryGood),
            _ => Some(Self::Excellent),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poor => "Poor",
            Self::Fair => "Fair",
            Self::Good => "Good",
            Self::VeryGood => "Very Good",
            Self::Excellent => "Excellent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Rankings,
    Detail,
}

/// Typed output of a parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Rankings(Vec<RankingEntry>),
    Detail(DetailRecord),
}
