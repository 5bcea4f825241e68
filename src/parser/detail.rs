use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{parse_score, selector, text_of};
use crate::error::ParseError;
use crate::model::{DetailRecord, Subject};

const DESCRIPTION_MIN_CHARS: usize = 50;
const DESCRIPTION_MAX_CHARS: usize = 500;

/// Tried in order; the first non-empty match names the university.
static NAME_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "h1.profile-header__title",
        "h1.hero-title",
        ".profile-header h1",
        ".university-name",
        ".institution-name",
        "h1",
    ]
    .into_iter()
    .map(selector)
    .collect()
});

static RANKING_CARD: LazyLock<Selector> =
    LazyLock::new(|| selector(".ranking-card, .rank-card, .profile-ranking, .university-ranking"));
static CARD_TITLE: LazyLock<Selector> = LazyLock::new(|| selector(".card-title, h3, h4, .ranking-title, .title"));
static CARD_RANK: LazyLock<Selector> = LazyLock::new(|| selector(".rank, .ranking-number, .position, .rank-position"));
static CARD_SCORE: LazyLock<Selector> = LazyLock::new(|| selector(".score, .ranking-score, .points"));
static CARD_YEAR: LazyLock<Selector> = LazyLock::new(|| selector(".year, .ranking-year, .period"));
static INDIVIDUAL_RANKS: LazyLock<Vec<(Selector, &'static str)>> = LazyLock::new(|| {
    vec![
        (selector(".world-rank"), "world_rank"),
        (selector(".overall-rank"), "overall_rank"),
        (selector(".reputation-rank"), "reputation_rank"),
        (selector(".global-rank"), "global_rank"),
    ]
});

static STATS_CONTAINER: LazyLock<Selector> = LazyLock::new(|| {
    selector(".key-stats, .university-stats, .profile-stats, .stats-container, .facts-figures")
});
static STAT_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".stat-item, .key-stat, .metric, .fact"));
static STAT_NAME: LazyLock<Selector> = LazyLock::new(|| selector(".stat-name, .label, .key, .metric-name"));
static STAT_VALUE: LazyLock<Selector> = LazyLock::new(|| selector(".stat-value, .value, .metric-value"));
static DL: LazyLock<Selector> = LazyLock::new(|| selector("dl"));
static DT: LazyLock<Selector> = LazyLock::new(|| selector("dt"));
static DD: LazyLock<Selector> = LazyLock::new(|| selector("dd"));
static INDIVIDUAL_STATS: LazyLock<Vec<(Selector, &'static str)>> = LazyLock::new(|| {
    vec![
        (selector(".student-count, .students"), "total_students"),
        (selector(".faculty-count, .staff"), "faculty_count"),
        (selector(".established, .founded, .year-established"), "established"),
        (selector(".campus-size, .campus"), "campus_size"),
        (selector(".international-students"), "international_students"),
        (selector(".student-faculty-ratio"), "student_faculty_ratio"),
    ]
});

static SUBJECTS_CONTAINER: LazyLock<Selector> = LazyLock::new(|| {
    selector(".subjects-section, .subject-rankings, .disciplines, .academic-areas, .subject-area")
});
static SUBJECT_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".subject-item, .discipline, .subject"));
static SUBJECT_NAME: LazyLock<Selector> = LazyLock::new(|| selector(".subject-name, .discipline-name, h3, h4, .name"));
static SUBJECT_RANK: LazyLock<Selector> = LazyLock::new(|| selector(".subject-rank, .rank, .position"));
static SUBJECT_SCORE: LazyLock<Selector> = LazyLock::new(|| selector(".subject-score, .score"));

static LOCATION: LazyLock<Selector> = LazyLock::new(|| selector(".location, .address, .country"));
static WEBSITE: LazyLock<Selector> = LazyLock::new(|| selector("a[href*='www.']"));
static DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| selector(".description, .about, .overview"));

static KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\s]").unwrap());
static RANK_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:rank(?:ed)?|position|#|no\.)\s*").unwrap());
static ORDINAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d)(?:st|nd|rd|th)\b").unwrap());
static APPROX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(?:approx\.?|about|around|~)\s*").unwrap());

/// Parse a university profile page. Only the name is required.
pub fn parse(html: &str, source_url: &str) -> Result<DetailRecord, ParseError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let name = NAME_SELECTORS
        .iter()
        .filter_map(|sel| document.select(sel).next())
        .map(text_of)
        .find(|text| !text.is_empty())
        .ok_or_else(|| ParseError::MissingField { field: "name".into() })?;

    let record = DetailRecord {
        source_url: source_url.to_string(),
        name: Some(name),
        ranking_data: ranking_data(root),
        key_stats: key_stats(root),
        subjects: subjects(root),
        extra: extra(root),
    };
    debug!(
        source_url,
        stats = record.key_stats.len(),
        subjects = record.subjects.len(),
        "parsed detail page"
    );
    Ok(record)
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().map(text_of).filter(|t| !t.is_empty())
}

/// "Student: Staff ratio" becomes "student_staff_ratio".
fn to_key(label: &str) -> String {
    KEY_RE
        .replace_all(&label.to_lowercase(), "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn clean_rank(text: &str) -> String {
    let text = RANK_PREFIX_RE.replace(text.trim(), "");
    ORDINAL_RE.replace_all(&text, "$1").trim().to_string()
}

fn clean_stat(text: &str) -> String {
    APPROX_RE.replace(text.trim(), "").trim().to_string()
}

fn ranking_data(root: ElementRef<'_>) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for card in root.select(&RANKING_CARD) {
        let title = first_text(card, &CARD_TITLE).unwrap_or_else(|| "general".into());
        let key = to_key(&title);
        if let Some(rank) = first_text(card, &CARD_RANK) {
            data.insert(format!("{key}_rank"), clean_rank(&rank));
        }
        if let Some(score) = first_text(card, &CARD_SCORE).as_deref().and_then(parse_score) {
            data.insert(format!("{key}_score"), score.to_string());
        }
        if let Some(year) = first_text(card, &CARD_YEAR) {
            data.insert(format!("{key}_year"), year);
        }
    }
    if data.is_empty() {
        for (sel, key) in INDIVIDUAL_RANKS.iter() {
            if let Some(rank) = first_text(root, sel) {
                data.insert((*key).to_string(), clean_rank(&rank));
            }
        }
    }
    data
}

fn stat_pair(item: ElementRef<'_>) -> Option<(String, String)> {
    if let (Some(name), Some(value)) = (first_text(item, &STAT_NAME), first_text(item, &STAT_VALUE)) {
        return Some((name, value));
    }
    let text = text_of(item);
    let (name, value) = text.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn key_stats(root: ElementRef<'_>) -> BTreeMap<String, String> {
    let mut stats = BTreeMap::new();
    for container in root.select(&STATS_CONTAINER) {
        for item in container.select(&STAT_ITEM) {
            if let Some((name, value)) = stat_pair(item) {
                if !name.is_empty() && !value.is_empty() {
                    stats.insert(to_key(&name), value);
                }
            }
        }
    }
    for dl in root.select(&DL) {
        for (dt, dd) in dl.select(&DT).zip(dl.select(&DD)) {
            let (name, value) = (text_of(dt), text_of(dd));
            if !name.is_empty() && !value.is_empty() {
                stats.insert(to_key(&name), value);
            }
        }
    }
    if stats.is_empty() {
        for (sel, key) in INDIVIDUAL_STATS.iter() {
            if let Some(value) = first_text(root, sel).map(|t| clean_stat(&t)) {
                if !value.is_empty() {
                    stats.insert((*key).to_string(), value);
                }
            }
        }
    }
    stats
}

fn subjects(root: ElementRef<'_>) -> Vec<Subject> {
    let mut seen = HashSet::new();
    let mut subjects = Vec::new();
    for container in root.select(&SUBJECTS_CONTAINER) {
        for item in container.select(&SUBJECT_ITEM) {
            let name = first_text(item, &SUBJECT_NAME)
                .or_else(|| item.text().map(str::trim).find(|t| !t.is_empty()).map(str::to_string));
            let Some(name) = name else { continue };
            if !seen.insert(name.to_lowercase()) {
                continue;
            }
            subjects.push(Subject {
                name,
                rank: first_text(item, &SUBJECT_RANK).map(|r| clean_rank(&r)),
                score: first_text(item, &SUBJECT_SCORE).as_deref().and_then(parse_score),
            });
        }
    }
    subjects
}

fn extra(root: ElementRef<'_>) -> BTreeMap<String, String> {
    let mut extra = BTreeMap::new();
    if let Some(location) = first_text(root, &LOCATION) {
        extra.insert("location".to_string(), location);
    }
    let website = root
        .select(&WEBSITE)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| !href.contains("timeshighereducation"));
    if let Some(href) = website {
        extra.insert("website".to_string(), href.to_string());
    }
    if let Some(description) = first_text(root, &DESCRIPTION).filter(|d| d.chars().count() > DESCRIPTION_MIN_CHARS) {
        let description = if description.chars().count() > DESCRIPTION_MAX_CHARS {
            let cut: String = description.chars().take(DESCRIPTION_MAX_CHARS).collect();
            format!("{cut}...")
        } else {
            description
        };
        extra.insert("description".to_string(), description);
    }
    extra
}
