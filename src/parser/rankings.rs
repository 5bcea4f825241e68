use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use super::{parse_score, resolve_url, selector, text_of};
use crate::error::ParseError;
use crate::model::{RankingEntry, Scores};

static RANKINGS_TABLE: LazyLock<Selector> = LazyLock::new(|| selector("table#datatable-1"));
static ANY_TABLE: LazyLock<Selector> = LazyLock::new(|| selector("table"));
static ROW: LazyLock<Selector> = LazyLock::new(|| selector("tr"));
static CELL: LazyLock<Selector> = LazyLock::new(|| selector("td"));
static INSTITUTION: LazyLock<Selector> = LazyLock::new(|| selector("a.ranking-institution-title"));
static COUNTRY: LazyLock<Selector> = LazyLock::new(|| selector("div.location a"));

static RANK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^=?\s*(\d+)").unwrap());

/// Parse one rankings page. Rows that cannot be read, or that carry no
/// resolvable link, are skipped.
pub fn parse(html: &str, page_url: &str) -> Result<Vec<RankingEntry>, ParseError> {
    let document = Html::parse_document(html);
    let table = document
        .select(&RANKINGS_TABLE)
        .next()
        .or_else(|| {
            debug!(page_url, "no table#datatable-1, falling back to first table");
            document.select(&ANY_TABLE).next()
        })
        .ok_or_else(|| ParseError::MalformedInput(format!("no rankings table in {page_url}")))?;

    let mut entries = Vec::new();
    for (index, row) in table.select(&ROW).enumerate() {
        let cells: Vec<ElementRef<'_>> = row.select(&CELL).collect();
        // Header rows carry th cells only.
        if cells.len() < 2 {
            continue;
        }
        match parse_row(&cells, page_url) {
            Some(entry) => entries.push(entry),
            None => warn!(page_url, row = index, "skipping unreadable rankings row"),
        }
    }

    debug!(page_url, entries = entries.len(), "parsed rankings page");
    Ok(entries)
}

fn parse_row(cells: &[ElementRef<'_>], page_url: &str) -> Option<RankingEntry> {
    let rank = parse_rank(&text_of(cells[0]))?;
    let link = cells[1].select(&INSTITUTION).next()?;
    let name = text_of(link);
    if name.is_empty() {
        return None;
    }
    // Without a link the entry has no identity and no detail page.
    let detail_url = link.value().attr("href").and_then(|href| resolve_url(page_url, href))?;
    let country = cells[1].select(&COUNTRY).next().map(text_of).unwrap_or_default();

    let columns: Vec<Option<f64>> = cells.iter().skip(2).map(|c| parse_score(&text_of(*c))).collect();

    Some(RankingEntry {
        rank,
        name,
        country,
        detail_url,
        scores: Scores::from_columns(&columns),
    })
}

/// "=12" is a tie, "401-500" a band; both read as their lower bound.
pub fn parse_rank(text: &str) -> Option<u32> {
    RANK_RE
        .captures(text.trim())
        .and_then(|c| c[1].parse().ok())
}
