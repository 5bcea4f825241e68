pub mod detail;
pub mod rankings;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};

use crate::error::ParseError;
use crate::fetch::RawMarkup;
use crate::model::{Record, RecordType};

/// Turns fetched markup into a typed record.
pub trait Parser: Send + Sync {
    fn parse(&self, markup: &RawMarkup, record_type: RecordType) -> Result<Record, ParseError>;
}

/// HTML parser for the rankings table and university profile pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlParser;

impl Parser for HtmlParser {
    fn parse(&self, markup: &RawMarkup, record_type: RecordType) -> Result<Record, ParseError> {
        if markup.body.trim().is_empty() {
            return Err(ParseError::MalformedInput(format!("empty document from {}", markup.url)));
        }
        match record_type {
            RecordType::Rankings => rankings::parse(&markup.body, &markup.url).map(Record::Rankings),
            RecordType::Detail => detail::parse(&markup.body, &markup.url).map(Record::Detail),
        }
    }
}

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)").unwrap());

pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {css:?}: {e}"))
}

/// Whitespace-collapsed text content of an element.
pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// First number in a score cell; placeholders and empty cells are absent.
pub(crate) fn parse_score(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.is_empty() || matches!(t.to_lowercase().as_str(), "n/a" | "na" | "-" | "–") {
        return None;
    }
    if let Ok(v) = t.parse::<f64>() {
        return Some(v);
    }
    // Ranges like "18.5–28.2" carry no single score.
    if t.contains('–') || t.contains('-') {
        return None;
    }
    NUMBER_RE.captures(t).and_then(|c| c[1].parse().ok())
}

/// Resolve a possibly relative link against the page it appeared on.
pub(crate) fn resolve_url(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match reqwest::Url::parse(page_url) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => reqwest::Url::parse(href).ok().map(|u| u.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_placeholders() {
        assert_eq!(parse_score("94.2"), Some(94.2));
        assert_eq!(parse_score(" 88 "), Some(88.0));
        assert_eq!(parse_score("n/a"), None);
        assert_eq!(parse_score("–"), None);
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("18.5–28.2"), None);
        assert_eq!(parse_score("Score 71.5"), Some(71.5));
    }

    #[test]
    fn resolves_relative_links() {
        assert_eq!(
            resolve_url(
                "https://www.example.com/world-university-rankings/2025/results",
                "/world-university-rankings/university-oxford"
            )
            .as_deref(),
            Some("https://www.example.com/world-university-rankings/university-oxford")
        );
        assert_eq!(
            resolve_url("not a url", "https://a.example/x").as_deref(),
            Some("https://a.example/x")
        );
        assert_eq!(resolve_url("https://a.example", "  "), None);
    }

    #[test]
    fn empty_document_is_malformed() {
        let err = HtmlParser
            .parse(&RawMarkup::new("https://x", "  \n"), RecordType::Detail)
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedInput(_)));
    }
}
