use std::collections::HashMap;

use crate::model::{CombinedRecord, DetailRecord, RankingEntry};

/// Join every ranking entry with the detail scraped from its `detail_url`.
///
/// Output follows ranking order and has exactly one record per entry.
/// Entries sharing a `detail_url` all get that page's detail. Details that
/// match no entry are dropped.
pub fn combine(rankings: Vec<RankingEntry>, details: Vec<DetailRecord>) -> Vec<CombinedRecord> {
    let by_url: HashMap<String, DetailRecord> = details
        .into_iter()
        .map(|d| (d.source_url.clone(), d))
        .collect();

    rankings
        .into_iter()
        .map(|entry| {
            let detail = by_url.get(&entry.detail_url).cloned();
            CombinedRecord::new(entry, detail)
        })
        .collect()
}
