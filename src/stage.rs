use std::sync::atomic::{AtomicBool, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, warn};

use crate::error::{ParseError, StageError};
use crate::fetch::{Fetcher, RawMarkup};
use crate::model::{DetailRecord, RankingEntry, Record, RecordType};
use crate::normalize::Normalizer;
use crate::parser::Parser;
use crate::retry::RetryPolicy;
use crate::sink::snapshot::save_raw_html;

/// Fetch, parse and normalize one unit of work.
///
/// Only the fetch is retried. Parse and validation failures surface on the
/// first attempt. Every failure is returned as a value for the batch runner
/// to record.
#[derive(Clone)]
pub struct StageExecutor {
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn Parser>,
    normalizer: Normalizer,
    retry: RetryPolicy,
    request_delay: Duration,
    render: bool,
    /// Set once the first fetch has started; later fetches are paced.
    fetched: Arc<AtomicBool>,
    raw_html_dir: Option<PathBuf>,
}

impl StageExecutor {
    pub fn new(fetcher: Arc<dyn Fetcher>, parser: Arc<dyn Parser>, normalizer: Normalizer, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            parser,
            normalizer,
            retry,
            request_delay: Duration::ZERO,
            render: true,
            fetched: Arc::new(AtomicBool::new(false)),
            raw_html_dir: None,
        }
    }

    /// Pause before every fetch but the first, so the run never ends idle.
    pub fn with_request_delay(mut self, request_delay: Duration) -> Self {
        self.request_delay = request_delay;
        self
    }

    pub fn with_render(mut self, render: bool) -> Self {
        self.render = render;
        self
    }

    /// Keep the markup of every fetched page under `dir`.
    pub fn with_raw_html_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw_html_dir = Some(dir.into());
        self
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Fetch with retry, then parse once into the requested record type.
    pub async fn execute(&self, url: &str, record_type: RecordType) -> Result<Record, StageError> {
        let markup = self.fetch(url).await?;
        let record = self.parser.parse(&markup, record_type)?;
        debug!(url, ?record_type, "parsed");
        Ok(record)
    }

    /// One rankings page, validated.
    pub async fn rankings(&self, url: &str) -> Result<Vec<RankingEntry>, StageError> {
        match self.execute(url, RecordType::Rankings).await? {
            Record::Rankings(entries) => Ok(self.normalizer.rankings(entries)?),
            Record::Detail(_) => Err(unexpected(url, "detail", "rankings")),
        }
    }

    /// The detail page behind one ranking entry, validated.
    pub async fn detail(&self, entry: &RankingEntry) -> Result<DetailRecord, StageError> {
        match self.execute(&entry.detail_url, RecordType::Detail).await? {
            Record::Detail(record) => Ok(self.normalizer.detail(record)?),
            Record::Rankings(_) => Err(unexpected(&entry.detail_url, "rankings", "detail")),
        }
    }

    async fn fetch(&self, url: &str) -> Result<RawMarkup, StageError> {
        if self.fetched.swap(true, Ordering::SeqCst) && !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        let markup = self
            .retry
            .execute(url, |_| self.fetcher.fetch(url, self.render))
            .await?;
        if let Some(dir) = &self.raw_html_dir {
            match save_raw_html(dir, url, &markup.body, &Local::now()) {
                Ok(path) => debug!(url, path = %path.display(), "saved raw html"),
                Err(e) => warn!(url, error = %e, "failed to save raw html"),
            }
        }
        Ok(markup)
    }
}

fn unexpected(url: &str, got: &str, wanted: &str) -> StageError {
    ParseError::MalformedInput(format!("parser returned a {got} record for {url}, expected {wanted}")).into()
}
