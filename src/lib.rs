//! Batch scraping pipeline for university rankings: a paginated rankings
//! table, one detail page per university, and several output sinks.

pub mod batch;
pub mod combine;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod report;
pub mod retry;
pub mod sink;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;
