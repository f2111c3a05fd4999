//! Core engine: parallel page fetching and the screening pipeline.
//!
//! - `queue`: shared cursor queue and page collector for fetch workers
//! - `fetcher`: first-page request, bounded worker pool, retry with backoff
//! - `join`: per-entity grouping of fetched datasets
//! - `pipeline`: FETCHING → JOINING → ANALYZING → SCORING state machine

pub mod fetcher;
pub mod join;
pub mod pipeline;
pub mod queue;
