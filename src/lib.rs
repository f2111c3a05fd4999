//! SCREENER: parallel market-data fetch, partitioned cache and
//! multi-factor equity screening.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod analysis;
pub mod config;
pub mod engine;
pub mod source;
pub mod storage;
pub mod strategy;
pub mod types;
