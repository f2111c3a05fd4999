//! Integration tests: fetch orchestration, cache-aware loading and full
//! screening runs against a scripted page source.

mod cache;
mod fetch;
mod mock_source;
mod pipeline;
