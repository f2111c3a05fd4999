//! Remote data sources.
//!
//! Defines the `PageSource` trait (one page of one remote method per call)
//! and provides:
//! - `RestSource`: HTTP/JSON market-data API with cursor pagination

pub mod rest;

use async_trait::async_trait;

use crate::types::{Cursor, FetchSpec, Page, ScreenError};

/// Abstraction over a paginated remote data source.
///
/// Implementations classify their own failures: rate limits, timeouts and
/// server errors are `TransientSource`; bad requests and unknown methods are
/// `PermanentSource`. Retrying is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page. `cursor == None` requests the first page.
    async fn fetch_page(&self, spec: &FetchSpec, cursor: Option<Cursor>) -> Result<Page, ScreenError>;
}
