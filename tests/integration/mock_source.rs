//! Scripted page source for integration testing.
//!
//! Provides a deterministic `PageSource` implementation that serves
//! pre-built pages per remote method, counts every call, and can inject
//! transient or permanent failures and per-page delays, all in-memory
//! with no external dependencies.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use screener::source::PageSource;
use screener::types::*;

/// Injected failure for one page of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail transiently this many times, then succeed.
    Transient(usize),
    /// Fail permanently on every call.
    Permanent,
}

/// A scripted page source for deterministic testing.
///
/// Page `i` of a method is served for cursor `"<method>#<i>"` (page 0 for
/// no cursor) and links to page `i + 1` while one exists.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Mutex<HashMap<String, Vec<Vec<Record>>>>,
    faults: Mutex<HashMap<(String, usize), Fault>>,
    delay: Mutex<Duration>,
    calls: Arc<Mutex<Vec<(String, usize)>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `pages` for `method`, replacing any earlier script.
    pub fn script(&self, method: &str, pages: Vec<Vec<Record>>) -> &Self {
        self.pages.lock().unwrap().insert(method.to_string(), pages);
        self
    }

    /// Inject `fault` on page `page` of `method`.
    pub fn fail(&self, method: &str, page: usize, fault: Fault) -> &Self {
        self.faults
            .lock()
            .unwrap()
            .insert((method.to_string(), page), fault);
        self
    }

    /// Delay every page by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Total calls made so far, failures included.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls made for one method.
    pub fn calls_for(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Calls made for one page of one method.
    pub fn calls_for_page(&self, method: &str, page: usize) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| m == method && *p == page)
            .count()
    }

    /// Records reached by following cursors sequentially.
    pub fn all_records(&self, method: &str) -> Vec<Record> {
        self.pages
            .lock()
            .unwrap()
            .get(method)
            .map(|pages| pages.concat())
            .unwrap_or_default()
    }

    fn page_index(method: &str, cursor: Option<&Cursor>) -> Result<usize, ScreenError> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .as_str()
                .strip_prefix(&format!("{method}#"))
                .and_then(|i| i.parse().ok())
                .ok_or_else(|| ScreenError::permanent(method, format!("bad cursor {}", c.as_str()))),
        }
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch_page(&self, spec: &FetchSpec, cursor: Option<Cursor>) -> Result<Page, ScreenError> {
        let method = spec.method.clone();
        let index = Self::page_index(&method, cursor.as_ref())?;
        self.calls.lock().unwrap().push((method.clone(), index));

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut faults = self.faults.lock().unwrap();
            match faults.get_mut(&(method.clone(), index)) {
                Some(Fault::Permanent) => {
                    return Err(ScreenError::permanent(&method, "HTTP 403: forbidden"));
                }
                Some(Fault::Transient(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(ScreenError::transient(&method, "HTTP 429: slow down"));
                }
                _ => {}
            }
        }

        let pages = self.pages.lock().unwrap();
        let Some(script) = pages.get(&method) else {
            return Ok(Page::terminal(Vec::new()));
        };
        let records = script.get(index).cloned().unwrap_or_default();
        if index + 1 < script.len() {
            Ok(Page::with_next(records, format!("{method}#{}", index + 1)))
        } else {
            Ok(Page::terminal(records))
        }
    }
}

/// Build a record from a JSON object literal.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// `count` pages of `per_page` numbered records each.
pub fn numbered_pages(count: usize, per_page: usize) -> Vec<Vec<Record>> {
    (0..count)
        .map(|p| {
            (0..per_page)
                .map(|i| record(json!({"id": p * per_page + i, "page": p})))
                .collect()
        })
        .collect()
}
