use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;

/// A page that could not be fetched. Aborts the run; pages already
/// processed stay applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("page {page}: {message}")]
pub struct SourceError {
    pub page: usize,
    pub message: String,
}

/// Yields pages of raw records in order. `Ok(None)` ends the run.
pub trait RecordSource {
    fn next_page(&mut self) -> Result<Option<Vec<Value>>, SourceError>;
}

/// In-memory pages, optionally failing at a given page.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    pages: VecDeque<Vec<Value>>,
    served: usize,
    fail_at: Option<(usize, String)>,
}

impl VecSource {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages: pages.into(),
            served: 0,
            fail_at: None,
        }
    }

    /// Splits `records` into pages of at most `page_size` records.
    pub fn paged(records: Vec<Value>, page_size: usize) -> Self {
        let size = page_size.max(1);
        let mut pages = Vec::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            pages.push(records.by_ref().take(size).collect());
        }
        Self::new(pages)
    }

    pub fn failing_at(mut self, page: usize, message: &str) -> Self {
        self.fail_at = Some((page, message.to_string()));
        self
    }
}

impl RecordSource for VecSource {
    fn next_page(&mut self) -> Result<Option<Vec<Value>>, SourceError> {
        let page = self.served;
        if let Some((at, message)) = &self.fail_at {
            if *at == page {
                return Err(SourceError {
                    page,
                    message: message.clone(),
                });
            }
        }
        let next = self.pages.pop_front();
        if next.is_some() {
            self.served += 1;
        }
        Ok(next)
    }
}
