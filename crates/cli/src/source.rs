use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use ordersync_engine::{RecordSource, SourceError};

/// Serves one page per JSON file, in the order given.
///
/// A file holds either a bare array of records or the API's page envelope,
/// an object whose `items` field is that array.
pub struct JsonFileSource {
    files: VecDeque<PathBuf>,
    page: usize,
}

impl JsonFileSource {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files: files.into(),
            page: 0,
        }
    }

    fn error(&self, message: String) -> SourceError {
        SourceError {
            page: self.page,
            message,
        }
    }
}

impl RecordSource for JsonFileSource {
    fn next_page(&mut self) -> Result<Option<Vec<Value>>, SourceError> {
        let Some(path) = self.files.pop_front() else {
            return Ok(None);
        };
        let text = fs::read_to_string(&path)
            .map_err(|e| self.error(format!("reading {}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| self.error(format!("parsing {}: {e}", path.display())))?;

        let records = match value {
            Value::Array(records) => records,
            Value::Object(mut page) => match page.remove("items") {
                Some(Value::Array(records)) => records,
                _ => {
                    return Err(self.error(format!("{} has no items array", path.display())));
                }
            },
            _ => {
                return Err(self.error(format!(
                    "{} is neither an array nor a page object",
                    path.display()
                )));
            }
        };
        debug!(page = self.page, file = %path.display(), records = records.len(), "page read");
        self.page += 1;
        Ok(Some(records))
    }
}
