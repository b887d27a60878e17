//! Log line records, as produced by the tailer.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// One log line, stripped of its terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// When the line was read.
    pub ts: DateTime<Utc>,
    /// The file it came from.
    pub path: PathBuf,
    pub text: String,
}

impl LogLine {
    pub fn new(ts: DateTime<Utc>, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            ts,
            path: path.into(),
            text: text.into(),
        }
    }
}
