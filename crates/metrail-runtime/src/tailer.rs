//! Polling file tailer.
//!
//! Tracks a read offset per log file and broadcasts each complete
//! appended line. A file that shrinks has been rotated; reading restarts
//! from the beginning. Partial trailing lines wait in a carry buffer for
//! the terminator to arrive.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::line::LogLine;

pub struct Tailer {
    paths: Vec<PathBuf>,
    offsets: HashMap<PathBuf, u64>,
    partial: HashMap<PathBuf, String>,
    tx: broadcast::Sender<Arc<LogLine>>,
}

impl Tailer {
    pub fn new(paths: Vec<PathBuf>, tx: broadcast::Sender<Arc<LogLine>>) -> Self {
        Self {
            paths,
            offsets: HashMap::new(),
            partial: HashMap::new(),
            tx,
        }
    }

    /// Poll the log files until shutdown.
    pub async fn run(mut self, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => self.poll_files().await,
            }
        }
        info!("tailer stopped");
    }

    /// One pass over every tracked file.
    pub async fn poll_files(&mut self) {
        for path in self.paths.clone() {
            if let Err(err) = self.poll_file(&path).await {
                warn!(path = %path.display(), "tail failed: {}", err);
            }
        }
    }

    async fn poll_file(&mut self, path: &PathBuf) -> std::io::Result<()> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), "not readable yet: {}", err);
                return Ok(());
            }
        };
        let size = meta.len();
        let mut offset = self.offsets.get(path).copied().unwrap_or(0);
        if size < offset {
            info!(path = %path.display(), "file shrank, assuming rotation");
            offset = 0;
            self.partial.remove(path);
        }
        if size == offset {
            return Ok(());
        }

        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity((size - offset) as usize);
        file.take(size - offset).read_to_end(&mut buf).await?;
        self.offsets.insert(path.clone(), offset + buf.len() as u64);

        let mut text = self.partial.remove(path).unwrap_or_default();
        text.push_str(&String::from_utf8_lossy(&buf));

        let mut rest = text.as_str();
        while let Some(nl) = rest.find('\n') {
            let line = rest[..nl].trim_end_matches('\r');
            let _ = self.tx.send(Arc::new(LogLine::new(Utc::now(), path, line)));
            rest = &rest[nl + 1..];
        }
        if !rest.is_empty() {
            self.partial.insert(path.clone(), rest.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_tail_reads_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\npart").unwrap();

        let (tx, mut rx) = broadcast::channel(16);
        let mut tailer = Tailer::new(vec![path.clone()], tx);
        tailer.poll_files().await;

        assert_eq!(rx.try_recv().unwrap().text, "one");
        assert_eq!(rx.try_recv().unwrap().text, "two");
        // The partial line waits for its terminator.
        assert!(rx.try_recv().is_err());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "ial").unwrap();
        tailer.poll_files().await;
        assert_eq!(rx.try_recv().unwrap().text, "partial");
    }

    #[tokio::test]
    async fn test_rotation_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a longer first generation\n").unwrap();

        let (tx, mut rx) = broadcast::channel(16);
        let mut tailer = Tailer::new(vec![path.clone()], tx);
        tailer.poll_files().await;
        assert_eq!(rx.try_recv().unwrap().text, "a longer first generation");

        // Rotated: replaced by a shorter file.
        std::fs::write(&path, "new\n").unwrap();
        tailer.poll_files().await;
        assert_eq!(rx.try_recv().unwrap().text, "new");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_fatal() {
        let (tx, _rx) = broadcast::channel(16);
        let mut tailer = Tailer::new(vec![PathBuf::from("/nonexistent/metrail.log")], tx);
        tailer.poll_files().await;
    }
}
