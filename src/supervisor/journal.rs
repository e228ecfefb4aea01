//! Child log handling: durable file, recent tail and live feed

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::warn;

const FEED_CAPACITY: usize = 256;

pub struct LogJournal {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
    tail: Mutex<VecDeque<String>>,
    capacity: usize,
    feed: broadcast::Sender<String>,
    /// Values replaced before a line is stored anywhere
    secrets: Mutex<Vec<String>>,
}

impl LogJournal {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
            tail: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            feed,
            secrets: Mutex::new(Vec::new()),
        }
    }

    /// Replace the redacted values, e.g. with the current stream key.
    pub fn set_secrets(&self, secrets: impl IntoIterator<Item = String>) {
        let mut current = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        *current = secrets.into_iter().filter(|s| !s.is_empty()).collect();
    }

    pub fn redact(&self, line: &str) -> String {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets
            .iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), "****"))
    }

    /// Live feed of recorded lines. Slow subscribers lag and lose lines.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<String> {
        let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }

    /// Store one line of child output. Blank lines are dropped.
    pub async fn record(&self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        let line = self.redact(line);

        self.append(&format!("[{}] {}\n", timestamp(), line)).await;

        {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() >= self.capacity {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }

        // No subscribers is fine.
        let _ = self.feed.send(line);
    }

    async fn append(&self, stamped: &str) {
        let mut file = self.file.lock().await;
        if file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path).await {
                Ok(opened) => *file = Some(opened),
                Err(e) => {
                    warn!("Failed to open log file {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        if let Some(handle) = file.as_mut() {
            let written = match handle.write_all(stamped.as_bytes()).await {
                Ok(()) => handle.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!("Failed to write log file: {}", e);
                *file = None;
            }
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS` in local time, falling back to UTC
fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_to_file_tail_and_feed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream_log.txt");
        let journal = LogJournal::new(&path, 2);
        let mut feed = journal.subscribe();

        for line in ["one", "", "two", "three"] {
            journal.record(line).await;
        }

        assert_eq!(journal.recent(), ["two", "three"]);
        assert_eq!(feed.recv().await.unwrap(), "one");

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        // [YYYY-MM-DD HH:MM:SS] one
        assert!(lines[0].starts_with('['));
        assert_eq!(&lines[0][20..], "] one");
    }

    #[tokio::test]
    async fn stream_key_never_reaches_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream_log.txt");
        let journal = LogJournal::new(&path, 8);
        journal.set_secrets([String::from("s3cr3t"), String::new()]);

        journal.record("Connecting to rtmp://a/live/s3cr3t").await;

        assert_eq!(journal.recent(), ["Connecting to rtmp://a/live/****"]);
        assert!(!std::fs::read_to_string(&path).unwrap().contains("s3cr3t"));
    }
}
