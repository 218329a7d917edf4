//! Per-variant append-only log files
//!
//! Each runtime key owns one file. Lifecycle markers carry a timestamp
//! prefix; process output is appended raw. Files are never rotated or
//! truncated here, only trimmed when read.

use crate::process::RuntimeKey;
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LOG_FILE_NAME: &str = "output.log";
const VARIANTS_DIR: &str = "variants";

/// Path of the log file for a key under `logs_dir`
pub fn log_path(logs_dir: &Path, key: &RuntimeKey) -> PathBuf {
    let mut path = logs_dir.join(encode_component(&key.server));
    if let Some(ref variant) = key.variant {
        path.push(VARIANTS_DIR);
        path.push(encode_component(variant));
    }
    path.push(LOG_FILE_NAME);
    path
}

/// Reversible file-name encoding of a key component.
///
/// Distinct names always map to distinct components, and `.`/`..` are
/// escaped so a component never walks the directory tree.
fn encode_component(component: &str) -> String {
    if !component.is_empty() && component.chars().all(|c| c == '.') {
        return component.replace('.', "%2E");
    }
    urlencoding::encode(component).into_owned()
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Writer half of a key's log file.
///
/// Clones share one file handle so markers and output from several tasks
/// interleave at write granularity. Writes after [`close`](LogSink::close)
/// are discarded.
#[derive(Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    /// Open (creating if needed) the log file for `key` in append mode
    pub async fn open(logs_dir: &Path, key: &RuntimeKey) -> std::io::Result<Self> {
        let path = log_path(logs_dir, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped lifecycle marker line
    pub async fn marker(&self, message: &str) -> std::io::Result<()> {
        let line = format!("[{}] {}\n", timestamp(), message);
        self.write_raw(line.as_bytes()).await
    }

    /// Append the marker block separator
    pub async fn separator(&self) -> std::io::Result<()> {
        self.write_raw(b"---\n").await
    }

    /// Append raw process output
    pub async fn write_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        match guard.as_mut() {
            Some(file) => file.write_all(bytes).await,
            None => Ok(()),
        }
    }

    /// Flush and release the file handle
    pub async fn close(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Last `lines` lines of the log for `key`, or an empty string if it has none.
///
/// The file is read whole; a `lines` larger than the file returns all of it.
pub async fn read_tail(logs_dir: &Path, key: &RuntimeKey, lines: usize) -> std::io::Result<String> {
    let path = log_path(logs_dir, key);
    let content = match tokio::fs::read(&path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    Ok(tail(&content, lines))
}

fn tail(content: &str, lines: usize) -> String {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
