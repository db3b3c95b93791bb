//! Side-file snapshots for the in-memory backend.
//!
//! The file holds one JSON object per line:
//! `{"uuid": "...", "short_url": "<code>", "original_url": "..."}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("snapshot file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot line {line} is malformed: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot entry could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One line of the snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub uuid: String,
    pub short_url: String,
    pub original_url: String,
}

/// Loads and saves a `short code -> original url` map.
#[async_trait]
pub trait Backup: Send + Sync + 'static {
    async fn load(&self) -> Result<BTreeMap<String, String>, BackupError>;

    /// Merges `data` into whatever is already saved and rewrites the snapshot.
    async fn save(&self, data: &BTreeMap<String, String>) -> Result<(), BackupError>;
}

/// Newline-delimited JSON snapshot stored at a fixed path.
#[derive(Debug, Clone)]
pub struct FileBackup {
    path: PathBuf,
}

impl FileBackup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Backup for FileBackup {
    async fn load(&self) -> Result<BTreeMap<String, String>, BackupError> {
        let file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot file, starting empty");
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut data = BTreeMap::new();
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry: SnapshotEntry = serde_json::from_str(&line)
                .map_err(|source| BackupError::Malformed { line: line_no, source })?;
            data.insert(entry.short_url, entry.original_url);
        }

        debug!(path = %self.path.display(), entries = data.len(), "loaded snapshot");
        Ok(data)
    }

    async fn save(&self, data: &BTreeMap<String, String>) -> Result<(), BackupError> {
        let mut merged = self.load().await?;
        merged.extend(data.iter().map(|(code, url)| (code.clone(), url.clone())));

        let file = fs::File::create(&self.path).await?;
        let mut writer = BufWriter::new(file);
        for (short_url, original_url) in &merged {
            let entry = SnapshotEntry {
                uuid: Uuid::new_v4().to_string(),
                short_url: short_url.clone(),
                original_url: original_url.clone(),
            };
            let mut line = serde_json::to_vec(&entry).map_err(BackupError::Encode)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
        }
        writer.flush().await?;

        debug!(path = %self.path.display(), entries = merged.len(), "saved snapshot");
        Ok(())
    }
}
