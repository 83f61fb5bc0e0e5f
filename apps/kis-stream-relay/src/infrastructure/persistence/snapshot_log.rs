//! Append-only snapshot CSV.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::FixedOffset;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::application::ports::{SnapshotLog, SnapshotLogError};
use crate::domain::streaming::{Snapshot, compact_date};

/// Header row written when the file is first created.
pub const CSV_HEADER: &str = "timestamp,stck_prpr,prdy_vrss,prdy_ctrt,stck_bsop_date";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Snapshot log backed by a CSV file.
#[derive(Debug)]
pub struct CsvSnapshotLog {
    path: PathBuf,
    offset: FixedOffset,
    // Serializes appends so rows never interleave.
    write_lock: Mutex<()>,
}

impl CsvSnapshotLog {
    /// Log to `path`, formatting timestamps in `offset`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            path: path.into(),
            offset,
            write_lock: Mutex::new(()),
        }
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row(&self, snapshot: &Snapshot) -> String {
        format!(
            "{},{},{},{},{}\n",
            snapshot
                .captured_at
                .with_timezone(&self.offset)
                .format(TIMESTAMP_FORMAT),
            snapshot.price,
            snapshot.change,
            snapshot.change_percent,
            snapshot.business_date.format(compact_date::FORMAT),
        )
    }
}

#[async_trait]
impl SnapshotLog for CsvSnapshotLog {
    async fn append(&self, snapshot: &Snapshot) -> Result<(), SnapshotLogError> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut chunk = String::new();
        if file.metadata().await?.len() == 0 {
            chunk.push_str(CSV_HEADER);
            chunk.push('\n');
        }
        chunk.push_str(&self.row(snapshot));

        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
