//! Append-only mutation journal.
//!
//! The store appends one [`JournalRecord`] per accepted change. Replaying the
//! records in order through [`ScanStore::restore`](super::store::ScanStore::restore)
//! rebuilds every job.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_model::JobId;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

use super::job::{JobMutation, JobSeed};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JournalEntry {
    Created(JobSeed),
    Mutated(JobMutation),
    Removed,
}

/// One line of the journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub job_id: JobId,
    /// Job revision after this entry was applied.
    pub revision: u64,
    pub recorded_at: DateTime<Utc>,
    pub entry: JournalEntry,
}

#[async_trait]
pub trait MutationJournal: Send + Sync + fmt::Debug {
    async fn append(&self, record: &JournalRecord) -> Result<()>;

    /// Makes every appended record durable.
    async fn flush(&self) -> Result<()>;
}

/// JSON-lines journal on the local filesystem.
pub struct JsonlJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl fmt::Debug for JsonlJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlJournal")
            .field("path", &self.path)
            .finish()
    }
}

impl JsonlJournal {
    /// Opens `path` for appending, creating it and its parent directories.
    /// A partial trailing line left by an interrupted write is cut off first
    /// so the next record starts on a line of its own.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        Self::truncate_partial_tail(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(target: "recon::journal", path = %path.display(), "journal opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    async fn truncate_partial_tail(path: &Path) -> Result<()> {
        let contents = match fs::read(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let keep = contents
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
        if keep == contents.len() {
            return Ok(());
        }

        warn!(
            target: "recon::journal",
            path = %path.display(),
            dropped_bytes = contents.len() - keep,
            "truncating partial trailing journal line"
        );
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(keep as u64).await?;
        file.sync_data().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record from `path`. A missing file yields no records; a
    /// truncated final line (interrupted write) is skipped with a warning.
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<(usize, &str)> = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (position, (line_no, line)) in lines.into_iter().enumerate() {
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) if position == last => {
                    warn!(
                        target: "recon::journal",
                        path = %path.display(),
                        line = line_no + 1,
                        error = %err,
                        "skipping truncated trailing journal line"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl MutationJournal for JsonlJournal {
    async fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Journal kept in memory; useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl MutationJournal for MemoryJournal {
    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use recon_model::{ScanType, Target};

    use super::*;

    fn created(job_id: JobId) -> JournalRecord {
        JournalRecord {
            job_id,
            revision: 1,
            recorded_at: Utc::now(),
            entry: JournalEntry::Created(JobSeed {
                scan_type: ScanType::DnsEnumeration,
                target: Target::parse("example.com").unwrap(),
                options: BTreeMap::from([("subdomains".to_string(), "www".to_string())]),
                sequence: 0,
                created_at: Utc::now(),
            }),
        }
    }

    #[tokio::test]
    async fn appended_records_load_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("recon.jsonl");
        let journal = JsonlJournal::open(&path).await.unwrap();

        let job_id = JobId::new();
        let first = created(job_id);
        let second = JournalRecord {
            job_id,
            revision: 2,
            recorded_at: Utc::now(),
            entry: JournalEntry::Mutated(JobMutation::Start { at: Utc::now() }),
        };
        journal.append(&first).await.unwrap();
        journal.append(&second).await.unwrap();
        journal.flush().await.unwrap();

        let loaded = JsonlJournal::load(&path).await.unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[tokio::test]
    async fn truncated_tail_is_skipped_but_corruption_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.jsonl");
        let record = serde_json::to_string(&created(JobId::new())).unwrap();

        tokio::fs::write(&path, format!("{record}\n{}", &record[..record.len() / 2]))
            .await
            .unwrap();
        assert_eq!(JsonlJournal::load(&path).await.unwrap().len(), 1);

        tokio::fs::write(&path, format!("{{garbage\n{record}\n"))
            .await
            .unwrap();
        assert!(JsonlJournal::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn reopening_after_truncated_tail_keeps_journal_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.jsonl");
        let job_id = JobId::new();
        let first = created(job_id);
        let line = serde_json::to_string(&first).unwrap();
        tokio::fs::write(&path, format!("{line}\n{}", &line[..line.len() / 2]))
            .await
            .unwrap();
        assert_eq!(JsonlJournal::load(&path).await.unwrap(), vec![first.clone()]);

        let journal = JsonlJournal::open(&path).await.unwrap();
        let started = JournalRecord {
            job_id,
            revision: 2,
            recorded_at: Utc::now(),
            entry: JournalEntry::Mutated(JobMutation::Start { at: Utc::now() }),
        };
        let completed = JournalRecord {
            job_id,
            revision: 3,
            recorded_at: Utc::now(),
            entry: JournalEntry::Mutated(JobMutation::Complete { at: Utc::now() }),
        };
        journal.append(&started).await.unwrap();
        journal.append(&completed).await.unwrap();
        journal.flush().await.unwrap();

        let loaded = JsonlJournal::load(&path).await.unwrap();
        assert_eq!(loaded, vec![first, started, completed]);
    }

    #[tokio::test]
    async fn partial_only_line_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.jsonl");
        tokio::fs::write(&path, "{\"job_id\":").await.unwrap();

        let journal = JsonlJournal::open(&path).await.unwrap();
        let record = created(JobId::new());
        journal.append(&record).await.unwrap();
        journal.flush().await.unwrap();

        assert_eq!(JsonlJournal::load(&path).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = JsonlJournal::load(dir.path().join("absent.jsonl"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
