//! Dedicated writer thread for the audit journal file.
//!
//! The writer owns the file exclusively. Every record is fully written
//! and flushed to disk before the append call returns, so the
//! orchestrator never acknowledges progression past an event that was
//! not durably recorded.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use super::{AuditRecord, GENESIS_HASH};
use crate::error::{Result, TabError};

enum WriteCommand {
    Append {
        record: Box<AuditRecord>,
        response: tokio::sync::oneshot::Sender<Result<AuditRecord>>,
    },
    Shutdown,
}

struct JournalInner {
    tx: Sender<WriteCommand>,
    path: PathBuf,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the append-only journal. Cheap to clone; all clones feed the
/// same single writer.
#[derive(Clone)]
pub struct AuditJournal {
    inner: Arc<JournalInner>,
}

impl AuditJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| TabError::Journal(format!("create journal dir: {}", e)))?;
        }

        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = path.clone();

        let handle = thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || match Writer::init(&thread_path) {
                Ok(writer) => {
                    let _ = ready_tx.send(Ok(()));
                    writer.run(rx);
                }
                Err(e) => {
                    error!(error = %e, "Audit writer init failed");
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| TabError::Journal(format!("spawn writer thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| TabError::Journal("writer thread died during init".into()))??;

        Ok(Self {
            inner: Arc::new(JournalInner {
                tx,
                path,
                handle: parking_lot::Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Append a record. The writer assigns `prev_hash`, persists, flushes
    /// and returns the chained record.
    pub async fn append(&self, record: AuditRecord) -> Result<AuditRecord> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.inner
            .tx
            .send(WriteCommand::Append {
                record: Box::new(record),
                response: tx,
            })
            .map_err(|_| TabError::Journal("writer thread disconnected".into()))?;

        rx.await
            .map_err(|_| TabError::Journal("writer response channel dropped".into()))?
    }
}

impl Drop for JournalInner {
    fn drop(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take()
            && let Err(e) = handle.join()
        {
            warn!("Audit writer thread panicked: {:?}", e);
        }
    }
}

struct Writer {
    file: File,
    last_hash: String,
}

impl Writer {
    fn init(path: &Path) -> Result<Self> {
        // A journal that cannot be parsed must not be appended to; that
        // would fork the chain.
        let last_hash = read_records(path)?
            .last()
            .map(|r| r.digest())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TabError::Journal(format!("open journal: {}", e)))?;

        Ok(Self { file, last_hash })
    }

    fn run(mut self, rx: Receiver<WriteCommand>) {
        for command in rx {
            match command {
                WriteCommand::Append { record, response } => {
                    let result = self.append(*record);
                    let _ = response.send(result);
                }
                WriteCommand::Shutdown => {
                    debug!("Audit writer received shutdown");
                    break;
                }
            }
        }
    }

    fn append(&mut self, mut record: AuditRecord) -> Result<AuditRecord> {
        record.prev_hash = self.last_hash.clone();
        let line = record.canonical();

        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| TabError::Journal(format!("append record: {}", e)))?;

        self.last_hash = record.digest();
        debug!(
            record_id = %record.record_id,
            session_id = %record.session_id,
            kind = ?record.event_kind,
            "Audit record flushed"
        );
        Ok(record)
    }
}

/// Chain verification failure at a specific record index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    pub index: usize,
    pub detail: String,
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain broken at record {}: {}", self.index, self.detail)
    }
}

/// Read all records in order. A line that fails to parse aborts the read
/// with a `Journal` error carrying its index.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).map_err(|e| TabError::Journal(format!("open journal: {}", e)))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| TabError::Journal(format!("read line {}: {}", index, e)))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(&line)
            .map_err(|e| TabError::Journal(format!("parse record {}: {}", index, e)))?;
        records.push(record);
    }
    Ok(records)
}

/// Single linear pass over the chain.
///
/// Reports the index of the record whose digest no longer matches its
/// successor's back-pointer (or whose own back-pointer is wrong, for the
/// genesis record).
pub fn verify_chain(records: &[AuditRecord]) -> std::result::Result<usize, VerifyFailure> {
    if records.is_empty() {
        return Ok(0);
    }

    if records[0].prev_hash != GENESIS_HASH {
        return Err(VerifyFailure {
            index: 0,
            detail: "first record does not point at genesis".to_string(),
        });
    }

    for i in 0..records.len() - 1 {
        let expected = records[i].digest();
        if records[i + 1].prev_hash != expected {
            return Err(VerifyFailure {
                index: i,
                detail: format!(
                    "digest mismatch: successor expects {}, record hashes to {}",
                    records[i + 1].prev_hash,
                    expected
                ),
            });
        }
    }

    Ok(records.len())
}
