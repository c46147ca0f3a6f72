//! File-backed operation log
//!
//! Record format: [MAGIC][LOG_ID][TYPE_ID][PAYLOAD_LEN][PAYLOAD][CRC32]
//!
//! All integers are little-endian. The CRC covers every field between the
//! magic and the checksum. On open the file is replayed into memory; a torn
//! or corrupted tail is truncated so later appends stay readable.
//!
//! An entry counts as persistent once the sync policy has been honoured for
//! it: fsync after the write (`Always`), the next periodic `sync` call
//! (`Interval`), or the write reaching the OS (`Never`).

use super::{range_of, LogEntry, LogId, OperationLog};
use crate::common::{crc32, Error, Result, WalSyncPolicy};
use crate::master::operation::StructuralOperation;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_MAGIC: [u8; 4] = [0x53, 0x4F, 0x4C, 0x31]; // "SOL1"
const HEADER_LEN: u64 = 4 + 8 + 4 + 4;
const CRC_LEN: u64 = 4;
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Result of scanning a log file
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    /// Number of intact records delivered to the callback
    pub entries: usize,
    /// Byte length of the intact prefix
    pub valid_bytes: u64,
    /// Why the scan stopped early, if it did
    pub corruption: Option<String>,
}

struct Inner {
    file: File,
    /// Length of the intact prefix; a failed write is cut back to it
    len: u64,
    entries: Vec<LogEntry>,
    next_id: u64,
    persisted: Option<LogId>,
    /// A partial record could not be removed
    failed: bool,
}

impl Inner {
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len) {
            tracing::error!(
                len = self.len,
                "Failed to remove partial record, refusing further appends: {}",
                e
            );
            self.failed = true;
        }
    }
}

/// Operation log persisted to a single append-only file
pub struct FileOperationLog {
    path: PathBuf,
    sync_policy: WalSyncPolicy,
    inner: Mutex<Inner>,
}

impl FileOperationLog {
    /// Open or create the log, replaying existing records.
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        let outcome = Self::replay(&path, |entry| {
            entries.push(entry);
            Ok(())
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if outcome.corruption.is_some() || file_len > outcome.valid_bytes {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = outcome.valid_bytes,
                file_len,
                "Truncating operation log tail: {}",
                outcome.corruption.as_deref().unwrap_or("partial record")
            );
            file.set_len(outcome.valid_bytes)?;
        }

        let next_id = entries.last().map(|e| e.id.value() + 1).unwrap_or(0);
        let persisted = entries.last().map(|e| e.id);

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            "Operation log opened"
        );

        Ok(Self {
            path,
            sync_policy,
            inner: Mutex::new(Inner {
                file,
                len: outcome.valid_bytes,
                entries,
                next_id,
                persisted,
                failed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scan a log file, handing each intact record to `callback`.
    ///
    /// Stops at the first corrupted or truncated record and reports it in
    /// the outcome instead of failing.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<ReplayOutcome>
    where
        F: FnMut(LogEntry) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReplayOutcome::default())
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut outcome = ReplayOutcome::default();

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((entry, len))) => {
                    callback(entry)?;
                    outcome.entries += 1;
                    outcome.valid_bytes += len;
                }
                Ok(None) => break,
                Err(e) => {
                    outcome.corruption = Some(e.to_string());
                    break;
                }
            }
        }

        Ok(outcome)
    }

    /// Encode one record, refusing payloads replay would reject
    fn encode_record(id: LogId, op: &StructuralOperation) -> Result<Vec<u8>> {
        let payload = op.encode_payload()?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Codec(format!(
                "{} payload of {} bytes exceeds the {} byte limit",
                op,
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        let mut record =
            Vec::with_capacity(HEADER_LEN as usize + payload.len() + CRC_LEN as usize);
        record.extend_from_slice(&LOG_MAGIC);
        record.extend_from_slice(&id.value().to_le_bytes());
        record.extend_from_slice(&op.type_id().to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        let checksum = crc32(&record[LOG_MAGIC.len()..]);
        record.extend_from_slice(&checksum.to_le_bytes());
        Ok(record)
    }

    fn write_record(&self, inner: &mut Inner, record: &[u8]) -> Result<()> {
        inner.file.write_all(record)?;
        if self.sync_policy == WalSyncPolicy::Always {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// Read one record; `Ok(None)` at a clean end of file
    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(LogEntry, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::Corrupted("invalid record magic".into()));
        }

        let mut header = [0u8; 16];
        reader.read_exact(&mut header)?;
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&header[..8]);
        let mut type_bytes = [0u8; 4];
        type_bytes.copy_from_slice(&header[8..12]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[12..16]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::Corrupted(format!(
                "payload length {} exceeds limit",
                payload_len
            )));
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = header.to_vec();
        checksum_data.extend_from_slice(&payload);
        let computed = crc32(&checksum_data);
        if computed != stored {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let operation =
            StructuralOperation::decode_payload(u32::from_le_bytes(type_bytes), &payload)?;
        let entry = LogEntry {
            id: LogId::new(u64::from_le_bytes(id_bytes)),
            operation,
        };
        Ok(Some((entry, HEADER_LEN + payload_len as u64 + CRC_LEN)))
    }
}

impl OperationLog for FileOperationLog {
    fn append(&self, operation: &StructuralOperation) -> Result<LogId> {
        let mut inner = self.lock();
        if inner.failed {
            return Err(Error::Corrupted(format!(
                "{} has an unremovable partial record",
                self.path.display()
            )));
        }

        let id = LogId::new(inner.next_id);
        let record = Self::encode_record(id, operation)?;
        if let Err(e) = self.write_record(&mut inner, &record) {
            tracing::error!(log_id = %id, op = %operation, "Failed to write operation: {}", e);
            inner.rollback();
            return Err(e);
        }

        inner.len += record.len() as u64;
        inner.next_id += 1;
        inner.entries.push(LogEntry {
            id,
            operation: operation.clone(),
        });
        if self.sync_policy != WalSyncPolicy::Interval {
            inner.persisted = Some(id);
        }
        tracing::debug!(log_id = %id, op = %operation, "Appended operation");
        Ok(id)
    }

    fn iterate(&self, from: LogId, to: LogId) -> Result<Vec<LogEntry>> {
        let inner = self.lock();
        Ok(range_of(&inner.entries, from, to).to_vec())
    }

    fn last_persistent_id(&self) -> Option<LogId> {
        self.lock().persisted
    }

    /// Fsync everything written so far and mark it persistent
    fn sync(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.file.sync_all()?;
        inner.persisted = inner.entries.last().map(|e| e.id);
        Ok(())
    }
}
