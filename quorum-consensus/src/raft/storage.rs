//! Durable state: the hard state (`current_term`, `voted_for`) and a
//! file-backed log. Both must be persisted before the node answers an RPC
//! that changed them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::log::{LogEntry, LogStore};
use super::rpc;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Defines the behavior for any hard state storage backend.
pub trait StableStore: Send + 'static {
    fn save(&mut self, state: &HardState) -> Result<()>;
    fn load(&self) -> Result<Option<HardState>>;
}

/// Keeps the hard state in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemStableStore {
    state: Option<HardState>,
}

impl MemStableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: HardState) -> Self {
        Self { state: Some(state) }
    }
}

impl StableStore for MemStableStore {
    fn save(&mut self, state: &HardState) -> Result<()> {
        self.state = Some(*state);
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        Ok(self.state)
    }
}

fn durability(context: &'static str) -> impl FnOnce(io::Error) -> QuorumError {
    move |err| QuorumError::Durability(format!("{}: {}", context, err))
}

/// Saves the hard state as a binary file, replacing it atomically.
pub struct FileStableStore {
    pub path: PathBuf,
}

impl FileStableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StableStore for FileStableStore {
    fn save(&mut self, state: &HardState) -> Result<()> {
        let encoded = rpc::encode(state)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(durability("create hard state"))?;
        file.write_all(&encoded)
            .map_err(durability("write hard state"))?;
        file.sync_all().map_err(durability("sync hard state"))?;
        fs::rename(&tmp, &self.path).map_err(durability("replace hard state"))?;
        sync_parent_dir(&self.path).map_err(durability("sync hard state directory"))?;
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let state = rpc::decode(&bytes)?;
        Ok(Some(state))
    }
}

/// Record header: payload length then CRC32 of length and payload.
const HEADER_LEN: usize = 4 + 4;

/// Largest payload a record may carry. A length above this can only come
/// from a damaged header.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn record_crc(len: u32, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Fsyncs the directory holding `path` so a create or rename inside it
/// survives a crash.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Append-only log file of checksummed records, mirrored in memory.
///
/// Each record is a little-endian `u32` payload length, a `u32` CRC32 and
/// the encoded entry. Only the last record can be torn by a crash
/// mid-append; it is cut off on open. Damage anywhere before it is a
/// durability failure.
pub struct FileLog {
    file: File,
    entries: Vec<LogEntry>,
    offsets: Vec<u64>, // byte offset of each record, parallel to `entries`
    end: u64,
    sync: bool,
}

impl FileLog {
    /// Opens or creates the log at `path`. With `sync` every mutation is
    /// flushed to stable storage before returning.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let created = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        if created && sync {
            sync_parent_dir(path).map_err(durability("sync log directory"))?;
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos = 0usize;
        while pos + HEADER_LEN <= bytes.len() {
            let mut len = [0u8; 4];
            len.copy_from_slice(&bytes[pos..pos + 4]);
            let len = u32::from_le_bytes(len);
            let mut crc = [0u8; 4];
            crc.copy_from_slice(&bytes[pos + 4..pos + HEADER_LEN]);
            let crc = u32::from_le_bytes(crc);

            if len as usize > MAX_RECORD_LEN {
                return Err(QuorumError::Durability(format!(
                    "log record at offset {} claims {} bytes",
                    pos, len
                )));
            }
            let body = pos + HEADER_LEN;
            let next = body + len as usize;
            if next > bytes.len() {
                break; // torn final record
            }

            let payload = &bytes[body..next];
            let decoded = if record_crc(len, payload) == crc {
                rpc::decode::<LogEntry>(payload).ok()
            } else {
                None
            };
            let entry = match decoded {
                Some(entry) => entry,
                None if next == bytes.len() => break, // torn final record
                None => {
                    return Err(QuorumError::Durability(format!(
                        "log record at offset {} is corrupt",
                        pos
                    )))
                }
            };
            if entry.index != entries.len() as LogIndex + 1 {
                return Err(QuorumError::Durability(format!(
                    "log record at offset {} has index {}, expected {}",
                    pos,
                    entry.index,
                    entries.len() + 1
                )));
            }
            offsets.push(pos as u64);
            entries.push(entry);
            pos = next;
        }

        if pos < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - pos,
                "Discarding torn tail of log file"
            );
            file.set_len(pos as u64)
                .map_err(durability("truncate torn tail"))?;
        }

        Ok(Self {
            file,
            entries,
            offsets,
            end: pos as u64,
            sync,
        })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

impl LogStore for FileLog {
    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            let body = rpc::encode(entry)?;
            if body.len() > MAX_RECORD_LEN {
                return Err(QuorumError::Durability(format!(
                    "entry {} is {} bytes, over the record limit",
                    entry.index,
                    body.len()
                )));
            }
            let len = body.len() as u32;
            offsets.push(self.end + buf.len() as u64);
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&record_crc(len, &body).to_le_bytes());
            buf.extend_from_slice(&body);
        }
        self.file
            .write_all(&buf)
            .map_err(durability("append log records"))?;
        if self.sync {
            self.file.sync_data().map_err(durability("sync log"))?;
        }
        self.end += buf.len() as u64;
        self.offsets.extend(offsets);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let keep = index.saturating_sub(1) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        let offset = self.offsets[keep];
        self.file
            .set_len(offset)
            .map_err(durability("truncate log"))?;
        if self.sync {
            self.file.sync_data().map_err(durability("sync log"))?;
        }
        self.end = offset;
        self.entries.truncate(keep);
        self.offsets.truncate(keep);
        Ok(())
    }
}
