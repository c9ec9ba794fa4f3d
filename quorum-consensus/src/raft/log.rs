use bytes::Bytes;
use quorum_common::error::Result;
use quorum_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,         // Term in which the leader received the command
    pub index: LogIndex,    // Position in the log, starting at 1
    pub command_buf: Bytes, // Opaque payload for the state machine
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command_buf: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            command_buf: command_buf.into(),
        }
    }
}

/// Storage contract for the replicated log.
///
/// Indices are 1-based and contiguous; index 0 never holds an entry. A
/// mutating call that returns `Ok` has made its change durable to whatever
/// degree the implementation promises.
pub trait LogStore: Send + 'static {
    /// Appends entries directly after the current last entry.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry>;

    /// Index of the last entry, or 0 if the log is empty.
    fn last_index(&self) -> LogIndex;

    /// Removes the entry at `index` and everything after it.
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Term of the entry at `index`. Index 0 has term 0.
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn last_term(&self) -> Term {
        self.term_at(self.last_index()).unwrap_or(0)
    }

    /// Clones up to `max` entries starting at `from`.
    fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let from = from.max(1);
        (from..=self.last_index())
            .take(max)
            .filter_map(|i| self.entry_at(i).cloned())
            .collect()
    }

    /// First index of the run of entries sharing the term of `index`.
    /// Returns `index` itself when there is no entry there.
    fn first_index_of_term(&self, index: LogIndex) -> LogIndex {
        let term = match self.entry_at(index) {
            Some(entry) => entry.term,
            None => return index,
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }
}

/// In-memory log. Nothing survives a restart.
#[derive(Debug, Default, Clone)]
pub struct MemLog {
    entries: Vec<LogEntry>, // entries[i] holds index i + 1
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Terms of all entries in order; compact form for comparing logs.
    pub fn terms(&self) -> Vec<Term> {
        self.entries.iter().map(|e| e.term).collect()
    }
}

impl From<Vec<LogEntry>> for MemLog {
    fn from(entries: Vec<LogEntry>) -> Self {
        debug_assert!(entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == i as LogIndex + 1));
        Self { entries }
    }
}

impl LogStore for MemLog {
    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
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
        self.entries.truncate(keep);
        Ok(())
    }
}
