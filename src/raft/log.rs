//! In-memory log with a logical base index.
//!
//! The entry vector always starts with a sentinel whose term is the term of
//! the entry just before the first real entry: term 0 at genesis, or the
//! snapshot's last-included-term after compaction. Logical index `i` lives at
//! `entries[i - base_index]`.

use serde::{Deserialize, Serialize};

use super::errors::LogError;
use super::message::Entry;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftLog {
    base_index: u64,
    entries: Vec<Entry>,
}

impl RaftLog {
    pub fn new() -> Self {
        RaftLog {
            base_index: 0,
            entries: vec![Entry {
                term: 0,
                command: Vec::new(),
            }],
        }
    }

    /// Logical index of the sentinel (first retained position).
    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    /// Logical index of the last entry (the sentinel, when empty).
    pub fn last_index(&self) -> u64 {
        self.base_index + self.entries.len() as u64 - 1
    }

    /// Term of the last entry.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at logical index `index`.
    pub fn term_at(&self, index: u64) -> Result<u64, LogError> {
        self.entry(index).map(|e| e.term)
    }

    /// The entry at logical index `index`. `index == base_index` yields the
    /// sentinel, whose command is empty.
    pub fn entry(&self, index: u64) -> Result<&Entry, LogError> {
        if index < self.base_index {
            return Err(LogError::Compacted {
                index,
                base_index: self.base_index,
            });
        }
        if index > self.last_index() {
            return Err(LogError::OutOfRange {
                index,
                last_index: self.last_index(),
            });
        }
        Ok(&self.entries[(index - self.base_index) as usize])
    }

    /// Append one entry at the tail. Does not persist.
    pub fn append(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Discard all entries with logical index >= `from`. The sentinel is
    /// never removed.
    pub fn truncate_from(&mut self, from: u64) {
        debug_assert!(from > self.base_index, "cannot truncate the sentinel");
        if from <= self.last_index() {
            self.entries.truncate((from - self.base_index) as usize);
        }
    }

    /// Entries with logical index >= `from`, cloned for shipping.
    pub fn slice_from(&self, from: u64) -> Vec<Entry> {
        debug_assert!(from > self.base_index, "slice reaches into the snapshot");
        if from > self.last_index() {
            return Vec::new();
        }
        self.entries[(from - self.base_index) as usize..].to_vec()
    }

    /// Compact the log up to `last_included_index`.
    ///
    /// When the index is within the log and its term matches, entries before
    /// it are dropped and the entry at it becomes the sentinel. Otherwise the
    /// local tail conflicted with the snapshot and is abandoned: the whole
    /// log is replaced by a lone sentinel carrying `last_included_term`.
    pub fn compact(&mut self, last_included_index: u64, last_included_term: u64) {
        if last_included_index > self.base_index
            && last_included_index <= self.last_index()
            && self.term_at(last_included_index) == Ok(last_included_term)
        {
            let keep_from = (last_included_index - self.base_index) as usize;
            self.entries.drain(..keep_from);
            // Re-seat the head entry as the sentinel.
            self.entries[0].command = Vec::new();
        } else {
            self.entries.clear();
            self.entries.push(Entry {
                term: last_included_term,
                command: Vec::new(),
            });
        }
        self.base_index = last_included_index;
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, byte: u8) -> Entry {
        Entry {
            term,
            command: vec![byte],
        }
    }

    #[test]
    fn test_fresh_log_has_sentinel() {
        let log = RaftLog::new();
        assert_eq!(log.base_index(), 0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Ok(0));
    }

    #[test]
    fn test_append_and_lookup() {
        let mut log = RaftLog::new();
        log.append(entry(1, b'a'));
        log.append(entry(1, b'b'));
        log.append(entry(2, b'c'));

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(2), Ok(1));
        assert_eq!(log.entry(3).unwrap().command, vec![b'c']);
        assert_eq!(
            log.term_at(4),
            Err(LogError::OutOfRange {
                index: 4,
                last_index: 3
            })
        );
    }

    #[test]
    fn test_truncate_from() {
        let mut log = RaftLog::new();
        log.append(entry(1, b'a'));
        log.append(entry(1, b'b'));
        log.append(entry(2, b'c'));

        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);

        // Truncating past the tail is a no-op.
        log.truncate_from(5);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_slice_from() {
        let mut log = RaftLog::new();
        log.append(entry(1, b'a'));
        log.append(entry(1, b'b'));

        let tail = log.slice_from(2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].command, vec![b'b']);
        assert!(log.slice_from(3).is_empty());
    }

    #[test]
    fn test_compact_keeps_matching_suffix() {
        let mut log = RaftLog::new();
        log.append(entry(1, b'a'));
        log.append(entry(1, b'b'));
        log.append(entry(2, b'c'));

        log.compact(2, 1);
        assert_eq!(log.base_index(), 2);
        assert_eq!(log.last_index(), 3);
        // The head is a sentinel now: term kept, command cleared.
        assert_eq!(log.term_at(2), Ok(1));
        assert!(log.entry(2).unwrap().command.is_empty());
        assert_eq!(log.entry(3).unwrap().command, vec![b'c']);
    }

    #[test]
    fn test_compact_resets_on_mismatch() {
        let mut log = RaftLog::new();
        log.append(entry(1, b'a'));

        // Snapshot is ahead of everything we have.
        log.compact(10, 4);
        assert_eq!(log.base_index(), 10);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.term_at(10), Ok(4));
    }

    #[test]
    fn test_compacted_error() {
        let mut log = RaftLog::new();
        log.append(entry(1, b'a'));
        log.append(entry(1, b'b'));
        log.compact(2, 1);

        assert_eq!(
            log.term_at(1),
            Err(LogError::Compacted {
                index: 1,
                base_index: 2
            })
        );
    }
}
