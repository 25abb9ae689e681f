//! Ordered logs of the key-value effects of a commit.
use crate::{
    bits::{Key, Value},
    error::Error,
};
use serde::{Deserialize, Serialize};

/// A single observed effect: an insert when `value` is present, a delete
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The affected key.
    pub key: Key,
    /// The final value, or `None` for a deletion.
    pub value: Option<Value>,
}

impl LogEntry {
    /// Classifies the entry.
    pub fn entry_type(&self) -> LogEntryType {
        match self.value {
            Some(_) => LogEntryType::Insert,
            None => LogEntryType::Delete,
        }
    }
}

/// The kind of effect a log entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryType {
    /// The key was set to the entry's value.
    Insert,
    /// The key was removed.
    Delete,
}

/// The ordered effects of one commit.
pub type WriteLog = Vec<LogEntry>;

/// A fallible stream of log entries, as produced by the node database.
pub type WriteLogIterator = Box<dyn Iterator<Item = Result<LogEntry, Error>>>;

/// Wraps an in-memory write log as an iterator.
pub fn static_iterator(log: WriteLog) -> WriteLogIterator {
    Box::new(log.into_iter().map(Ok))
}

/// Collects an iterator back into a write log, stopping at the first error.
pub fn drain_iterator(iter: WriteLogIterator) -> Result<WriteLog, Error> {
    iter.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type() {
        let insert = LogEntry {
            key: b"k".to_vec(),
            value: Some(b"v".to_vec()),
        };
        let delete = LogEntry {
            key: b"k".to_vec(),
            value: None,
        };
        assert_eq!(insert.entry_type(), LogEntryType::Insert);
        assert_eq!(delete.entry_type(), LogEntryType::Delete);
    }

    #[test]
    fn test_static_iterator_round_trip() {
        let log = vec![
            LogEntry {
                key: b"a".to_vec(),
                value: Some(b"1".to_vec()),
            },
            LogEntry {
                key: b"b".to_vec(),
                value: None,
            },
        ];
        let drained = drain_iterator(static_iterator(log.clone())).unwrap();
        assert_eq!(drained, log);
    }
}
