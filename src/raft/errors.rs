use std::fmt;

/// Index-range failures on the in-memory log.
///
/// `Compacted` is a normal protocol condition: the probed index has been
/// folded into the snapshot, and the caller falls back to InstallSnapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// The index precedes the log's base; its entry lives only in the
    /// snapshot now.
    Compacted { index: u64, base_index: u64 },

    /// The index is past the last entry.
    OutOfRange { index: u64, last_index: u64 },
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Compacted { index, base_index } => {
                write!(f, "index {} compacted (base is {})", index, base_index)
            }
            LogError::OutOfRange { index, last_index } => {
                write!(f, "index {} out of range (last is {})", index, last_index)
            }
        }
    }
}

impl std::error::Error for LogError {}
