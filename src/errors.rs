use std::fmt;

/// Engine conditions a caller is expected to match on. Raised through
/// `anyhow::Error`; recover with `err.downcast_ref::<EngineError>()`.
/// Corruption failures stay as plain `anyhow!` messages since the only
/// response to them is refusing to open.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Every buffer pool frame is pinned, or no page could be found or
    /// allocated for an insert.
    Busy,
    /// The wrapped record would not fit into an empty page.
    DataTooLarge,
    /// Blocking on the requested resource would close a wait cycle.
    Deadlock,
    /// The entry was deleted by a transaction this one must not
    /// overwrite under its isolation level.
    ConcurrentUpdate,
    /// Commit or abort of a transaction that is not active.
    InvalidStatus,
    /// Operation on an xid with no registered transaction.
    UnknownTransaction,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Busy => write!(f, "engine is busy"),
            EngineError::DataTooLarge => write!(f, "data is too large for a single page"),
            EngineError::Deadlock => write!(f, "deadlock detected"),
            EngineError::ConcurrentUpdate => write!(f, "concurrent update conflict"),
            EngineError::InvalidStatus => write!(f, "invalid transaction status transition"),
            EngineError::UnknownTransaction => write!(f, "unknown transaction"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
pub(crate) fn is_engine_error(err: &anyhow::Error, kind: EngineError) -> bool {
    err.downcast_ref::<EngineError>() == Some(&kind)
}
