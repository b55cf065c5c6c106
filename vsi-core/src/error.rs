use thiserror::Error;

/// Error taxonomy for every public VSI operation.
///
/// Group fetches report a status per result slot while the call itself
/// succeeds; everything else surfaces through the returned `Result`.
#[derive(Debug, Error)]
pub enum VsiError {
    /// The shared-memory arena (or the system node pool) is exhausted.
    #[error("out of shared-memory arena space")]
    OutOfMemory,

    /// The queue is empty and the caller asked not to wait.
    #[error("no data available")]
    NoData,

    /// No signal with the given id or name exists.
    #[error("unknown signal")]
    UnknownSignal,

    /// No group with the given id exists.
    #[error("unknown group")]
    UnknownGroup,

    /// A group with the given id already exists.
    #[error("group already exists")]
    DuplicateGroup,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An in-segment invariant does not hold. The segment is beyond
    /// repair; callers should tear it down and re-create.
    #[error("segment corrupted: {0}")]
    CorruptSegment(String),

    /// A bounded wait expired before data arrived.
    #[error("wait timed out")]
    Timeout,

    /// The iterator's tree was structurally mutated after the iterator
    /// was positioned.
    #[error("iterator invalidated by tree mutation")]
    StaleIterator,

    #[error("segment i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VsiError>;
