use std::fmt;

/// Errors surfaced by the redo-log writer's public API: one flat enum,
/// `thiserror`-derived `Display`, with opaque sources wrapped rather
/// than downcast.
#[derive(Debug, thiserror::Error)]
pub enum RedoError {
    /// The caller's context was already cancelled at operation entry.
    #[error("operation cancelled")]
    Cancelled,

    /// The writer has been closed, or one of its child `FileWriter`s
    /// reports `is_running() == false`.
    #[error("redo log writer is stopped")]
    WriterStopped,

    /// A `Write`/`Flush`/`Close`/`GC` call on one or both `FileWriter`s
    /// failed.
    #[error("underlying file writer error: {0}")]
    UnderlyingWriter(#[source] CombinedError),

    /// Local and/or remote metadata persistence failed.
    #[error("failed to persist metadata: {0}")]
    MetaPersist(#[source] CombinedError),

    /// A non-"not found" error from the remote object store, encountered
    /// during `delete_all_logs`.
    #[error("remote storage API error: {0}")]
    RemoteApi(String),

    /// `cfg` passed to `new_log_writer` was nil or structurally invalid.
    #[error("invalid config: {0}")]
    BadConfig(String),

    /// The on-disk meta file exists but could not be decoded.
    #[error("corrupt meta file: {0}")]
    CorruptMeta(String),

    /// Plain I/O failure that isn't specifically attributable to the
    /// writer or remote contracts (e.g. directory creation, rename).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartialEq for RedoError {
    fn eq(&self, other: &Self) -> bool {
        // Compared by rendered message: good enough for tests that assert
        // "the same kind of failure happened", and avoids requiring every
        // wrapped error type to implement PartialEq itself.
        self.to_string() == other.to_string()
    }
}

/// Which of the two file writers (or two remote calls) an error came from.
///
/// A flush touches the row writer and the ddl writer independently;
/// when both fail, the failure needs to stay attributable to a side
/// rather than collapsing into one opaque message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSide {
    RowWriter,
    DdlWriter,
    Local,
    Remote,
}

impl fmt::Display for ErrorSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSide::RowWriter => "row writer",
            ErrorSide::DdlWriter => "ddl writer",
            ErrorSide::Local => "local",
            ErrorSide::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// A multi-error primitive that keeps both errors instead of discarding
/// one, for the two-sided case the flush/persist paths need.
#[derive(Debug)]
pub struct CombinedError {
    errors: Vec<(ErrorSide, String)>,
}

impl CombinedError {
    /// Build a combined error from up to two (side, error) pairs.
    /// Panics if called with zero errors: callers are expected to check
    /// for the all-success case before constructing one.
    pub fn new(errors: Vec<(ErrorSide, String)>) -> Self {
        assert!(!errors.is_empty(), "CombinedError requires at least one error");
        Self { errors }
    }

    pub fn single(side: ErrorSide, err: impl fmt::Display) -> Self {
        Self::new(vec![(side, err.to_string())])
    }

    pub fn pair(a: (ErrorSide, String), b: (ErrorSide, String)) -> Self {
        Self::new(vec![a, b])
    }

    /// True when both sides are present (e.g. both FileWriters failed).
    pub fn is_combined(&self) -> bool {
        self.errors.len() > 1
    }

    pub fn sides(&self) -> impl Iterator<Item = ErrorSide> + '_ {
        self.errors.iter().map(|(side, _)| *side)
    }
}

impl fmt::Display for CombinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .errors
            .iter()
            .map(|(side, msg)| format!("{side}: {msg}"))
            .collect();
        write!(f, "{}", rendered.join("; "))
    }
}

impl std::error::Error for CombinedError {}

impl PartialEq for CombinedError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

pub type Result<T> = std::result::Result<T, RedoError>;
