//! Redo-log writer for a change-data-capture pipeline.
//!
//! Multiplexes row and DDL change events onto two append-only
//! `FileWriter`s, maintains the authoritative
//! `{checkpoint_ts, resolved_ts, per_table_resolved_ts}` metadata record,
//! mirrors local log/meta files to a remote object store when
//! configured, and runs background flush/GC loops under a single
//! cancellation signal.

mod background;
pub mod config;
pub mod error;
pub mod file_writer;
pub mod metadata;
pub mod registry;
pub mod remote;
pub mod writer;

pub use config::LogWriterConfig;
pub use error::{CombinedError, ErrorSide, RedoError, Result};
pub use file_writer::{EncodedRecord, LocalFileWriter, RedoFileWriter};
pub use metadata::Metadata;
pub use remote::RemoteStorage;
pub use writer::{new_log_writer, Cancellation, DdlEvent, LogWriter, RowChange};

/// Installs a default `tracing` subscriber reading `RUST_LOG`, for
/// embedders that have no logging setup of their own yet. A no-op if a
/// global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
