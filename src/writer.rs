use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::background;
use crate::config::LogWriterConfig;
use crate::error::{CombinedError, ErrorSide, RedoError, Result};
use crate::file_writer::{EncodedRecord, RedoFileWriter};
use crate::metadata::{self, Metadata};
use crate::remote::{self, RemoteStorage};

/// One row change, as handed to [`LogWriter::write_log`]. Encoding of the
/// row payload into wire bytes is left to the caller's codec; this type
/// only carries what the `LogWriter` itself needs to inspect: the
/// commit timestamp and whether the payload is empty.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub commit_ts: u64,
    pub payload: Vec<u8>,
}

/// A DDL event, as handed to [`LogWriter::send_ddl`]. `None` models "no
/// inner event", a no-op send.
#[derive(Debug, Clone, Default)]
pub struct DdlEvent {
    pub event: Option<Vec<u8>>,
}

/// A cancellation handle, passed as the first argument to every
/// operation on [`LogWriter`], the way a `context.Context` would be in
/// a Go equivalent of this pipeline stage. `tokio_util`'s
/// `CancellationToken` would be the usual ambient choice for this, but we
/// keep this crate's external surface minimal and expose our own
/// single-method type so callers aren't forced onto a specific runtime
/// cancellation crate.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Running,
    Stopped,
}

/// The stateful core of the redo-log writer.
///
/// Owns one row-event `FileWriter`, one DDL-event `FileWriter`, the
/// authoritative metadata record, the immutable config, an optional
/// remote mirror, and the lifecycle flag. Metadata and lifecycle are
/// guarded by `meta` (a `tokio::sync::Mutex`, since persistence awaits
/// I/O while holding logical ownership of the record); a *separate*
/// `persist_lock` serializes the local+remote meta write so record-path
/// writes are never blocked behind a meta flush.
pub struct LogWriter {
    config: LogWriterConfig,
    row_writer: Arc<dyn RedoFileWriter>,
    ddl_writer: Arc<dyn RedoFileWriter>,
    remote: Option<Arc<dyn RemoteStorage>>,
    meta: AsyncMutex<Metadata>,
    persist_lock: AsyncMutex<()>,
    lifecycle: AsyncMutex<LifecycleState>,
    table_row_counts: SyncMutex<HashMap<i64, u64>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    background: SyncMutex<Vec<JoinHandle<()>>>,
    flush_error_count: AtomicU64,
}

impl LogWriter {
    /// Opens a `LogWriter` for `config`, constructing `LocalFileWriter`s
    /// for the row/DDL streams, loading any existing metadata, and
    /// starting the background flush/GC loops. This is the path
    /// `new_log_writer` takes on a registry miss; exposed directly for
    /// tests and for callers who want to bypass the process-wide cache.
    pub async fn open(
        config: LogWriterConfig,
        remote: Option<Arc<dyn RemoteStorage>>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;

        let row_path = config
            .dir
            .join(format!("{}_{}.row.log", config.capture_id, config.change_feed_id));
        let ddl_path = config
            .dir
            .join(format!("{}_{}.ddl.log", config.capture_id, config.change_feed_id));

        let row_writer: Arc<dyn RedoFileWriter> = Arc::new(
            crate::file_writer::LocalFileWriter::open(&row_path, config.max_log_size_mb).await?,
        );
        let ddl_writer: Arc<dyn RedoFileWriter> = Arc::new(
            crate::file_writer::LocalFileWriter::open(&ddl_path, config.max_log_size_mb).await?,
        );

        Self::open_with_writers(config, row_writer, ddl_writer, remote).await
    }

    /// Same as [`LogWriter::open`] but with caller-supplied `FileWriter`s,
    /// used by tests to plug in fakes, and by embedders that bring their
    /// own append-only storage.
    pub async fn open_with_writers(
        config: LogWriterConfig,
        row_writer: Arc<dyn RedoFileWriter>,
        ddl_writer: Arc<dyn RedoFileWriter>,
        remote: Option<Arc<dyn RemoteStorage>>,
    ) -> Result<Self> {
        config.validate()?;
        let meta = metadata::load(&config).await?;
        if !meta.check_invariants() {
            // §4.6 only fails creation on a corrupt/truncated file; a
            // structurally valid but non-monotone record can be produced
            // legally by the write path (§4.5 overwrites rather than
            // rejects a regressing ts), so it is accepted here too.
            tracing::warn!(
                change_feed_id = %config.change_feed_id,
                checkpoint_ts = meta.checkpoint_ts,
                resolved_ts = meta.resolved_ts,
                "loaded metadata violates checkpoint/resolved invariants; accepting as-is"
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer = LogWriter {
            config,
            row_writer,
            ddl_writer,
            remote,
            meta: AsyncMutex::new(meta),
            persist_lock: AsyncMutex::new(()),
            lifecycle: AsyncMutex::new(LifecycleState::Running),
            table_row_counts: SyncMutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            background: SyncMutex::new(Vec::new()),
            flush_error_count: AtomicU64::new(0),
        };

        tracing::info!(
            change_feed_id = %writer.config.change_feed_id,
            dir = %writer.config.dir.display(),
            "opened redo log writer"
        );

        Ok(writer)
    }

    /// Spawns the background flush/GC loops against `self`. Split out
    /// from `open` because the loops need an `Arc<LogWriter>` (they
    /// outlive any single call stack), which `open` itself cannot
    /// produce from `&self`.
    pub fn start_background_loops(self: &Arc<Self>) {
        let flush_handle = background::spawn_flush_loop(self.clone());
        let gc_handle = background::spawn_gc_loop(self.clone());
        let mut handles = self.background.lock();
        handles.push(flush_handle);
        handles.push(gc_handle);
    }

    pub fn config(&self) -> &LogWriterConfig {
        &self.config
    }

    pub(crate) fn row_writer(&self) -> &Arc<dyn RedoFileWriter> {
        &self.row_writer
    }

    pub(crate) fn ddl_writer(&self) -> &Arc<dyn RedoFileWriter> {
        &self.ddl_writer
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Number of flush failures observed so far, foreground and
    /// background combined — the counter §4.8 calls for.
    pub fn flush_error_count(&self) -> u64 {
        self.flush_error_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_flush_error(&self) {
        self.flush_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) async fn gc_watermark(&self) -> u64 {
        let meta = self.meta.lock().await;
        meta.per_table_resolved_ts
            .values()
            .copied()
            .fold(meta.checkpoint_ts, u64::min)
    }

    pub fn rows_written_for_table(&self, table_id: i64) -> u64 {
        self.table_row_counts.lock().get(&table_id).copied().unwrap_or(0)
    }

    /// Reports whether this writer has been closed.
    pub fn is_stopped(&self) -> bool {
        // `try_lock` rather than blocking: background tasks only read this
        // to decide whether to keep ticking, and a writer mid-transition
        // is close enough to "not yet stopped" for that purpose.
        match self.lifecycle.try_lock() {
            Ok(guard) => *guard == LifecycleState::Stopped,
            Err(_) => false,
        }
    }

    async fn guard_entry(&self, cancellation: &Cancellation) -> Result<()> {
        if cancellation.is_cancelled() {
            return Err(RedoError::Cancelled);
        }
        let lifecycle = self.lifecycle.lock().await;
        if *lifecycle == LifecycleState::Stopped {
            return Err(RedoError::WriterStopped);
        }
        if !self.row_writer.is_running() || !self.ddl_writer.is_running() {
            return Err(RedoError::WriterStopped);
        }
        Ok(())
    }

    /// Appends `rows` (dropping any with an empty payload) to the row
    /// writer, advances its high-water timestamp, and returns the
    /// maximum commit timestamp actually written (0 if nothing was).
    pub async fn write_log(
        &self,
        cancellation: &Cancellation,
        table_id: i64,
        rows: Vec<RowChange>,
    ) -> Result<u64> {
        self.guard_entry(cancellation).await?;

        let filtered: Vec<RowChange> = rows.into_iter().filter(|r| !r.payload.is_empty()).collect();
        if filtered.is_empty() {
            return Ok(0);
        }

        let max_ts = filtered.iter().map(|r| r.commit_ts).max().unwrap_or(0);
        let encoded: Vec<EncodedRecord> = filtered
            .iter()
            .map(|r| EncodedRecord { commit_ts: r.commit_ts, bytes: r.payload.clone() })
            .collect();

        self.row_writer
            .write(&encoded)
            .await
            .map_err(|e| RedoError::UnderlyingWriter(CombinedError::single(ErrorSide::RowWriter, e)))?;

        self.row_writer.advance_ts(max_ts).await;

        {
            let mut counts = self.table_row_counts.lock();
            *counts.entry(table_id).or_insert(0) += filtered.len() as u64;
        }

        tracing::debug!(table_id, max_ts, rows = filtered.len(), "wrote row log batch");
        Ok(max_ts)
    }

    /// Writes a single DDL event to the ddl writer. A missing event, or
    /// no event at all, is a no-op.
    pub async fn send_ddl(&self, cancellation: &Cancellation, ddl: Option<DdlEvent>) -> Result<()> {
        self.guard_entry(cancellation).await?;

        let Some(ddl) = ddl else { return Ok(()) };
        let Some(event) = ddl.event else { return Ok(()) };

        self.ddl_writer
            .write(&[EncodedRecord { commit_ts: 0, bytes: event }])
            .await
            .map_err(|e| RedoError::UnderlyingWriter(CombinedError::single(ErrorSide::DdlWriter, e)))?;

        tracing::debug!("sent ddl event");
        Ok(())
    }

    /// Flushes both file writers, records `ts` as the resolved
    /// timestamp for `table_id`, and persists the updated metadata.
    pub async fn flush_log(&self, cancellation: &Cancellation, table_id: i64, ts: u64) -> Result<()> {
        self.guard_entry(cancellation).await?;

        let row_result = self.row_writer.flush().await;
        let ddl_result = self.ddl_writer.flush().await;

        match (row_result, ddl_result) {
            (Ok(()), Ok(())) => {}
            (Err(row_err), Ok(())) => {
                self.record_flush_error();
                return Err(RedoError::UnderlyingWriter(CombinedError::single(
                    ErrorSide::RowWriter,
                    row_err,
                )));
            }
            (Ok(()), Err(ddl_err)) => {
                self.record_flush_error();
                return Err(RedoError::UnderlyingWriter(CombinedError::single(
                    ErrorSide::DdlWriter,
                    ddl_err,
                )));
            }
            (Err(row_err), Err(ddl_err)) => {
                self.record_flush_error();
                return Err(RedoError::UnderlyingWriter(CombinedError::pair(
                    (ErrorSide::RowWriter, row_err.to_string()),
                    (ErrorSide::DdlWriter, ddl_err.to_string()),
                )));
            }
        }

        {
            let mut meta = self.meta.lock().await;
            meta.per_table_resolved_ts.insert(table_id, ts);
        }
        self.persist_metadata().await?;

        tracing::debug!(table_id, ts, "flushed log and persisted metadata");
        Ok(())
    }

    /// Updates and persists the checkpoint timestamp.
    pub async fn emit_checkpoint_ts(&self, cancellation: &Cancellation, ts: u64) -> Result<()> {
        self.guard_entry(cancellation).await?;
        {
            let mut meta = self.meta.lock().await;
            meta.checkpoint_ts = ts;
        }
        self.persist_metadata().await?;
        tracing::debug!(ts, "emitted checkpoint ts");
        Ok(())
    }

    /// Updates and persists the resolved timestamp.
    pub async fn emit_resolved_ts(&self, cancellation: &Cancellation, ts: u64) -> Result<()> {
        self.guard_entry(cancellation).await?;
        {
            let mut meta = self.meta.lock().await;
            meta.resolved_ts = ts;
        }
        self.persist_metadata().await?;
        tracing::debug!(ts, "emitted resolved ts");
        Ok(())
    }

    /// Returns the resolved timestamp for each requested table that has
    /// one recorded and nonzero. Cancellation is checked; the
    /// running-state preamble is not, since this is a pure read with no
    /// I/O.
    pub async fn get_current_resolved_ts(
        &self,
        cancellation: &Cancellation,
        table_ids: &[i64],
    ) -> Result<HashMap<i64, u64>> {
        if cancellation.is_cancelled() {
            return Err(RedoError::Cancelled);
        }
        let meta = self.meta.lock().await;
        let mut out = HashMap::new();
        for &table_id in table_ids {
            if let Some(&ts) = meta.per_table_resolved_ts.get(&table_id) {
                if ts > 0 {
                    out.insert(table_id, ts);
                }
            }
        }
        Ok(out)
    }

    /// Metadata persistence. Runs under `persist_lock`
    /// (distinct from `meta`) so a meta flush never blocks a concurrent
    /// `write_log`/`send_ddl` call on the same writer.
    async fn persist_metadata(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = { self.meta.lock().await.clone() };
        metadata::persist(&self.config, &snapshot, self.remote.as_deref()).await
    }

    /// Closes the writer. Idempotent: signals both
    /// background loops to exit, closes both `FileWriter`s (always both,
    /// even if the first errs), combines errors, and transitions to
    /// `Stopped`.
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == LifecycleState::Stopped {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            let _ = handle.await;
        }

        let row_result = self.row_writer.close().await;
        let ddl_result = self.ddl_writer.close().await;

        *lifecycle = LifecycleState::Stopped;
        drop(lifecycle);

        tracing::info!(change_feed_id = %self.config.change_feed_id, "closed redo log writer");

        match (row_result, ddl_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(row_err), Ok(())) => Err(RedoError::UnderlyingWriter(CombinedError::single(
                ErrorSide::RowWriter,
                row_err,
            ))),
            (Ok(()), Err(ddl_err)) => Err(RedoError::UnderlyingWriter(CombinedError::single(
                ErrorSide::DdlWriter,
                ddl_err,
            ))),
            (Err(row_err), Err(ddl_err)) => Err(RedoError::UnderlyingWriter(CombinedError::pair(
                (ErrorSide::RowWriter, row_err.to_string()),
                (ErrorSide::DdlWriter, ddl_err.to_string()),
            ))),
        }
    }

    /// Closes the writer, then deletes every local and remote artifact
    /// for this stream. Takes `self: &Arc<Self>` so it can deregister
    /// from [`crate::registry::GLOBAL`]
    /// without the registry having to guess at a key-to-instance mapping
    /// from outside.
    pub async fn delete_all_logs(self: &Arc<Self>) -> Result<()> {
        let close_result = self.close().await;

        let mut local_entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(mut rd) => {
                let mut paths = Vec::new();
                while let Some(entry) = rd.next_entry().await? {
                    paths.push(entry.path());
                }
                paths
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        local_entries.sort();

        for path in &local_entries {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.config.s3_storage {
            if let Some(remote) = &self.remote {
                let keys = remote
                    .walk_dir(&self.config.remote_prefix())
                    .await
                    .map_err(|e| RedoError::RemoteApi(e.to_string()))?;
                for key in keys {
                    if let Err(e) = remote.delete_file(&key).await {
                        if !remote::looks_like_not_found(&e) {
                            return Err(RedoError::RemoteApi(e.to_string()));
                        }
                    }
                }
            }
        } else {
            match tokio::fs::remove_dir(&self.config.dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        crate::registry::GLOBAL.remove_if_current(&self.config.change_feed_id, self);

        tracing::info!(change_feed_id = %self.config.change_feed_id, "deleted all redo logs");

        close_result
    }
}

/// Opens or returns a cached [`LogWriter`] for `config.change_feed_id`.
/// The lookup and, on a miss, the construction-plus-registration happen
/// as one critical section under the registry's construct lock (see
/// [`crate::registry::Registry::get_or_construct`]), so two concurrent
/// calls with the same config can't both observe a miss and each build
/// their own instance.
pub async fn new_log_writer(
    cancellation: &Cancellation,
    config: LogWriterConfig,
    remote: Option<Arc<dyn RemoteStorage>>,
) -> Result<Arc<LogWriter>> {
    if cancellation.is_cancelled() {
        return Err(RedoError::Cancelled);
    }
    config.validate()?;

    let change_feed_id = config.change_feed_id.clone();
    let dir = config.dir.clone();
    crate::registry::GLOBAL
        .get_or_construct(&change_feed_id, &dir, move || async move {
            let writer = Arc::new(LogWriter::open(config, remote).await?);
            writer.start_background_loops();
            Ok(writer)
        })
        .await
}

/// Runs `fut` unless `cancellation` is already set, mirroring the
/// cancellation-at-entry check every operation on [`LogWriter`]
/// performs before doing any work. Kept as a free function so call
/// sites that want the
/// check without a `&self` (e.g. future registry helpers) can reuse it.
pub async fn guard_cancellation<T>(
    cancellation: &Cancellation,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if cancellation.is_cancelled() {
        return Err(RedoError::Cancelled);
    }
    fut.await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_writer::fakes::FakeFileWriter;
    use crate::remote::fakes::FakeRemoteStorage;

    fn cfg(dir: &std::path::Path, s3: bool) -> LogWriterConfig {
        LogWriterConfig {
            dir: dir.to_path_buf(),
            change_feed_id: "test-cf".into(),
            capture_id: "cp".into(),
            s3_storage: s3,
            s3_uri: if s3 { Some("s3://bucket/prefix".into()) } else { None },
            ..Default::default()
        }
    }

    async fn open_with_fakes(
        dir: &std::path::Path,
        s3: bool,
    ) -> (Arc<LogWriter>, Arc<FakeFileWriter>, Arc<FakeFileWriter>, Arc<FakeRemoteStorage>) {
        let row = FakeFileWriter::new();
        let ddl = FakeFileWriter::new();
        let remote = Arc::new(FakeRemoteStorage::new());
        let writer = LogWriter::open_with_writers(
            cfg(dir, s3),
            row.clone(),
            ddl.clone(),
            if s3 { Some(remote.clone() as Arc<dyn RemoteStorage>) } else { None },
        )
        .await
        .unwrap();
        (Arc::new(writer), row, ddl, remote)
    }

    #[tokio::test]
    async fn happy_write_returns_max_ts_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;

        let ts = writer
            .write_log(
                &Cancellation::new(),
                111,
                vec![RowChange { commit_ts: 1, payload: b"row".to_vec() }],
            )
            .await
            .unwrap();

        assert_eq!(ts, 1);
        assert_eq!(row.written.lock().len(), 1);
        assert_eq!(*row.advance_calls.lock(), vec![1]);
    }

    #[tokio::test]
    async fn write_error_propagates_unmodified_and_skips_advance() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;
        *row.fail_write_with.lock() = Some("disk full".into());

        let err = writer
            .write_log(
                &Cancellation::new(),
                111,
                vec![RowChange { commit_ts: 1, payload: b"row".to_vec() }],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RedoError::UnderlyingWriter(_)));
        assert!(row.advance_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_rows_are_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;

        let ts = writer.write_log(&Cancellation::new(), 1, vec![]).await.unwrap();
        assert_eq!(ts, 0);
        assert!(row.written.lock().is_empty());
    }

    #[tokio::test]
    async fn rows_with_empty_payload_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;

        let ts = writer
            .write_log(
                &Cancellation::new(),
                1,
                vec![RowChange { commit_ts: 5, payload: vec![] }],
            )
            .await
            .unwrap();
        assert_eq!(ts, 0);
        assert!(row.written.lock().is_empty());
    }

    #[tokio::test]
    async fn send_ddl_nil_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, ddl, _remote) = open_with_fakes(dir.path(), false).await;
        writer.send_ddl(&Cancellation::new(), None).await.unwrap();
        writer
            .send_ddl(&Cancellation::new(), Some(DdlEvent { event: None }))
            .await
            .unwrap();
        assert!(ddl.written.lock().is_empty());
    }

    #[tokio::test]
    async fn flush_both_fail_combines_and_skips_meta_update() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, row, ddl, _remote) = open_with_fakes(dir.path(), false).await;
        *row.fail_flush_with.lock() = Some("err".into());
        *ddl.fail_flush_with.lock() = Some("err".into());

        let err = writer.flush_log(&Cancellation::new(), 1, 1).await.unwrap_err();
        let RedoError::UnderlyingWriter(combined) = err else { panic!("wrong variant") };
        assert!(combined.is_combined());

        let current = writer.get_current_resolved_ts(&Cancellation::new(), &[1]).await.unwrap();
        assert!(current.is_empty());
    }

    #[tokio::test]
    async fn flush_happy_persists_meta_and_mirrors_remote() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, remote) = open_with_fakes(dir.path(), true).await;

        writer.flush_log(&Cancellation::new(), 1, 7).await.unwrap();

        let current = writer.get_current_resolved_ts(&Cancellation::new(), &[1]).await.unwrap();
        assert_eq!(current.get(&1), Some(&7));
        assert_eq!(remote.write_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn get_current_resolved_ts_omits_missing_and_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;
        writer.flush_log(&Cancellation::new(), 1, 1).await.unwrap();
        writer.flush_log(&Cancellation::new(), 2, 2).await.unwrap();

        let current = writer
            .get_current_resolved_ts(&Cancellation::new(), &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(current.get(&1), Some(&1));
        assert_eq!(current.get(&2), Some(&2));
        assert!(!current.contains_key(&3));
    }

    #[tokio::test]
    async fn cancelled_context_fails_every_op() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;
        let cancelled = Cancellation::new();
        cancelled.cancel();

        assert!(matches!(
            writer.write_log(&cancelled, 1, vec![]).await.unwrap_err(),
            RedoError::Cancelled
        ));
        assert!(matches!(
            writer.flush_log(&cancelled, 1, 1).await.unwrap_err(),
            RedoError::Cancelled
        ));
        assert!(matches!(
            writer.emit_checkpoint_ts(&cancelled, 1).await.unwrap_err(),
            RedoError::Cancelled
        ));
        assert!(matches!(
            writer.get_current_resolved_ts(&cancelled, &[1]).await.unwrap_err(),
            RedoError::Cancelled
        ));
    }

    #[tokio::test]
    async fn stopped_writer_rejects_every_op() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;
        writer.close().await.unwrap();
        assert!(writer.is_stopped());

        assert!(matches!(
            writer.write_log(&Cancellation::new(), 1, vec![RowChange { commit_ts: 1, payload: b"x".to_vec() }]).await.unwrap_err(),
            RedoError::WriterStopped
        ));
        assert!(matches!(
            writer.emit_resolved_ts(&Cancellation::new(), 1).await.unwrap_err(),
            RedoError::WriterStopped
        ));
    }

    #[tokio::test]
    async fn checkpoint_and_resolved_ts_are_monotone_at_api_when_caller_is() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;

        for ts in [1, 5, 9] {
            writer.emit_checkpoint_ts(&Cancellation::new(), ts).await.unwrap();
        }
        let current = writer.get_current_resolved_ts(&Cancellation::new(), &[]).await.unwrap();
        assert!(current.is_empty());

        for ts in [3, 7, 11] {
            writer.emit_resolved_ts(&Cancellation::new(), ts).await.unwrap();
        }

        let meta = writer.meta.lock().await;
        assert_eq!(meta.checkpoint_ts, 9);
        assert_eq!(meta.resolved_ts, 11);
    }

    #[tokio::test]
    async fn regressing_ts_overwrites_rather_than_rejecting() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, _remote) = open_with_fakes(dir.path(), false).await;

        writer.emit_checkpoint_ts(&Cancellation::new(), 100).await.unwrap();
        writer.emit_checkpoint_ts(&Cancellation::new(), 1).await.unwrap();

        let meta = writer.meta.lock().await;
        assert_eq!(meta.checkpoint_ts, 1);
    }

    #[tokio::test]
    async fn reopen_accepts_legally_non_monotone_meta_from_prior_run() {
        // A writer that only ever calls emit_checkpoint_ts (resolved_ts
        // still at its zero default) legally persists {cp=10, rs=0}.
        // Reopening against that file must succeed: §4.6 fails creation
        // only on a corrupt/truncated file, not on a structurally valid
        // but non-monotone record.
        let dir = tempfile::tempdir().unwrap();
        let cfg_value = cfg(dir.path(), false);
        let meta = Metadata {
            checkpoint_ts: 10,
            resolved_ts: 0,
            per_table_resolved_ts: HashMap::new(),
        };
        metadata::persist(&cfg_value, &meta, None).await.unwrap();

        let row = FakeFileWriter::new();
        let ddl = FakeFileWriter::new();
        let writer = LogWriter::open_with_writers(cfg_value, row, ddl, None)
            .await
            .unwrap();

        let loaded = writer.meta.lock().await;
        assert_eq!(loaded.checkpoint_ts, 10);
        assert_eq!(loaded.resolved_ts, 0);
    }

    #[tokio::test]
    async fn new_log_writer_concurrent_same_config_yields_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let change_feed_id = format!("concurrent-cf-{:?}", dir.path());
        crate::registry::GLOBAL.clear();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let dir_path = dir.path().to_path_buf();
            let change_feed_id = change_feed_id.clone();
            tasks.push(tokio::spawn(async move {
                let config = LogWriterConfig {
                    dir: dir_path,
                    change_feed_id,
                    capture_id: "cp".into(),
                    ..Default::default()
                };
                new_log_writer(&Cancellation::new(), config, None).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        for w in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], w));
        }

        for w in &results {
            let _ = w.close().await;
        }
        crate::registry::GLOBAL.clear();
    }

    #[tokio::test]
    async fn delete_all_logs_removes_local_dir_and_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().join("stream");
        let (writer, _row, _ddl, _remote) = open_with_fakes(&dir_path, false).await;
        crate::registry::GLOBAL.insert(writer.config().change_feed_id.clone(), writer.clone());

        writer.delete_all_logs().await.unwrap();

        assert!(!dir_path.exists());
        assert!(crate::registry::GLOBAL
            .get_matching(&writer.config().change_feed_id, &dir_path)
            .is_none());
        crate::registry::GLOBAL.clear();
    }

    #[tokio::test]
    async fn delete_all_logs_tolerates_remote_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, remote) = open_with_fakes(dir.path(), true).await;
        remote
            .fail_all_with_not_found
            .store(true, std::sync::atomic::Ordering::Relaxed);
        remote.objects.lock().insert("ghost-key".into(), vec![]);

        writer.delete_all_logs().await.unwrap();
    }

    #[tokio::test]
    async fn delete_all_logs_surfaces_other_remote_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _row, _ddl, remote) = open_with_fakes(dir.path(), true).await;
        remote.objects.lock().insert("some-key".into(), vec![1, 2, 3]);
        *remote.fail_delete_with.lock() = Some("access denied".into());

        let err = writer.delete_all_logs().await.unwrap_err();
        assert!(matches!(err, RedoError::RemoteApi(_)));
    }
}
