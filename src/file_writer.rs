use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A single already-encoded record handed to a [`RedoFileWriter`].
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub commit_ts: u64,
    pub bytes: Vec<u8>,
}

/// Abstract append-only writer. The `LogWriter` core treats this as an
/// external collaborator: block encoding, rotation and
/// fsync policy are entirely up to the implementation. Modeled as an
/// async trait via `async-trait`, since stable `async fn` in traits
/// doesn't support object safety the way this crate needs it, and
/// `LogWriter` holds `Arc<dyn RedoFileWriter>`.
#[async_trait]
pub trait RedoFileWriter: Send + Sync {
    /// Appends `records` atomically and in order. Returns the number of
    /// bytes written.
    async fn write(&self, records: &[EncodedRecord]) -> anyhow::Result<usize>;

    /// Makes all previously-written bytes durable.
    async fn flush(&self) -> anyhow::Result<()>;

    /// Informs the writer of a new maximum timestamp among buffered
    /// records. Never fails; purely informational bookkeeping used by GC.
    async fn advance_ts(&self, ts: u64);

    /// May delete files whose maximum timestamp is `<= ts`.
    async fn gc(&self, ts: u64) -> anyhow::Result<()>;

    /// `false` once `close` has been called, or after a fatal internal
    /// error. The `LogWriter` checks this *before* touching the writer on
    /// every public operation.
    fn is_running(&self) -> bool;

    /// Idempotent. Flushes and releases resources.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A minimal, real `RedoFileWriter` over a single local append-only
/// file, with size-based rotation. `RedoFileWriter` is wholly pluggable,
/// but `LogWriter` needs something real to run against out of the box,
/// the same way an abstract write-ahead-log contract is usually paired
/// with one concrete on-disk implementation.
///
/// On-disk framing: `[u32 len big-endian][u64 commit_ts big-endian][payload]`,
/// one record per frame — deliberately simpler than a page-shaped frame
/// header, since these records are already opaque pre-encoded events
/// rather than database pages.
pub struct LocalFileWriter {
    path: PathBuf,
    max_size_bytes: u64,
    file: tokio::sync::Mutex<tokio::fs::File>,
    max_ts_seen: AtomicU64,
    running: AtomicBool,
    rotation: Mutex<RotationState>,
}

struct RotationState {
    generation: u64,
    current_size: u64,
}

impl LocalFileWriter {
    pub async fn open(path: impl AsRef<Path>, max_size_mb: u64) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;
        let current_size = file.metadata().await?.len();
        Ok(Self {
            path,
            max_size_bytes: max_size_mb * 1024 * 1024,
            file: tokio::sync::Mutex::new(file),
            max_ts_seen: AtomicU64::new(0),
            running: AtomicBool::new(true),
            rotation: Mutex::new(RotationState {
                generation: 0,
                current_size,
            }),
        })
    }

    fn rotated_path(&self, generation: u64) -> PathBuf {
        let mut name = self.path.clone();
        let ext = name
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        name.set_extension(format!("{generation}.{ext}"));
        name
    }

    async fn maybe_rotate(&self, incoming_len: u64) -> anyhow::Result<()> {
        let should_rotate = {
            let state = self.rotation.lock();
            self.max_size_bytes > 0 && state.current_size + incoming_len > self.max_size_bytes
        };
        if !should_rotate {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        guard.flush().await?;
        let generation = {
            let mut state = self.rotation.lock();
            state.generation += 1;
            state.current_size = 0;
            state.generation
        };
        tokio::fs::rename(&self.path, self.rotated_path(generation.saturating_sub(1))).await.ok();
        let new_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .await?;
        *guard = new_file;
        Ok(())
    }

    /// Reads back every frame currently on disk, for tests and recovery
    /// tooling. Not part of the `RedoFileWriter` contract.
    pub async fn read_all(&self) -> anyhow::Result<Vec<EncodedRecord>> {
        let mut guard = self.file.lock().await;
        guard.seek(std::io::SeekFrom::Start(0)).await?;
        let mut out = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match guard.read_exact(&mut len_buf).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut ts_buf = [0u8; 8];
            guard.read_exact(&mut ts_buf).await?;
            let commit_ts = u64::from_be_bytes(ts_buf);
            let mut payload = vec![0u8; len];
            guard.read_exact(&mut payload).await?;
            out.push(EncodedRecord { commit_ts, bytes: payload });
        }
        guard.seek(std::io::SeekFrom::End(0)).await?;
        Ok(out)
    }
}

fn frame_len(rec: &EncodedRecord) -> u64 {
    4 + 8 + rec.bytes.len() as u64
}

#[async_trait]
impl RedoFileWriter for LocalFileWriter {
    async fn write(&self, records: &[EncodedRecord]) -> anyhow::Result<usize> {
        if !self.is_running() {
            anyhow::bail!("file writer is closed");
        }
        let mut total = 0usize;
        for rec in records {
            self.maybe_rotate(frame_len(rec)).await?;
            let mut guard = self.file.lock().await;
            guard.write_all(&(rec.bytes.len() as u32).to_be_bytes()).await?;
            guard.write_all(&rec.commit_ts.to_be_bytes()).await?;
            guard.write_all(&rec.bytes).await?;
            drop(guard);
            let written = frame_len(rec);
            total += written as usize;
            let mut state = self.rotation.lock();
            state.current_size += written;
        }
        Ok(total)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let mut guard = self.file.lock().await;
        guard.flush().await?;
        Ok(())
    }

    async fn advance_ts(&self, ts: u64) {
        self.max_ts_seen.fetch_max(ts, Ordering::AcqRel);
    }

    async fn gc(&self, _ts: u64) -> anyhow::Result<()> {
        // Reference implementation keeps all history; real deployments
        // plug in a `FileWriter` that prunes rotated segments whose max
        // ts is below the watermark.
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        guard.flush().await?;
        Ok(())
    }
}


#[allow(dead_code)]
fn _assert_object_safe(_: &dyn RedoFileWriter) {}
