use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::LogWriterConfig;
use crate::error::{ErrorSide, RedoError, Result};
use crate::remote::RemoteStorage;

/// The authoritative in-memory checkpoint/resolved-ts record. Carries a
/// variable-size per-table map, which rules out a fixed-size
/// `#[repr(C)]`/`Pod` encoding in favor of plain `serde` + `bincode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub checkpoint_ts: u64,
    pub resolved_ts: u64,
    pub per_table_resolved_ts: HashMap<i64, u64>,
}

impl Metadata {
    /// Checks the invariants that must hold after every successful
    /// public operation: checkpoint never exceeds resolved, and no
    /// per-table resolved ts falls behind checkpoint.
    pub fn check_invariants(&self) -> bool {
        if self.checkpoint_ts > self.resolved_ts {
            return false;
        }
        self.per_table_resolved_ts
            .values()
            .all(|&ts| ts >= self.checkpoint_ts)
    }

    fn encode(&self) -> Vec<u8> {
        // `bincode`'s default config never fails to encode a plain struct
        // of primitives and a map of them.
        bincode::serialize(self).expect("metadata encoding is infallible")
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| RedoError::CorruptMeta(e.to_string()))
    }
}

/// Loads metadata from the canonical local path, if present. A missing
/// file seeds a zeroed `Metadata`; a corrupt or truncated file fails
/// instance creation.
pub async fn load(cfg: &LogWriterConfig) -> Result<Metadata> {
    let path = cfg.meta_path();
    match tokio::fs::read(&path).await {
        Ok(bytes) => Metadata::decode(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::default()),
        Err(e) => Err(e.into()),
    }
}

/// Persists `meta` to the canonical local path via temp-file + atomic
/// rename, and, when `remote` is set, additionally mirrors the same
/// bytes to the remote store. Both writes are attempted; if either or
/// both fail, the combined error surfaces.
pub async fn persist(
    cfg: &LogWriterConfig,
    meta: &Metadata,
    remote: Option<&dyn RemoteStorage>,
) -> Result<()> {
    let bytes = meta.encode();

    let local_result = persist_local(cfg, &bytes).await;

    let remote_result = if let Some(remote) = remote {
        Some(remote.write_file(&cfg.meta_remote_key(), bytes.clone()).await)
    } else {
        None
    };

    match (local_result, remote_result) {
        (Ok(()), None) => Ok(()),
        (Ok(()), Some(Ok(()))) => Ok(()),
        (Err(local_err), None) => Err(RedoError::MetaPersist(crate::error::CombinedError::single(
            ErrorSide::Local,
            local_err,
        ))),
        (Ok(()), Some(Err(remote_err))) => Err(RedoError::MetaPersist(
            crate::error::CombinedError::single(ErrorSide::Remote, remote_err),
        )),
        (Err(local_err), Some(Ok(()))) => Err(RedoError::MetaPersist(
            crate::error::CombinedError::single(ErrorSide::Local, local_err),
        )),
        (Err(local_err), Some(Err(remote_err))) => Err(RedoError::MetaPersist(
            crate::error::CombinedError::pair(
                (ErrorSide::Local, local_err.to_string()),
                (ErrorSide::Remote, remote_err.to_string()),
            ),
        )),
    }
}

async fn persist_local(cfg: &LogWriterConfig, bytes: &[u8]) -> std::result::Result<(), String> {
    (async {
        tokio::fs::create_dir_all(&cfg.dir).await?;
        let tmp_path = cfg.meta_temp_path();
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(bytes).await?;
        tmp.flush().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, cfg.meta_path()).await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::LogWriterConfig;

    fn cfg(dir: &std::path::Path) -> LogWriterConfig {
        LogWriterConfig {
            dir: dir.to_path_buf(),
            change_feed_id: "test-cf".into(),
            capture_id: "cp".into(),
            ..Default::default()
        }
    }

    #[test]
    fn invariants_hold_for_default() {
        assert!(Metadata::default().check_invariants());
    }

    #[test]
    fn invariants_reject_backwards_checkpoint() {
        let m = Metadata {
            checkpoint_ts: 10,
            resolved_ts: 5,
            per_table_resolved_ts: HashMap::new(),
        };
        assert!(!m.check_invariants());
    }

    #[test]
    fn invariants_reject_table_below_checkpoint() {
        let mut per_table = HashMap::new();
        per_table.insert(1, 3);
        let m = Metadata {
            checkpoint_ts: 5,
            resolved_ts: 10,
            per_table_resolved_ts: per_table,
        };
        assert!(!m.check_invariants());
    }

    #[tokio::test]
    async fn round_trip_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        let mut per_table = HashMap::new();
        per_table.insert(111, 42);
        let meta = Metadata {
            checkpoint_ts: 7,
            resolved_ts: 9,
            per_table_resolved_ts: per_table,
        };
        persist(&cfg, &meta, None).await.unwrap();
        let loaded = load(&cfg).await.unwrap();
        assert_eq!(loaded, meta);
    }

    #[tokio::test]
    async fn missing_file_seeds_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        let loaded = load(&cfg).await.unwrap();
        assert_eq!(loaded, Metadata::default());
    }

    #[tokio::test]
    async fn truncated_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path());
        tokio::fs::create_dir_all(&cfg.dir).await.unwrap();
        tokio::fs::write(cfg.meta_path(), b"\x01\x02").await.unwrap();
        assert!(load(&cfg).await.is_err());
    }
}
