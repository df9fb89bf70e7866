use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{RedoError, Result};

/// Default period between background `Flush` calls on both `FileWriter`s.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
/// Default period between background `GC` calls on both `FileWriter`s.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 5000;

pub const DEFAULT_META_FILE_TYPE: &str = "meta";
pub const META_EXT: &str = ".meta";

/// Immutable parameters for a [`crate::writer::LogWriter`]: a plain
/// struct built with field literals, no builder derive, with an
/// optional `from_env` convenience constructor layered on top.
#[derive(Clone, Debug)]
pub struct LogWriterConfig {
    /// Local directory for log and meta files.
    pub dir: PathBuf,
    /// Stream identity; used as the registry key.
    pub change_feed_id: String,
    /// Process-local tag; used in filenames.
    pub capture_id: String,
    /// Rotation threshold in MiB, passed through to the `FileWriter`.
    pub max_log_size_mb: u64,
    /// Timestamp embedded in filenames.
    pub create_time: DateTime<Utc>,
    /// Period for the background flush loop, in milliseconds.
    pub flush_interval_ms: u64,
    /// Period for the background GC loop, in milliseconds.
    pub gc_interval_ms: u64,
    /// Enables mirroring of local log/meta files to remote storage.
    pub s3_storage: bool,
    /// Remote prefix under which files are mirrored, when `s3_storage`.
    pub s3_uri: Option<String>,
}

impl LogWriterConfig {
    /// Validates structural invariants a nil/zeroed config would violate.
    /// `new_log_writer` rejects configs that fail this with `BadConfig`.
    pub fn validate(&self) -> Result<()> {
        if self.change_feed_id.trim().is_empty() {
            return Err(RedoError::BadConfig("change_feed_id must not be empty".into()));
        }
        if self.capture_id.trim().is_empty() {
            return Err(RedoError::BadConfig("capture_id must not be empty".into()));
        }
        if self.dir.as_os_str().is_empty() {
            return Err(RedoError::BadConfig("dir must not be empty".into()));
        }
        if self.s3_storage && self.s3_uri.as_deref().unwrap_or("").trim().is_empty() {
            return Err(RedoError::BadConfig(
                "s3_uri must be set when s3_storage is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Filename for the metadata file under `dir`:
    /// `{capture_id}_{change_feed_id}_{DEFAULT_META_FILE_TYPE}{META_EXT}`.
    pub fn meta_filename(&self) -> String {
        format!(
            "{}_{}_{}{}",
            self.capture_id, self.change_feed_id, DEFAULT_META_FILE_TYPE, META_EXT
        )
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(self.meta_filename())
    }

    pub fn meta_temp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.tmp", self.meta_filename()))
    }

    /// Remote key the meta file is mirrored under, when `s3_storage`.
    pub fn meta_remote_key(&self) -> String {
        match &self.s3_uri {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), self.meta_filename()),
            None => self.meta_filename(),
        }
    }

    /// Remote prefix under which all of this stream's artifacts live,
    /// used by `delete_all_logs`'s `WalkDir` call.
    pub fn remote_prefix(&self) -> String {
        match &self.s3_uri {
            Some(prefix) => prefix.trim_end_matches('/').to_string(),
            None => String::new(),
        }
    }

    /// Reads `REDO_LOG_*` environment variables as overrides.
    /// Only the ambient toggles that make sense to source from the
    /// environment are read here; `dir`/`change_feed_id`/`capture_id`
    /// stay explicit-field construction parameters, not env-sourced.
    pub fn apply_env_defaults(&mut self) {
        if let Ok(v) = std::env::var("REDO_LOG_FLUSH_INTERVAL_MS") {
            if let Ok(parsed) = v.parse() {
                self.flush_interval_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("REDO_LOG_GC_INTERVAL_MS") {
            if let Ok(parsed) = v.parse() {
                self.gc_interval_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("REDO_LOG_S3_URI") {
            self.s3_uri = Some(v);
            self.s3_storage = true;
        }
    }
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        LogWriterConfig {
            dir: PathBuf::new(),
            change_feed_id: String::new(),
            capture_id: String::new(),
            max_log_size_mb: 256,
            create_time: Utc::now(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            s3_storage: false,
            s3_uri: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_cfg(dir: &std::path::Path) -> LogWriterConfig {
        LogWriterConfig {
            dir: dir.to_path_buf(),
            change_feed_id: "test-cf".into(),
            capture_id: "cp".into(),
            ..Default::default()
        }
    }

    #[test]
    fn meta_filename_is_capture_then_change_feed_then_type() {
        let cfg = base_cfg(std::path::Path::new("/tmp/x"));
        assert_eq!(cfg.meta_filename(), "cp_test-cf_meta.meta");
    }

    #[test]
    fn rejects_empty_ids() {
        let mut cfg = base_cfg(std::path::Path::new("/tmp/x"));
        cfg.change_feed_id.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_s3_without_uri() {
        let mut cfg = base_cfg(std::path::Path::new("/tmp/x"));
        cfg.s3_storage = true;
        cfg.s3_uri = None;
        assert!(cfg.validate().is_err());
    }
}
