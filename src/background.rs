use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::writer::LogWriter;

/// Spawns the periodic flush loop: every `flush_interval_ms`, if both
/// file writers are running, flush each, logging and counting errors
/// rather than propagating them (a background loop has no caller to
/// return an error to). Exits as soon as the shutdown channel
/// closes/changes rather than spinning.
pub(crate) fn spawn_flush_loop(writer: Arc<LogWriter>) -> JoinHandle<()> {
    let mut shutdown = writer.shutdown_signal();
    let period = Duration::from_millis(writer.config().flush_interval_ms.max(1));

    tokio::spawn(async move {
        let mut ticker = interval(period);
        // First tick fires immediately; that's fine for a flush loop, but
        // we don't want to flush a writer that has no data yet on every
        // single start. Consume it so the first real flush happens after
        // one full period.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::debug!("flush loop: shutdown signal received, exiting");
                    return;
                }
            }

            if *shutdown.borrow() {
                tracing::debug!("flush loop: writer stopped, exiting");
                return;
            }

            if !writer.row_writer().is_running() || !writer.ddl_writer().is_running() {
                tracing::debug!("flush loop: a file writer is no longer running, exiting");
                return;
            }

            let row_result = writer.row_writer().flush().await;
            let ddl_result = writer.ddl_writer().flush().await;

            match (row_result, ddl_result) {
                (Ok(()), Ok(())) => {
                    tracing::trace!("background flush: ok");
                }
                (row, ddl) => {
                    writer.record_flush_error();
                    if let Err(e) = row {
                        tracing::warn!(error = %e, "background flush: row writer failed");
                    }
                    if let Err(e) = ddl {
                        tracing::warn!(error = %e, "background flush: ddl writer failed");
                    }
                }
            }
        }
    })
}

/// Spawns the periodic GC loop: every `gc_interval_ms`, if both file
/// writers are running, computes
/// `gc_ts = min(checkpoint_ts, min(per_table_resolved_ts))` and calls
/// `gc(gc_ts)` on each. The loop ends as soon as either writer reports
/// `is_running() == false`.
pub(crate) fn spawn_gc_loop(writer: Arc<LogWriter>) -> JoinHandle<()> {
    let mut shutdown = writer.shutdown_signal();
    let period = Duration::from_millis(writer.config().gc_interval_ms.max(1));

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::debug!("gc loop: shutdown signal received, exiting");
                    return;
                }
            }

            if *shutdown.borrow() {
                tracing::debug!("gc loop: writer stopped, exiting");
                return;
            }

            if !writer.row_writer().is_running() || !writer.ddl_writer().is_running() {
                tracing::debug!("gc loop: a file writer is no longer running, exiting");
                return;
            }

            let gc_ts = writer.gc_watermark().await;
            if let Err(e) = writer.row_writer().gc(gc_ts).await {
                tracing::warn!(error = %e, gc_ts, "background gc: row writer failed");
            }
            if let Err(e) = writer.ddl_writer().gc(gc_ts).await {
                tracing::warn!(error = %e, gc_ts, "background gc: ddl writer failed");
            }
            tracing::trace!(gc_ts, "background gc cycle complete");
        }
    })
}
