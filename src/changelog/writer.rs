//! Changelog writer task
//!
//! Background loop that moves one replica's changes from the pending queue
//! into the durable log and trims records past the retention horizon.
//! Lifecycle: RUNNING -> (flush -> trim -> idle-wait)* -> DRAINING -> STOPPED.
//! A final flush on shutdown guarantees no buffered change is lost; an
//! unrecoverable storage fault requests a full server shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::config::ChangelogConfig;
use crate::csn::now_millis;
use crate::error::{Error, Result};
use crate::shutdown::{ShutdownHandle, ShutdownReason};

use super::log::ReplicaLog;
use super::queue::PendingWriteQueue;
use super::record::LogValue;

/// Handle to a running writer task
pub struct LogWriterTask {
    stop_tx: watch::Sender<bool>,
    done_rx: Option<oneshot::Receiver<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl LogWriterTask {
    /// Spawn the flush/trim loop for one replica
    pub fn spawn(
        queue: Arc<PendingWriteQueue>,
        log: Arc<ReplicaLog>,
        config: ChangelogConfig,
        shutdown: ShutdownHandle,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let handle = tokio::spawn(writer_loop(
            queue, log, config, shutdown, stop_rx, done_tx,
        ));

        Self {
            stop_tx,
            done_rx: Some(done_rx),
            handle,
        }
    }

    /// Request a stop and wait for the final flush to complete
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(done) = self.done_rx.take() {
            let _ = done.await;
        }
        let _ = self.handle.await;
    }
}

async fn writer_loop(
    queue: Arc<PendingWriteQueue>,
    log: Arc<ReplicaLog>,
    config: ChangelogConfig,
    shutdown: ShutdownHandle,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: oneshot::Sender<()>,
) {
    let server_id = log.server_id();
    let mut listener = shutdown.subscribe();
    let idle = Duration::from_millis(config.flush_interval_ms);

    tracing::info!("Writer task running for replica {}", server_id);

    loop {
        if let Err(e) = flush(&queue, &log, config.flush_chunk_size).await {
            fatal(&shutdown, server_id, "flush", e);
            break;
        }

        if let Err(e) = trim(&log, &config) {
            fatal(&shutdown, server_id, "trim", e);
            break;
        }

        if *stop_rx.borrow() || listener.is_shutdown() {
            break;
        }

        // Loop immediately while the queue sits above its low watermark,
        // otherwise sleep until entries arrive or the interval elapses
        if queue.below_low_mark().await {
            tokio::select! {
                _ = queue.wait_for_entries(idle) => {}
                _ = stop_rx.changed() => {}
                _ = listener.wait() => {}
            }
        }
    }

    // DRAINING: one final flush so no buffered change is lost
    if let Err(e) = flush(&queue, &log, config.flush_chunk_size).await {
        tracing::error!(
            "Final flush failed for replica {} during shutdown: {}",
            server_id,
            e
        );
    }

    tracing::info!("Writer task stopped for replica {}", server_id);
    let _ = done_tx.send(());
}

fn fatal(shutdown: &ShutdownHandle, server_id: u32, op: &str, err: Error) {
    tracing::error!(
        "Writer task {} failed for replica {}: {} - requesting server shutdown",
        op,
        server_id,
        err
    );
    shutdown.shutdown(ShutdownReason::FatalStorage);
}

/// Flush pending entries in fixed-size chunks, repeating while a full chunk
/// was drained to catch up with bursty producers
async fn flush(
    queue: &PendingWriteQueue,
    log: &ReplicaLog,
    chunk_size: usize,
) -> Result<()> {
    loop {
        let batch = queue.peek_up_to(chunk_size).await;
        if batch.is_empty() {
            return Ok(());
        }
        let drained = batch.len();

        for record in batch {
            log.append(record)?;
        }
        log.sync()?;
        queue.remove_front(drained).await;

        if drained < chunk_size {
            return Ok(());
        }
    }
}

/// Delete records older than the retention horizon in bounded batches,
/// always preserving the newest record so a fresh cursor can establish a
/// baseline reference point
fn trim(log: &ReplicaLog, config: &ChangelogConfig) -> Result<()> {
    let Some(purge_delay) = config.purge_delay() else {
        return Ok(());
    };
    let horizon = now_millis().saturating_sub(purge_delay.as_millis() as u64);

    let Some(newest) = log.read_last()? else {
        return Ok(());
    };

    let mut cursor = log.open_delete_cursor()?;
    let mut trimmed = 0usize;

    loop {
        match cursor.next() {
            Ok(Some((key, value))) => {
                if key.time_ms >= horizon {
                    break;
                }
                // The newest record survives even past the horizon
                if let LogValue::Change(_) = value {
                    if key == newest {
                        continue;
                    }
                }
                cursor.delete()?;

                if cursor.pending_deletes() >= config.trim_batch_size {
                    match cursor.commit() {
                        Ok(n) => trimmed += n,
                        Err(e) => {
                            cursor.abort();
                            return Err(e);
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                cursor.abort();
                return Err(e);
            }
        }
    }

    match cursor.commit() {
        Ok(n) => trimmed += n,
        Err(e) => {
            cursor.abort();
            return Err(e);
        }
    }

    if trimmed > 0 {
        tracing::debug!(
            "Trimmed {} expired records from replica {}",
            trimmed,
            log.server_id()
        );
        log.compact_if_needed()?;
    }

    Ok(())
}
