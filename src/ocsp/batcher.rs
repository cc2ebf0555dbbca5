//! OCSP Log Batcher: a single-consumer loop that aggregates signing
//! events into bounded AUDIT lines (§4.3).
//!
//! Grounded on the teacher's `start_rotation_task` background-loop shape
//! (`tokio::spawn` + `tokio::time::interval`), adapted from a fixed-period
//! poll into a `select!` over a channel and a deadline timer so records
//! also end a batch early on size.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::audit;
use crate::error::{CaError, CaResult};
use crate::metrics::CaMetrics;
use crate::ocsp::generator::CertStatus;
use crate::serial::Serial;

/// Fixed per-entry cost used to decide when appending the next record
/// would overflow the configured max line length.
const ENTRY_SIZE_ESTIMATE: usize = 39;

#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub serial: Serial,
    pub status: CertStatus,
    pub reason: i32,
}

/// Handle to the running batcher loop. Cloning is cheap; all clones
/// enqueue onto the same channel.
pub struct OcspLogBatcher {
    tx: Mutex<Option<mpsc::Sender<BatchRecord>>>,
    drained: Mutex<Option<oneshot::Receiver<()>>>,
}

impl OcspLogBatcher {
    /// Spawns the consumer loop and returns a handle. `max_queue_depth`
    /// bounds the channel so a stalled consumer back-pressures producers
    /// instead of growing without limit.
    pub fn spawn(
        max_queue_depth: usize,
        max_line_len: usize,
        emit_interval: Duration,
        metrics: Arc<CaMetrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(max_queue_depth);
        let (drained_tx, drained_rx) = oneshot::channel();

        tokio::spawn(async move {
            run_loop(rx, max_line_len, emit_interval, metrics).await;
            let _ = drained_tx.send(());
        });

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            drained: Mutex::new(Some(drained_rx)),
        })
    }

    pub async fn enqueue(&self, record: BatchRecord) -> CaResult<()> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().expect("enqueue called after batcher stop");
        tx.send(record)
            .await
            .map_err(|_| CaError::internal("OCSP log batcher consumer has shut down"))
    }

    /// Drops the sender so the consumer loop drains pending records and
    /// exits, then blocks until it has.
    pub async fn stop(&self) {
        self.tx.lock().await.take();
        if let Some(drained_rx) = self.drained.lock().await.take() {
            let _ = drained_rx.await;
        }
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<BatchRecord>,
    max_line_len: usize,
    emit_interval: Duration,
    metrics: Arc<CaMetrics>,
) {
    let mut buffer = String::new();
    let mut deadline = Instant::now() + emit_interval;

    loop {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(record) => {
                        if !buffer.is_empty() && buffer.len() + ENTRY_SIZE_ESTIMATE > max_line_len {
                            emit_batch(&mut buffer);
                        }
                        buffer.push_str(&format_entry(&record));
                        metrics.batcher_queue_depth.set(rx.len() as i64);
                    }
                    None => {
                        if !buffer.is_empty() {
                            emit_batch(&mut buffer);
                        }
                        metrics.batcher_queue_depth.set(0);
                        return;
                    }
                }
            }
            _ = sleep => {
                if !buffer.is_empty() {
                    emit_batch(&mut buffer);
                }
                deadline = Instant::now() + emit_interval;
            }
        }
    }
}

fn format_entry(record: &BatchRecord) -> String {
    let reason = match record.status {
        CertStatus::Revoked if record.reason != 0 => record.reason.to_string(),
        _ => "_".to_string(),
    };
    format!("{}:{},", record.serial.to_hex(), reason)
}

fn emit_batch(buffer: &mut String) {
    let trimmed = buffer.trim_end_matches(',');
    audit::ocsp_signed_line(trimmed);
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::SerialAllocator;

    #[tokio::test]
    async fn stop_drains_pending_records_and_enqueue_after_stop_panics() {
        let metrics = Arc::new(CaMetrics::new());
        let batcher = OcspLogBatcher::spawn(16, 200, Duration::from_secs(60), metrics);
        let serial = SerialAllocator::new(1).unwrap().allocate().unwrap();
        batcher
            .enqueue(BatchRecord {
                serial,
                status: CertStatus::Good,
                reason: 0,
            })
            .await
            .unwrap();
        batcher.stop().await;

        let serial = SerialAllocator::new(1).unwrap().allocate().unwrap();
        let record = BatchRecord {
            serial,
            status: CertStatus::Good,
            reason: 0,
        };
        use futures::FutureExt;
        let result = std::panic::AssertUnwindSafe(batcher.enqueue(record))
            .catch_unwind()
            .await;
        assert!(result.is_err());
    }
}
