//! BufferDrainTask - moves the write-ahead buffer into storage
//!
//! ## Drain run
//!
//! 1. Snapshot the buffer length (under the buffer lock)
//! 2. Stream the snapshot line by line, decoding each into a pending row
//! 3. Commit a batch every `batch_size` rows, then the remainder
//! 4. Only if every commit succeeded: compact the snapshot prefix away
//!
//! A failed commit ends the run with the file untouched. The next run
//! re-commits the batches that already went through, so a failure can
//! duplicate rows but never lose them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::manager::Manager;
use super::messages::DrainReport;
use super::task::Task;
use crate::BufferedRecord;
use crate::config::DrainConfig;
use crate::storage::{RecordRow, StorageBackend};
use crate::wal::WriteAheadBuffer;

/// Drain the buffer into `backend` once
#[instrument(skip_all, fields(path = %buffer.path().display()))]
pub async fn drain_buffer(
    buffer: &WriteAheadBuffer,
    backend: &dyn StorageBackend,
    batch_size: usize,
) -> Result<DrainReport> {
    let batch_size = batch_size.max(1);
    let mut report = DrainReport::default();

    let snapshot = buffer.snapshot().await.context("failed to stat buffer")?;
    if snapshot == 0 {
        trace!("buffer empty");
        return Ok(report);
    }

    let mut reader = buffer
        .reader(snapshot)
        .await
        .context("failed to open buffer for reading")?;
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(line) = reader.next_line().await.context("failed to read buffer")? {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<BufferedRecord>(&line) {
            Ok(record) => batch.push(RecordRow::from_buffered(record)),
            Err(e) => {
                warn!(
                    "dropping malformed buffer line ({e}): {}",
                    String::from_utf8_lossy(&line)
                );
                report.malformed += 1;
                continue;
            }
        }

        if batch.len() >= batch_size {
            commit(backend, &mut batch, &mut report).await?;
        }
    }

    if !batch.is_empty() {
        commit(backend, &mut batch, &mut report).await?;
    }

    report.carried_over = buffer
        .compact(snapshot)
        .await
        .context("failed to remove drained records from buffer")?;

    Ok(report)
}

async fn commit(
    backend: &dyn StorageBackend,
    batch: &mut Vec<RecordRow>,
    report: &mut DrainReport,
) -> Result<()> {
    let rows = std::mem::take(batch);
    let len = rows.len();

    backend
        .insert_batch(rows)
        .await
        .with_context(|| format!("failed to commit batch of {len} records"))?;

    report.records += len;
    report.batches += 1;
    debug!("committed batch of {len} records");
    Ok(())
}

pub struct BufferDrainTask {
    buffer: Arc<WriteAheadBuffer>,
    config: DrainConfig,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl BufferDrainTask {
    pub fn new(buffer: Arc<WriteAheadBuffer>, config: DrainConfig) -> Self {
        Self {
            buffer,
            config,
            backend: None,
        }
    }
}

#[async_trait]
impl Task for BufferDrainTask {
    fn name(&self) -> &str {
        "buffer-drain"
    }

    async fn setup(
        &mut self,
        backend: Arc<dyn StorageBackend>,
        _manager: Arc<Manager>,
    ) -> anyhow::Result<()> {
        self.backend = Some(backend);
        Ok(())
    }

    #[instrument(skip_all, name = "buffer_drain")]
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let Some(backend) = self.backend.clone() else {
            error!("buffer drain started without setup");
            return;
        };

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    let drained =
                        drain_buffer(&self.buffer, backend.as_ref(), self.config.batch_size).await;
                    match drained {
                        Ok(report) if report.records > 0 || report.malformed > 0 => info!(
                            records = report.records,
                            batches = report.batches,
                            malformed = report.malformed,
                            carried_over = report.carried_over,
                            "drained buffer"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("drain aborted, buffer kept for next run: {e:#}"),
                    }
                }
            }
        }

        debug!("buffer drain stopped");
    }
}
