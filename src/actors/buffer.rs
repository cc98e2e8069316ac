//! BufferWriterTask - appends every accepted cache update to the write-ahead buffer

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::manager::Manager;
use super::messages::ChangeEvent;
use super::task::Task;
use crate::storage::StorageBackend;
use crate::wal::WriteAheadBuffer;

pub struct BufferWriterTask {
    buffer: Arc<WriteAheadBuffer>,
    receiver: Option<mpsc::Receiver<ChangeEvent>>,
}

impl BufferWriterTask {
    pub fn new(buffer: Arc<WriteAheadBuffer>) -> Self {
        Self {
            buffer,
            receiver: None,
        }
    }

    async fn write(&self, event: &ChangeEvent) {
        if let Err(e) = self.buffer.append(event).await {
            error!(vmid = event.vmid, time = event.sample.time, "failed to buffer sample: {e}");
        }
    }
}

#[async_trait]
impl Task for BufferWriterTask {
    fn name(&self) -> &str {
        "buffer-writer"
    }

    async fn setup(
        &mut self,
        _backend: Arc<dyn StorageBackend>,
        manager: Arc<Manager>,
    ) -> anyhow::Result<()> {
        let receiver = manager
            .take_change_receiver()
            .await
            .context("change notifier is already consumed by another buffer writer")?;

        self.buffer.open().await.with_context(|| {
            format!(
                "failed to open write-ahead buffer {}",
                self.buffer.path().display()
            )
        })?;

        self.receiver = Some(receiver);
        Ok(())
    }

    #[instrument(skip_all, name = "buffer_writer")]
    async fn run(mut self: Box<Self>, cancel: CancellationToken) {
        let Some(mut receiver) = self.receiver.take() else {
            error!("buffer writer started without setup");
            return;
        };

        info!("buffering samples to {}", self.buffer.path().display());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = receiver.recv() => match event {
                    Some(event) => self.write(&event).await,
                    None => {
                        warn!("change notifier closed");
                        break;
                    }
                }
            }
        }

        // whatever is already queued still makes it to disk
        receiver.close();
        while let Some(event) = receiver.recv().await {
            self.write(&event).await;
        }

        if let Err(e) = self.buffer.close().await {
            error!("failed to close write-ahead buffer: {e}");
        }
        debug!("buffer writer stopped");
    }
}
