use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::manager::Manager;
use crate::storage::StorageBackend;

/// A long-running unit of work supervised by the [`Manager`]
///
/// The manager only ever sees `Box<dyn Task>`: it calls `setup` once, then
/// moves the task into its own tokio task and calls `run`. `run` must return
/// soon after `cancel` fires, at its next suspension point.
#[async_trait]
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Acquire what the run loop needs (receivers, file handles, clients)
    ///
    /// An error is logged by the manager and the task idles until shutdown.
    async fn setup(
        &mut self,
        backend: Arc<dyn StorageBackend>,
        manager: Arc<Manager>,
    ) -> anyhow::Result<()>;

    async fn run(self: Box<Self>, cancel: CancellationToken);
}
