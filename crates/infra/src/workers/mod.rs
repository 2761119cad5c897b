//! Background worker plumbing shared by the sweeper and the dispatcher.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to control and join a background worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: impl Into<String>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            name: name.into(),
            shutdown,
            joins: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, join: JoinHandle<()>) {
        self.joins.push(join);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks behind this handle.
    pub fn tasks(&self) -> usize {
        self.joins.len()
    }

    /// Request graceful shutdown and wait for every task to stop.
    ///
    /// Tasks finish their in-flight job before exiting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(worker = %self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}

/// Build a shutdown channel for a worker: `true` means stop.
pub(crate) fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Wait until `rx` says stop. Resolves immediately if the sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
