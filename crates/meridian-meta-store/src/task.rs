//! Background tasks with cooperative shutdown

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// A spawned loop that stops when asked
pub(crate) struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body`, handing it the receiver it should watch for shutdown
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        Self {
            name,
            shutdown,
            join: tokio::spawn(body(rx)),
        }
    }

    /// Signal shutdown and wait for the loop to return
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!("Background task {} ended abnormally: {}", self.name, e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Resolves once shutdown is signalled or the sender is gone
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
