//! Composition of the process's long-lived tasks.
//!
//! Every runnable gets the shared shutdown signal and is expected to return
//! when it flips; returning because of shutdown is not an error. `wait`
//! blocks until all of them have exited.

use std::fmt::Display;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

pub struct Manager {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Manager {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// The signal handed to each runnable.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start a runnable. Failures are logged under `name`; they never take
    /// the rest of the process down.
    pub fn spawn<E, F>(&mut self, name: &str, fut: F)
    where
        E: Display,
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let name = name.to_owned();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(task = %name, error = %e, "runnable failed");
            }
        }));
    }

    /// Tell every runnable to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every runnable to exit.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_releases_all_runnables() {
        let mut manager = Manager::new();
        for _ in 0..3 {
            let mut shutdown = manager.shutdown_signal();
            manager.spawn::<Infallible, _>("waiter", async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            });
        }

        manager.stop();
        tokio::time::timeout(Duration::from_secs(5), manager.wait())
            .await
            .expect("runnables did not exit");
    }
}
