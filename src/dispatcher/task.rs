//! Polling loop and background task handles.

use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::Dispatcher;
use crate::utils::retry::store_outage_backoff;

/// Handle to running dispatcher tasks.
pub struct DispatcherHandle {
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal every task to stop. Returns immediately.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Dispatcher task panicked");
            }
        }
    }

    /// Stop and wait.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Spawn one task per dispatcher, sharing a single stop signal.
pub fn spawn_pool(dispatchers: Vec<Dispatcher>) -> DispatcherHandle {
    let (cancel, cancel_rx) = watch::channel(false);
    let tasks = dispatchers
        .into_iter()
        .map(|dispatcher| {
            let cancel_rx = cancel_rx.clone();
            tokio::spawn(async move { dispatcher.run(cancel_rx).await })
        })
        .collect();
    DispatcherHandle { cancel, tasks }
}

impl Dispatcher {
    /// Spawn this dispatcher's polling loop.
    pub fn spawn(self) -> DispatcherHandle {
        spawn_pool(vec![self])
    }

    /// Poll until `cancel` turns true or its sender is dropped.
    ///
    /// Cancellation is observed while sleeping and between iterations; an
    /// iteration cut short leaves its claims to expire and be recovered.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(
            worker_id = %self.settings.worker_id,
            batch_size = self.settings.batch_size,
            poll_interval = ?self.settings.poll_interval,
            lease = ?self.settings.lease,
            max_attempts = self.settings.max_attempts,
            "Dispatcher started"
        );

        let mut outage: Option<backon::ExponentialBackoff> = None;

        loop {
            if *cancel.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.run_once() => result,
                _ = cancel.changed() => break,
            };

            let pause = match result {
                Ok(report) => {
                    if outage.take().is_some() {
                        info!(worker_id = %self.settings.worker_id, "Store reachable again");
                    }
                    if report.published > 0 || report.dead_lettered > 0 {
                        info!(
                            worker_id = %self.settings.worker_id,
                            published = report.published,
                            released = report.released,
                            dead_lettered = report.dead_lettered,
                            "Dispatched outbox batch"
                        );
                    }
                    if report.batch_full {
                        Duration::ZERO
                    } else {
                        self.settings.poll_interval
                    }
                }
                Err(e) => {
                    let delay = outage
                        .get_or_insert_with(|| store_outage_backoff().build())
                        .next()
                        .unwrap_or(self.settings.poll_interval);
                    error!(
                        worker_id = %self.settings.worker_id,
                        error = %e,
                        retry_in = ?delay,
                        "Dispatch iteration failed"
                    );
                    delay
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            let woken = async {
                match &self.wakeup {
                    Some(wakeup) => wakeup.notified().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = woken => {
                    debug!(worker_id = %self.settings.worker_id, "Dispatcher woken");
                }
                _ = cancel.changed() => break,
            }
        }

        info!(worker_id = %self.settings.worker_id, "Dispatcher stopped");
    }
}
