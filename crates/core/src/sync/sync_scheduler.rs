//! Background loop that fires periodic sync triggers.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{SyncOutcome, SyncTrigger};
use crate::engine::BankingEngine;

struct BackgroundTask {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Owns the periodic sync task. At most one loop runs per scheduler.
#[derive(Default)]
pub struct SyncScheduler {
    background_task: Mutex<Option<BackgroundTask>>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the loop unless it is already running.
    pub async fn start(&self, engine: Arc<BankingEngine>) {
        let mut guard = self.background_task.lock().await;
        if let Some(task) = guard.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
            guard.take();
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                let interval = engine.sync_config().await.interval();
                let sleep_for = interval.to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = stop_rx.changed() => break,
                }

                run_periodic(&engine).await;
                if *stop_rx.borrow() {
                    break;
                }
            }
            debug!("[Sync] Background loop exited");
        });
        info!("[Sync] Background scheduler started");
        *guard = Some(BackgroundTask { handle, stop_tx });
    }

    /// Signals the loop and waits for it. A cycle already running is allowed
    /// to finish.
    pub async fn stop(&self) {
        let mut guard = self.background_task.lock().await;
        if let Some(task) = guard.take() {
            if task.stop_tx.send(true).is_err() {
                debug!("[Sync] Background loop had already exited");
            }
            if let Err(err) = task.handle.await {
                warn!("[Sync] Background loop ended abnormally: {}", err);
            }
            info!("[Sync] Background scheduler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.background_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

async fn run_periodic(engine: &BankingEngine) {
    match engine.trigger_sync(SyncTrigger::Periodic).await {
        SyncOutcome::Skipped(reason) => {
            debug!("[Sync] Periodic sync skipped: {:?}", reason);
        }
        SyncOutcome::Completed(result) => {
            if result.status.is_successful() {
                debug!(
                    "[Sync] Periodic sync {:?}: {} new, {} matched",
                    result.status, result.new_transactions, result.auto_matched
                );
            } else {
                warn!(
                    "[Sync] Periodic sync {:?}: {}",
                    result.status,
                    result.error.as_deref().unwrap_or("no detail")
                );
            }
        }
    }
}
