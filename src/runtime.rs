//! Event loop driving a bootstrapped [`Reconciler`]
//!
//! - a feeder task forwards Service keys from the watch into a queue
//! - the dispatcher spawns one task per key, bounded by a semaphore of
//!   `RECONCILE_WORKERS` permits; a key already in flight is marked dirty and
//!   re-run once the current pass finishes
//! - failed keys are requeued after `RETRY_DELAY_SECONDS`
//! - a healing task calls [`Reconciler::heal`] every `HEAL_INTERVAL_SECONDS`
//!
//! Shutdown stops dispatching; in-flight commands run to completion.

use crate::config::AgentConfig;
use crate::core::runner::CommandRunner;
use crate::reconciler::{ClusterSource, Reconciler};
use crate::service::ServiceKey;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Keys currently being reconciled, and those that changed meanwhile
#[derive(Debug, Default)]
struct KeyState {
    in_flight: HashSet<ServiceKey>,
    dirty: HashSet<ServiceKey>,
}

impl KeyState {
    /// Returns `false` (and marks the key dirty) if it is already in flight.
    fn begin(&mut self, key: &ServiceKey) -> bool {
        if self.in_flight.contains(key) {
            self.dirty.insert(key.clone());
            return false;
        }
        self.in_flight.insert(key.clone());
        true
    }

    /// Returns `true` if the key changed while it was in flight.
    fn finish(&mut self, key: &ServiceKey) -> bool {
        self.in_flight.remove(key);
        self.dirty.remove(key)
    }
}

/// Runs until `shutdown` resolves.
///
/// `reconciler` must already be bootstrapped.
pub async fn run<R, C, S, F>(
    reconciler: Arc<Reconciler<R, C>>,
    config: &AgentConfig,
    keys: S,
    shutdown: F,
) where
    R: CommandRunner,
    C: ClusterSource,
    S: Stream<Item = ServiceKey> + Send + 'static,
    F: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ServiceKey>();

    let feeder = {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut keys = std::pin::pin!(keys);
            while let Some(key) = keys.next().await {
                if tx.send(key).is_err() {
                    break;
                }
            }
            debug!("service key stream ended");
        })
    };

    let healer = tokio::spawn(heal_loop(reconciler.clone(), config.heal_interval));

    let permits = Arc::new(Semaphore::new(config.workers));
    let state = Arc::new(Mutex::new(KeyState::default()));
    let retry_delay = config.retry_delay;
    let mut shutdown = std::pin::pin!(shutdown);

    info!(workers = config.workers, "reconcile loop started");

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            Some(key) = rx.recv() => {
                let fresh = state.lock().unwrap_or_else(PoisonError::into_inner).begin(&key);
                if !fresh {
                    debug!(service = %key, "already in flight, marked dirty");
                    continue;
                }
                tokio::spawn(reconcile_one(
                    reconciler.clone(),
                    key,
                    permits.clone(),
                    state.clone(),
                    tx.clone(),
                    retry_delay,
                ));
            }
        }
    }

    feeder.abort();
    healer.abort();
}

async fn reconcile_one<R: CommandRunner, C: ClusterSource>(
    reconciler: Arc<Reconciler<R, C>>,
    key: ServiceKey,
    permits: Arc<Semaphore>,
    state: Arc<Mutex<KeyState>>,
    tx: mpsc::UnboundedSender<ServiceKey>,
    retry_delay: Duration,
) {
    let result = match permits.acquire_owned().await {
        Ok(_permit) => reconciler.handle(&key).await,
        // Semaphore closed: runtime is shutting down
        Err(_) => return,
    };

    let dirty = state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish(&key);

    match result {
        Ok(()) => {
            debug!(service = %key, "reconciled");
            if dirty {
                let _ = tx.send(key);
            }
        }
        Err(e) => {
            warn!(service = %key, "Reconcile failed, retrying in {retry_delay:?}: {e}");
            tokio::time::sleep(retry_delay).await;
            let _ = tx.send(key);
        }
    }
}

async fn heal_loop<R: CommandRunner, C: ClusterSource>(
    reconciler: Arc<Reconciler<R, C>>,
    period: Duration,
) {
    // Bootstrap just ran; first tick is one period out.
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match reconciler.heal().await {
            Ok(()) => debug!("heal pass complete"),
            Err(e) => warn!("Heal pass failed: {e}"),
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
