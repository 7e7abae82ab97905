//! Cooperative job cancellation backed by the job store.
//!
//! A [`JobCancellation`] owns a `CancellationToken` and a background ticker
//! that polls [`JobStore::is_cancelled`] every interval. Once the store
//! reports the job cancelled, the token fires and stays fired. The pipeline
//! and generation drivers only read the token; they never touch the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::JobStore;

pub struct JobCancellation {
    job_id: String,
    token: CancellationToken,
    cached: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl JobCancellation {
    /// Start polling `store` for `job_id` every `interval`.
    pub fn start(job_id: impl Into<String>, store: Arc<dyn JobStore>, interval: Duration) -> Self {
        let job_id = job_id.into();
        let token = CancellationToken::new();
        let cached = Arc::new(AtomicBool::new(false));

        let poller = tokio::spawn(poll_store(
            job_id.clone(),
            store,
            interval,
            token.clone(),
            cached.clone(),
        ));

        Self {
            job_id,
            token,
            cached,
            poller: Mutex::new(Some(poller)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Last observed state; never blocks.
    pub fn is_cancelled(&self) -> bool {
        self.cached.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// A handle to the signal, for the pipeline and generators.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire locally without waiting for the store.
    pub fn cancel(&self) {
        self.cached.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Stop polling. The token keeps whatever state it has.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.poller.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for JobCancellation {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_store(
    job_id: String,
    store: Arc<dyn JobStore>,
    interval: Duration,
    token: CancellationToken,
    cached: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store.is_cancelled(&job_id).await {
            Ok(true) => {
                info!(job = %job_id, "cancellation requested");
                cached.store(true, Ordering::SeqCst);
                token.cancel();
                break;
            }
            Ok(false) => debug!(job = %job_id, "cancellation poll: still running"),
            // A failed poll keeps the last known state.
            Err(e) => warn!(job = %job_id, error = %e, "cancellation poll failed"),
        }
    }
}
