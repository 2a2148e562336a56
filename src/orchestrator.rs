use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::database_ops::db::{self, PostStore};
use crate::database_ops::gallery::{
    self, GalleryApi, GalleryProvider, SyncOptions, SyncReport, SyncSummary,
};

impl From<&Settings> for SyncOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            pagination: settings.pagination,
            request_delay: Duration::from_millis(settings.http.request_delay_ms),
        }
    }
}

pub fn build_provider(settings: &Settings) -> Result<GalleryProvider> {
    GalleryProvider::new(Some(&settings.http.base_url), Some(settings.http.timeout_secs))
        .context("failed to build gallery http client")
}

/// Connect, run a single sync, then release the pool whatever the outcome.
pub async fn run_once(settings: &Settings) -> Result<SyncReport> {
    let provider = build_provider(settings)?;
    let store = db::connect(&settings.database).await?;
    let result = gallery::sync(
        store.as_ref(),
        &provider,
        &settings.user_id,
        &SyncOptions::from(settings),
    )
    .await;
    store.close().await;
    result
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncState {
    pub running: bool,
    pub last: Option<SyncSummary>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct LastRun {
    summary: Option<SyncSummary>,
    error: Option<String>,
}

/// Shared sync driver for `serve`: periodic runs plus manual triggers, never overlapping.
pub struct Syncer {
    store: Arc<dyn PostStore>,
    api: Arc<dyn GalleryApi>,
    user_id: String,
    options: SyncOptions,
    gate: Arc<Mutex<()>>,
    running: AtomicBool,
    last: RwLock<LastRun>,
}

impl Syncer {
    pub fn new(
        store: Arc<dyn PostStore>,
        api: Arc<dyn GalleryApi>,
        user_id: impl Into<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            api,
            user_id: user_id.into(),
            options,
            gate: Arc::new(Mutex::new(())),
            running: AtomicBool::new(false),
            last: RwLock::new(LastRun::default()),
        }
    }

    pub fn store(&self) -> Arc<dyn PostStore> {
        Arc::clone(&self.store)
    }

    /// Hold the run gate as if a sync were in flight.
    #[cfg(test)]
    pub(crate) async fn hold_gate(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for any in-flight run, then sync.
    pub async fn run(&self) -> Result<SyncSummary> {
        let _guard = self.gate.lock().await;
        self.run_locked().await
    }

    /// Start a background run unless one is already going. Returns whether it started.
    pub fn try_start(self: &Arc<Self>) -> bool {
        let Ok(guard) = Arc::clone(&self.gate).try_lock_owned() else {
            return false;
        };
        // Visible as running before the task is first polled.
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            // Outcome is recorded in `last`; nothing else to do with it here.
            let _ = this.run_locked().await;
        });
        true
    }

    /// Caller must hold the gate.
    async fn run_locked(&self) -> Result<SyncSummary> {
        self.running.store(true, Ordering::SeqCst);
        let outcome = gallery::sync(
            self.store.as_ref(),
            self.api.as_ref(),
            &self.user_id,
            &self.options,
        )
        .await;
        self.running.store(false, Ordering::SeqCst);
        let mut last = self.last.write().await;
        match outcome {
            Ok(report) => {
                let summary = report.summary();
                last.summary = Some(summary.clone());
                last.error = None;
                Ok(summary)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync run failed");
                last.error = Some(format!("{err:#}"));
                Err(err)
            }
        }
    }

    pub async fn state(&self) -> SyncState {
        let last = self.last.read().await;
        SyncState {
            running: self.is_running(),
            last: last.summary.clone(),
            last_error: last.error.clone(),
        }
    }

    /// Sync now, then every `interval`. A tick that lands on a running sync is skipped.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "periodic sync enabled");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Ok(_guard) = self.gate.try_lock() else {
                warn!("previous sync still running; skipping tick");
                continue;
            };
            if let Ok(summary) = self.run_locked().await {
                info!(
                    inserted = summary.inserted,
                    failed = summary.failed,
                    "periodic sync done"
                );
            }
        }
    }
}
