//! Single-flight backend handle.
//!
//! The first `get_instance` starts resolution of the tokenizer and model;
//! every later caller, concurrent or not, awaits the same shared future. A
//! failed resolution is delivered to every waiter of that attempt and then
//! forgotten, so the next explicit `load`/`generate` starts a fresh attempt.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ChatError;
use crate::runtime::{Backend, BackendLoader, ProgressSink};

type Resolution = Shared<BoxFuture<'static, Result<Backend, ChatError>>>;

pub struct BackendHandle {
    loader: Arc<dyn BackendLoader>,
    progress: ProgressSink,
    /// In-flight or settled resolution, tagged with its attempt number
    slot: Mutex<Option<(u64, Resolution)>>,
    attempts: AtomicU64,
}

impl BackendHandle {
    pub fn new(loader: Arc<dyn BackendLoader>, progress: ProgressSink) -> Self {
        Self {
            loader,
            progress,
            slot: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    /// Resolve the backend once and share it.
    pub async fn get_instance(&self) -> Result<Backend, ChatError> {
        let (attempt, resolution) = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some((attempt, resolution)) => (*attempt, resolution.clone()),
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let resolution = resolve(self.loader.clone(), self.progress.clone())
                        .boxed()
                        .shared();
                    *slot = Some((attempt, resolution.clone()));
                    (attempt, resolution)
                }
            }
        };

        let result = resolution.await;
        if let Err(e) = &result {
            let mut slot = self.slot.lock();
            if matches!(slot.as_ref(), Some((current, _)) if *current == attempt) {
                warn!(attempt, error = %e, "backend resolution failed; next request retries");
                *slot = None;
            }
        }
        result
    }

    /// True once a resolution has completed successfully
    pub fn is_resolved(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .and_then(|(_, resolution)| resolution.peek())
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Number of resolutions started so far
    pub fn resolution_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

async fn resolve(loader: Arc<dyn BackendLoader>, progress: ProgressSink) -> Result<Backend, ChatError> {
    info!(loader = %loader.describe(), "resolving backend");

    let (tokenizer, model) = futures::try_join!(
        loader.load_tokenizer(progress.clone()),
        loader.load_model(progress),
    )
    .map_err(|e| ChatError::resolution(format!("{e:#}")))?;

    info!("backend resolved");
    Ok(Backend { tokenizer, model })
}
