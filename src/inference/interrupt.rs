//! Cooperative cancellation flag shared by the orchestrator and the running model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Armed/tripped flag polled at every token boundary.
///
/// Clones share the same flag. Tripping is idempotent and tripping an idle
/// token is harmless; the next run resets it before starting.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    tripped: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token; generation stops before the next token is issued.
    pub fn interrupt(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    /// Re-arm the token.
    pub fn reset(&self) {
        self.tripped.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}
