//! Shared fixtures for the orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thinkstream_core::{
    config::ScriptedConfig,
    inference::{Orchestrator, OrchestratorClient},
    runtime::{BackendLoader, Model, ProgressSink, ScriptedLoader, StaticProbe, Tokenizer},
    StatusMessage,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Scripted backend with no artificial delays
pub fn fast_config(reply: &str) -> ScriptedConfig {
    ScriptedConfig {
        reply: reply.to_owned(),
        token_delay_ms: 0,
        load_delay_ms: 0,
        ..Default::default()
    }
}

/// Scripted loader that counts how often each artifact group is fetched
pub struct CountingLoader {
    inner: ScriptedLoader,
    pub tokenizer_loads: AtomicUsize,
    pub model_loads: AtomicUsize,
}

impl CountingLoader {
    pub fn new(config: ScriptedConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: ScriptedLoader::new(config),
            tokenizer_loads: AtomicUsize::new(0),
            model_loads: AtomicUsize::new(0),
        })
    }

    pub fn model_loads(&self) -> usize {
        self.model_loads.load(Ordering::SeqCst)
    }

    pub fn tokenizer_loads(&self) -> usize {
        self.tokenizer_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendLoader for CountingLoader {
    async fn load_tokenizer(&self, progress: ProgressSink) -> anyhow::Result<Arc<dyn Tokenizer>> {
        self.tokenizer_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_tokenizer(progress).await
    }

    async fn load_model(&self, progress: ProgressSink) -> anyhow::Result<Arc<dyn Model>> {
        self.model_loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.inner.load_model(progress).await
    }

    fn describe(&self) -> String {
        format!("counting {}", self.inner.describe())
    }
}

/// Orchestrator on its own thread with a GPU that is always present
pub fn spawn(loader: Arc<dyn BackendLoader>) -> OrchestratorClient {
    Orchestrator::builder(loader)
        .probe(StaticProbe::available("integration-test-adapter"))
        .spawn()
        .unwrap()
}

pub async fn next(client: &mut OrchestratorClient) -> StatusMessage {
    tokio::time::timeout(EVENT_TIMEOUT, client.next_event())
        .await
        .expect("timed out waiting for a status event")
        .expect("orchestrator stopped")
}

/// Events up to the next terminal one, without per-file progress
pub async fn until_terminal(client: &mut OrchestratorClient) -> Vec<StatusMessage> {
    let events = tokio::time::timeout(EVENT_TIMEOUT, client.collect_until_terminal())
        .await
        .expect("timed out waiting for a terminal event");
    events
        .into_iter()
        .filter(|e| !matches!(e, StatusMessage::Progress { .. }))
        .collect()
}

/// Concatenated `update` fragments
pub fn streamed_text(events: &[StatusMessage]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StatusMessage::Update { output, .. } => Some(output.as_str()),
            _ => None,
        })
        .collect()
}

pub fn canonical(event: &StatusMessage) -> String {
    match event {
        StatusMessage::Complete { output, .. } => output.canonical().unwrap_or_default().to_owned(),
        other => panic!("expected complete, got {other:?}"),
    }
}
