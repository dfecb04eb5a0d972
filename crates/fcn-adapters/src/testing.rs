//! In-process adapters for exercising the pipeline without real sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fcn_core::CandidateRecord;

use crate::{AdapterError, SourceAdapter, SourceKind};

/// Returns the same records on every call.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    source_id: String,
    records: Vec<CandidateRecord>,
}

impl StaticAdapter {
    pub fn new(source_id: impl Into<String>, records: Vec<CandidateRecord>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        Ok(self.records.clone())
    }
}

/// Fails every call with a fixed message and counts invocations.
#[derive(Debug)]
pub struct FailingAdapter {
    source_id: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingAdapter {
    pub fn new(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::Message(self.message.clone()))
    }
}

/// Sleeps before delegating, to make completion order differ from registration order.
pub struct DelayedAdapter {
    inner: Box<dyn SourceAdapter>,
    delay: Duration,
}

impl DelayedAdapter {
    pub fn new(inner: Box<dyn SourceAdapter>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl SourceAdapter for DelayedAdapter {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        tokio::time::sleep(self.delay).await;
        self.inner.collect().await
    }
}
