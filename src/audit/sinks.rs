use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{AuditSink, InvocationRecord, Outcome};
use crate::Result;

/// Bounded in-memory buffer for tests and diagnostics, not a durable log.
///
/// Once `max` records are held the oldest is evicted; evictions are counted by
/// [`dropped`](Self::dropped) and logged.
pub struct InMemoryAuditSink {
    records: Arc<RwLock<VecDeque<InvocationRecord>>>,
    max_records: usize,
    dropped: AtomicU64,
}

impl InMemoryAuditSink {
    pub fn new(max: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_records: max.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records
            .read()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn records_for(&self, capability_id: &str) -> Vec<InvocationRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.capability_id == capability_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: InvocationRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.push_back(record);
        while records.len() > self.max_records {
            if let Some(evicted) = records.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %evicted.request_id, max = self.max_records, "in-memory audit buffer full; evicted oldest record");
            }
        }
        Ok(())
    }
}

/// Emits each record as a structured `tracing` event (target `atp::audit`).
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, r: InvocationRecord) -> Result<()> {
        if r.outcome == Outcome::Success {
            info!(
                target: "atp::audit",
                request_id = %r.request_id,
                host = %r.host,
                capability = %r.capability_id,
                agent = r.agent_identity.as_deref().unwrap_or("-"),
                outcome = %r.outcome,
                status = r.http_status,
                attempts = r.attempts,
                duration_ms = r.duration_ms,
                "invocation"
            );
        } else {
            warn!(
                target: "atp::audit",
                request_id = %r.request_id,
                host = %r.host,
                capability = %r.capability_id,
                agent = r.agent_identity.as_deref().unwrap_or("-"),
                outcome = %r.outcome,
                status = r.http_status,
                attempts = r.attempts,
                duration_ms = r.duration_ms,
                error = r.error.as_deref().unwrap_or(""),
                "invocation"
            );
        }
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn record(&self, record: InvocationRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Fans records out; a failing sink does not stop the others.
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AuditSink for CompositeAuditSink {
    async fn record(&self, record: InvocationRecord) -> Result<()> {
        for s in &self.sinks {
            if let Err(e) = s.record(record.clone()).await {
                warn!(error = %e, "audit sink failed");
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.flush().await;
        }
        Ok(())
    }
}

pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _: InvocationRecord) -> Result<()> {
        Ok(())
    }
}
