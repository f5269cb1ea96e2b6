//! Coordinator - the workflow state machine
//!
//! Starts workflows by publishing their first message, tracks one
//! `RequestRecord` per trace as stage agents report back, and lets callers
//! wait for the terminal outcome.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agents::names::{COORDINATOR, INGESTION, RETRIEVAL};
use crate::coord::types::{RequestRecord, RequestStatus, SystemStats, WorkflowKind, WorkflowResult};
use crate::core::errors::{RagError, Result};
use crate::pubsub::{
    IngestionRequest, Message, MessageBus, MessageHandler, Payload, RetrievalRequest, TraceId,
};

type RecordSlot = Arc<watch::Sender<RequestRecord>>;

struct CoordinatorInner {
    bus: MessageBus,
    records: RwLock<HashMap<TraceId, RecordSlot>>,
}

/// Tracks every workflow started through it.
///
/// Each record sits in a `watch` channel: terminal transitions go through
/// `send_if_modified`, which makes "first terminal message wins" atomic and
/// wakes all waiters at once.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Creates a coordinator that is not yet subscribed to `bus`
    pub fn new(bus: MessageBus) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                bus,
                records: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Creates a coordinator and subscribes it under [`COORDINATOR`]
    pub fn attach(bus: MessageBus) -> Result<Self> {
        let coordinator = Self::new(bus);
        coordinator.inner.bus.subscribe(
            COORDINATOR,
            Arc::new(CoordinatorHandler {
                inner: Arc::downgrade(&coordinator.inner),
            }),
        )?;
        Ok(coordinator)
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Publishes an ingestion request and returns its trace without waiting
    pub fn start_document_workflow(
        &self,
        filename: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> TraceId {
        let filename = filename.into();
        let message = self.inner.bus.create(
            COORDINATOR,
            INGESTION,
            Payload::IngestionRequest(IngestionRequest {
                filename: filename.clone(),
                content: content.into(),
            }),
        );
        let trace = message.trace().clone();
        self.track(RequestRecord::new(
            trace.clone(),
            WorkflowKind::DocumentUpload,
            filename.as_str(),
        ));

        info!(trace = %trace, filename = %filename, "Starting document upload workflow");
        self.inner.bus.publish(message);
        trace
    }

    /// Publishes a retrieval request and returns its trace without waiting
    pub fn start_query_workflow(&self, query: impl Into<String>, top_k: usize) -> TraceId {
        let query = query.into();
        let message = self.inner.bus.create(
            COORDINATOR,
            RETRIEVAL,
            Payload::RetrievalRequest(RetrievalRequest {
                query: query.clone(),
                top_k,
            }),
        );
        let trace = message.trace().clone();
        self.track(RequestRecord::new(
            trace.clone(),
            WorkflowKind::UserQuery,
            query.as_str(),
        ));

        info!(trace = %trace, query = %query, top_k, "Starting query workflow");
        self.inner.bus.publish(message);
        trace
    }

    fn track(&self, record: RequestRecord) {
        let trace = record.trace.clone();
        let (tx, _rx) = watch::channel(record);
        self.inner
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trace, Arc::new(tx));
    }

    fn slot(&self, trace: &TraceId) -> Option<RecordSlot> {
        self.inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trace)
            .cloned()
    }

    /// Applies a reported outcome to its record.
    ///
    /// Returns `true` when the message caused a terminal transition. Messages
    /// for unknown traces, unhandled kinds, and duplicates for an already
    /// terminal record are ignored.
    pub fn on_message(&self, message: &Message) -> bool {
        match message.payload() {
            Payload::IndexingComplete(p) => self.finish(
                message,
                RequestStatus::Completed,
                WorkflowResult::indexed(p.filename.clone(), p.vector_count),
            ),
            Payload::GenerationComplete(p) => self.finish(
                message,
                RequestStatus::Completed,
                WorkflowResult::answered(
                    p.query.clone(),
                    p.answer.clone(),
                    p.sources.clone(),
                    p.context_used,
                ),
            ),
            Payload::Error(p) => self.finish(
                message,
                RequestStatus::Error,
                WorkflowResult::failed(p.error.clone()),
            ),
            _ => {
                warn!(
                    kind = %message.kind(),
                    trace = %message.trace(),
                    sender = %message.sender(),
                    "Coordinator ignoring unexpected message"
                );
                false
            }
        }
    }

    fn finish(&self, message: &Message, status: RequestStatus, result: WorkflowResult) -> bool {
        let trace = message.trace();
        let Some(slot) = self.slot(trace) else {
            warn!(trace = %trace, kind = %message.kind(), "No request record for trace");
            return false;
        };

        let applied = slot.send_if_modified(|record| record.finish(status, result));
        if applied {
            match status {
                RequestStatus::Error => {
                    let error = slot
                        .borrow()
                        .result
                        .as_ref()
                        .and_then(|r| r.error().map(str::to_string));
                    warn!(
                        trace = %trace,
                        sender = %message.sender(),
                        error = ?error,
                        "Workflow failed"
                    );
                }
                _ => info!(trace = %trace, sender = %message.sender(), "Workflow completed"),
            }
        } else {
            warn!(
                trace = %trace,
                kind = %message.kind(),
                sender = %message.sender(),
                "Ignoring terminal message for finished workflow"
            );
        }
        applied
    }

    /// Current snapshot of a record
    pub fn poll(&self, trace: &TraceId) -> Option<RequestRecord> {
        self.slot(trace).map(|slot| slot.borrow().clone())
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<RequestRecord> {
        let mut records: Vec<RequestRecord> = self
            .inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|slot| slot.borrow().clone())
            .collect();
        records.sort_by_key(|r| r.start_time);
        records
    }

    /// Waits until the workflow reaches a terminal state or `timeout` passes.
    ///
    /// On timeout the returned copy has status `Timeout`; the stored record is
    /// left as it is and may still complete later.
    pub async fn wait(&self, trace: &TraceId, timeout: Duration) -> Result<RequestRecord> {
        let mut rx = self
            .slot(trace)
            .map(|slot| slot.subscribe())
            .ok_or_else(|| RagError::unknown_trace(trace.as_str()))?;

        let finished = match tokio::time::timeout(timeout, rx.wait_for(RequestRecord::is_terminal))
            .await
        {
            Ok(Ok(record)) => Some(Some(record.clone())),
            Ok(Err(_)) => Some(None),
            Err(_) => None,
        };

        match finished {
            Some(Some(record)) => Ok(record),
            Some(None) => {
                debug!(trace = %trace, "Record cleared while waiting");
                Err(RagError::unknown_trace(trace.as_str()))
            }
            None => {
                let current = rx.borrow().clone();
                if current.is_terminal() {
                    return Ok(current);
                }
                info!(trace = %trace, timeout_ms = timeout.as_millis() as u64, "Wait timed out");
                Ok(current.timed_out(timeout))
            }
        }
    }

    /// Like [`wait`](Self::wait), but a passed deadline is an error
    pub async fn wait_strict(&self, trace: &TraceId, timeout: Duration) -> Result<RequestRecord> {
        let record = self.wait(trace, timeout).await?;
        if record.status == RequestStatus::Timeout {
            return Err(RagError::timeout(trace.as_str(), timeout.as_millis() as u64));
        }
        Ok(record)
    }

    pub fn stats(&self) -> SystemStats {
        let records = self
            .inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut stats = SystemStats {
            total: records.len(),
            history_length: self.inner.bus.history_len(),
            delivery_faults: self.inner.bus.delivery_faults(),
            ..SystemStats::default()
        };
        for slot in records.values() {
            match slot.borrow().status {
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Error => stats.errored += 1,
                RequestStatus::Processing => stats.in_flight += 1,
                RequestStatus::Timeout => {}
            }
        }
        stats
    }

    /// Drops every record. Bus history is kept.
    pub fn clear(&self) {
        let removed = {
            let mut records = self
                .inner
                .records
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *records)
        };
        info!(records = removed.len(), "Coordinator session cleared");
    }
}

struct CoordinatorHandler {
    inner: Weak<CoordinatorInner>,
}

#[async_trait]
impl MessageHandler for CoordinatorHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("coordinator has been dropped"))?;
        Coordinator { inner }.on_message(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{ErrorReport, GenerationComplete, IndexingComplete};
    use pretty_assertions::assert_eq;

    fn indexed(trigger: &Message, vector_count: usize) -> Message {
        trigger.follow_up(
            "retrieval",
            COORDINATOR,
            Payload::IndexingComplete(IndexingComplete {
                status: "indexed".to_string(),
                doc_id: "doc".to_string(),
                filename: "notes.txt".to_string(),
                vector_count,
                trace: trigger.trace().clone(),
            }),
        )
    }

    fn failed(trigger: &Message, error: &str) -> Message {
        trigger.follow_up(
            "ingestion",
            COORDINATOR,
            Payload::Error(ErrorReport {
                error: error.to_string(),
                stage: "parse".to_string(),
                filename: None,
                query: None,
                trace: trigger.trace().clone(),
            }),
        )
    }

    fn first_message(coordinator: &Coordinator, trace: &TraceId) -> Message {
        coordinator.bus().history(Some(trace)).remove(0)
    }

    #[test]
    fn test_start_tracks_processing_record() {
        let coordinator = Coordinator::new(MessageBus::new());
        let trace = coordinator.start_document_workflow("notes.txt", b"hello".to_vec());

        let record = coordinator.poll(&trace).unwrap();
        assert_eq!(record.status, RequestStatus::Processing);
        assert_eq!(record.kind, WorkflowKind::DocumentUpload);
        assert_eq!(record.subject, "notes.txt");

        let history = coordinator.bus().history(Some(&trace));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].receiver(), INGESTION);
    }

    #[test]
    fn test_first_terminal_message_wins() {
        let coordinator = Coordinator::new(MessageBus::new());
        let trace = coordinator.start_document_workflow("notes.txt", b"hello".to_vec());
        let request = first_message(&coordinator, &trace);

        assert!(coordinator.on_message(&indexed(&request, 3)));
        assert!(!coordinator.on_message(&failed(&request, "late failure")));
        assert!(!coordinator.on_message(&indexed(&request, 9)));

        let record = coordinator.poll(&trace).unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.result.unwrap().vector_count(), Some(3));
    }

    #[test]
    fn test_error_result_is_generic() {
        let coordinator = Coordinator::new(MessageBus::new());
        let trace = coordinator.start_query_workflow("What is X?", 3);
        let request = first_message(&coordinator, &trace);

        assert!(coordinator.on_message(&failed(&request, "index exploded")));
        let result = coordinator.poll(&trace).unwrap().result.unwrap();
        assert!(!result.success());
        assert_eq!(result.error(), Some("index exploded"));
    }

    #[test]
    fn test_unknown_trace_and_kind_are_ignored() {
        let coordinator = Coordinator::new(MessageBus::new());
        let stray = coordinator.bus().create(
            "generation",
            COORDINATOR,
            Payload::GenerationComplete(GenerationComplete {
                query: "q".to_string(),
                answer: "a".to_string(),
                sources: vec![],
                context_used: false,
            }),
        );
        assert!(!coordinator.on_message(&stray));

        let trace = coordinator.start_query_workflow("q", 1);
        let request = first_message(&coordinator, &trace);
        assert!(!coordinator.on_message(&request));
        assert_eq!(coordinator.stats().in_flight, 1);
    }

    #[test]
    fn test_stats_and_clear() {
        let coordinator = Coordinator::new(MessageBus::new());
        let done = coordinator.start_document_workflow("a.txt", b"a".to_vec());
        let broken = coordinator.start_document_workflow("b.txt", b"b".to_vec());
        coordinator.start_query_workflow("pending", 2);

        coordinator.on_message(&indexed(&first_message(&coordinator, &done), 1));
        coordinator.on_message(&failed(&first_message(&coordinator, &broken), "bad"));

        let stats = coordinator.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.history_length, 3);

        coordinator.clear();
        assert_eq!(coordinator.stats().total, 0);
        assert!(coordinator.poll(&done).is_none());
        assert_eq!(coordinator.bus().history_len(), 3);
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_record() {
        let coordinator = Coordinator::new(MessageBus::new());
        let trace = coordinator.start_document_workflow("notes.txt", b"x".to_vec());
        let request = first_message(&coordinator, &trace);

        let waiter = {
            let coordinator = coordinator.clone();
            let trace = trace.clone();
            tokio::spawn(async move { coordinator.wait(&trace, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.on_message(&indexed(&request, 2));

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_unknown_trace() {
        let coordinator = Coordinator::new(MessageBus::new());
        let err = coordinator
            .wait(&TraceId::from("missing"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "unknown_trace");
    }

    #[tokio::test]
    async fn test_wait_strict_times_out() {
        let coordinator = Coordinator::new(MessageBus::new());
        let trace = coordinator.start_query_workflow("q", 1);
        let err = coordinator
            .wait_strict(&trace, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_clear_wakes_waiters() {
        let coordinator = Coordinator::new(MessageBus::new());
        let trace = coordinator.start_query_workflow("q", 1);
        let waiter = {
            let coordinator = coordinator.clone();
            let trace = trace.clone();
            tokio::spawn(async move { coordinator.wait(&trace, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.clear();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.category(), "unknown_trace");
    }
}
