//! Types tracked by the coordinator for each workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pubsub::{Source, TraceId};

/// What started a workflow
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    DocumentUpload,
    UserQuery,
}

/// Lifecycle of a request record.
///
/// Only `Processing -> Completed | Error` is ever stored. `Timeout` appears
/// solely in what [`Coordinator::wait`](super::Coordinator::wait) returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Processing,
    Completed,
    Error,
    Timeout,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Outcome-specific part of a [`WorkflowResult`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ResultDetail {
    Indexed {
        filename: String,
        vector_count: usize,
    },
    Answered {
        query: String,
        answer: String,
        sources: Vec<Source>,
        context_used: bool,
    },
    Failed {
        error: String,
    },
}

/// Result attached to a record once it leaves `Processing`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    success: bool,
    #[serde(flatten)]
    detail: ResultDetail,
}

impl WorkflowResult {
    pub fn indexed(filename: impl Into<String>, vector_count: usize) -> Self {
        Self {
            success: true,
            detail: ResultDetail::Indexed {
                filename: filename.into(),
                vector_count,
            },
        }
    }

    pub fn answered(
        query: impl Into<String>,
        answer: impl Into<String>,
        sources: Vec<Source>,
        context_used: bool,
    ) -> Self {
        Self {
            success: true,
            detail: ResultDetail::Answered {
                query: query.into(),
                answer: answer.into(),
                sources,
                context_used,
            },
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: ResultDetail::Failed {
                error: error.into(),
            },
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn detail(&self) -> &ResultDetail {
        &self.detail
    }

    pub fn error(&self) -> Option<&str> {
        match &self.detail {
            ResultDetail::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn vector_count(&self) -> Option<usize> {
        match &self.detail {
            ResultDetail::Indexed { vector_count, .. } => Some(*vector_count),
            _ => None,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        match &self.detail {
            ResultDetail::Answered { answer, .. } => Some(answer),
            _ => None,
        }
    }

    pub fn context_used(&self) -> Option<bool> {
        match &self.detail {
            ResultDetail::Answered { context_used, .. } => Some(*context_used),
            _ => None,
        }
    }

    pub fn sources(&self) -> &[Source] {
        match &self.detail {
            ResultDetail::Answered { sources, .. } => sources,
            _ => &[],
        }
    }
}

/// The coordinator's view of one workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub trace: TraceId,
    pub kind: WorkflowKind,
    /// Filename for uploads, query text for queries
    pub subject: String,
    pub status: RequestStatus,
    pub result: Option<WorkflowResult>,
    pub start_time: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    pub(crate) fn new(trace: TraceId, kind: WorkflowKind, subject: impl Into<String>) -> Self {
        Self {
            trace,
            kind,
            subject: subject.into(),
            status: RequestStatus::Processing,
            result: None,
            start_time: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a terminal transition. Returns `false`, leaving the record
    /// untouched, when it is already terminal.
    pub(crate) fn finish(&mut self, status: RequestStatus, result: WorkflowResult) -> bool {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        true
    }

    /// Copy reported to a waiter whose deadline passed
    pub(crate) fn timed_out(&self, timeout: Duration) -> Self {
        let mut copy = self.clone();
        copy.status = RequestStatus::Timeout;
        copy.result = Some(WorkflowResult::failed(format!(
            "Request timed out after {:.3} seconds",
            timeout.as_secs_f64()
        )));
        copy
    }
}

/// Counts returned by `stats()`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total: usize,
    pub completed: usize,
    pub errored: usize,
    pub in_flight: usize,
    pub history_length: usize,
    pub delivery_faults: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_finish_only_once() {
        let mut record = RequestRecord::new(TraceId::from("t"), WorkflowKind::UserQuery, "q");
        assert!(record.finish(RequestStatus::Error, WorkflowResult::failed("first")));
        assert!(!record.finish(
            RequestStatus::Completed,
            WorkflowResult::answered("q", "a", vec![], false)
        ));
        assert_eq!(record.status, RequestStatus::Error);
        assert_eq!(record.result.as_ref().and_then(|r| r.error()), Some("first"));
    }

    #[test]
    fn test_timed_out_copy() {
        let record = RequestRecord::new(TraceId::from("t"), WorkflowKind::DocumentUpload, "a.txt");
        let copy = record.timed_out(Duration::from_millis(1500));
        assert_eq!(record.status, RequestStatus::Processing);
        assert_eq!(copy.status, RequestStatus::Timeout);
        let result = copy.result.unwrap();
        assert!(!result.success());
        assert_eq!(result.error(), Some("Request timed out after 1.500 seconds"));
    }

    #[test]
    fn test_result_serializes_success_flag() {
        let value = serde_json::to_value(WorkflowResult::failed("nope")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"success": false, "outcome": "failed", "error": "nope"})
        );
        let back: WorkflowResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.error(), Some("nope"));
    }
}
