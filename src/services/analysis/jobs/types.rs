use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Window;
use crate::error::PipelineError;
use crate::ids::{CompanyId, JobId, SurveyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Queued and Running jobs hold their idempotency key.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            at,
        }
    }

    /// The final attempt's lease lapsed without a completion.
    pub fn lease_exhausted(attempts: u32, at: DateTime<Utc>) -> Self {
        Self::new(
            "attempts_exhausted",
            format!("lease expired after {attempts} attempts"),
            at,
        )
    }

    pub fn from_pipeline(err: &PipelineError, at: DateTime<Utc>) -> Self {
        Self {
            code: err.reason_code().to_string(),
            message: err.to_string(),
            details: Some(serde_json::json!({ "class": err.class() })),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub company_id: CompanyId,
    pub survey_id: SurveyId,
    pub window: Window,
    pub idempotency_key: String,
    pub status: JobStatus,
    /// Number of claims so far, including reclaims after an expired lease.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub not_before: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub partial: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    /// Claimable now: queued past its backoff gate, or running with a lapsed lease.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.not_before <= now,
            JobStatus::Running => self.lease_expires_at.is_some_and(|lease| lease <= now),
            _ => false,
        }
    }

    /// Applies a finish transition to a running job and releases its claim.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) {
        self.claim_token = None;
        self.lease_expires_at = None;
        self.status = transition.status();
        match transition {
            Transition::Succeeded { partial } => {
                self.partial = partial;
                self.completed_at = Some(now);
            }
            Transition::Failed(error) => {
                self.last_error = Some(error);
                self.completed_at = Some(now);
            }
            Transition::Retry { error, not_before } => {
                self.last_error = Some(error);
                self.not_before = not_before;
            }
            Transition::Cancelled => {
                self.completed_at = Some(now);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub company_id: CompanyId,
    pub survey_id: SurveyId,
    pub window: Window,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub idempotency_key: String,
    pub job: AnalysisJob,
    /// False when an active job for the same key already existed.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub worker_id: &'a str,
    pub now: DateTime<Utc>,
    pub lease: std::time::Duration,
    pub max_attempts: u32,
}

impl ClaimRequest<'_> {
    pub fn lease_expiry(&self) -> DateTime<Utc> {
        self.now + chrono::Duration::milliseconds(self.lease.as_millis() as i64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub job: AnalysisJob,
    pub token: Uuid,
    pub reclaimed: bool,
}

impl Claim {
    pub fn fence(&self) -> ClaimFence {
        ClaimFence {
            job_id: self.job.id,
            token: self.token,
        }
    }
}

/// Proof of ownership checked by fenced result writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimFence {
    pub job_id: JobId,
    pub token: Uuid,
}

impl ClaimFence {
    /// Same test `finish` applies: the job is still running under this token.
    pub fn holds(&self, job: &AnalysisJob) -> bool {
        job.id == self.job_id
            && job.status == JobStatus::Running
            && job.claim_token == Some(self.token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Succeeded { partial: bool },
    Failed(JobError),
    Retry {
        error: JobError,
        not_before: DateTime<Utc>,
    },
    Cancelled,
}

impl Transition {
    pub fn status(&self) -> JobStatus {
        match self {
            Transition::Succeeded { .. } => JobStatus::Succeeded,
            Transition::Failed(_) => JobStatus::Failed,
            Transition::Retry { .. } => JobStatus::Queued,
            Transition::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    Applied(AnalysisJob),
    /// The claim token no longer matches; another worker owns the job now.
    StaleClaim,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    CancelledBeforeStart(AnalysisJob),
    Requested(AnalysisJob),
    AlreadyFinished(JobStatus),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Claimed,
    Reclaimed,
    RetryScheduled,
    Succeeded,
    Failed,
    Cancelled,
    CancelRequested,
    StaleCompletion,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Created => "created",
            JobEventKind::Claimed => "claimed",
            JobEventKind::Reclaimed => "reclaimed",
            JobEventKind::RetryScheduled => "retry_scheduled",
            JobEventKind::Succeeded => "succeeded",
            JobEventKind::Failed => "failed",
            JobEventKind::Cancelled => "cancelled",
            JobEventKind::CancelRequested => "cancel_requested",
            JobEventKind::StaleCompletion => "stale_completion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            JobEventKind::Created,
            JobEventKind::Claimed,
            JobEventKind::Reclaimed,
            JobEventKind::RetryScheduled,
            JobEventKind::Succeeded,
            JobEventKind::Failed,
            JobEventKind::Cancelled,
            JobEventKind::CancelRequested,
            JobEventKind::StaleCompletion,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }

    pub fn for_transition(transition: &Transition) -> Self {
        match transition {
            Transition::Succeeded { .. } => JobEventKind::Succeeded,
            Transition::Failed(_) => JobEventKind::Failed,
            Transition::Retry { .. } => JobEventKind::RetryScheduled,
            Transition::Cancelled => JobEventKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Emitted once a job reaches a terminal state; consumers dedupe by `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub company_id: CompanyId,
    pub survey_id: SurveyId,
    pub status: JobStatus,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub at: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn for_job(job: &AnalysisJob, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            company_id: job.company_id,
            survey_id: job.survey_id,
            status: job.status,
            partial: job.partial,
            reason_code: job.last_error.as_ref().map(|e| e.code.clone()),
            at,
        }
    }
}

/// An outbox row written in the same commit as the terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCompletion {
    pub id: i64,
    pub event: CompletionEvent,
}

pub fn transition_payload(transition: &Transition) -> serde_json::Value {
    match transition {
        Transition::Succeeded { partial } => serde_json::json!({ "partial": partial }),
        Transition::Failed(error) => serde_json::json!({
            "error_code": error.code,
            "message": error.message,
        }),
        Transition::Retry { error, not_before } => serde_json::json!({
            "error_code": error.code,
            "not_before": not_before.to_rfc3339(),
        }),
        Transition::Cancelled => serde_json::json!({ "before_start": false }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("pending"), None);
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Running.is_active());
    }

    #[test]
    fn event_kinds_parse_from_storage_strings() {
        assert_eq!(
            JobEventKind::parse("stale_completion"),
            Some(JobEventKind::StaleCompletion)
        );
        assert_eq!(JobEventKind::parse("progress"), None);
    }

    #[test]
    fn retry_keeps_job_claimable_and_records_error() {
        let (_, survey) = crate::test_support::survey_fixture();
        let mut job = crate::test_support::queued_job(&survey, crate::test_support::window_at(0));
        let now = job.created_at;
        job.status = JobStatus::Running;
        job.claim_token = Some(Uuid::from_u128(9));
        job.lease_expires_at = Some(now);

        let later = now + chrono::Duration::seconds(2);
        job.apply(
            Transition::Retry {
                error: JobError::new("lock_contention", "busy", now),
                not_before: later,
            },
            now,
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.claim_token, None);
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(later));
        assert_eq!(job.completed_at, None);

        job.apply(Transition::Succeeded { partial: true }, later);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.partial);
        assert_eq!(job.completed_at, Some(later));
        assert_eq!(job.last_error.unwrap().code, "lock_contention");
    }
}
