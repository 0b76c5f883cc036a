//! Storage seams for the engine.
//!
//! The queue, the response source and the result store are the only shared state. Every
//! operation that reads tenant data takes a [`TenantContext`] and must filter on it
//! server-side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::types::{
    AnalysisJob, CancelOutcome, Claim, ClaimFence, ClaimRequest, CompletionEvent,
    EnqueueOutcome, EnqueueRequest, FinishOutcome, JobEvent, PendingCompletion, Transition,
};
use crate::domain::{Company, Response, Survey, Window};
use crate::error::{PipelineError, StoreError};
use crate::ids::{CompanyId, JobId, SurveyId};
use crate::services::analysis::results::{AnalysisResult, PersistOutcome, StoredResult};
use crate::tenant::TenantContext;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Creates a job unless one for the same idempotency key is queued or running.
    async fn enqueue(
        &self,
        request: &EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Atomically claims the next eligible job, least-recently-served company first.
    async fn claim_next(&self, request: &ClaimRequest<'_>) -> Result<Option<Claim>, StoreError>;

    /// Compare-and-set on the claim token.
    async fn finish(
        &self,
        job_id: JobId,
        claim_token: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StoreError>;

    async fn request_cancel(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError>;

    async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<AnalysisJob>, StoreError>;

    async fn list_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError>;

    /// Completion events not yet acknowledged by the notifier, oldest first.
    async fn pending_completions(&self, limit: usize) -> Result<Vec<PendingCompletion>, StoreError>;

    async fn mark_delivered(&self, ids: &[i64], now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ResponseSource: Send + Sync {
    async fn load_company(&self, company_id: CompanyId) -> Result<Option<Company>, StoreError>;

    async fn load_survey(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
    ) -> Result<Option<Survey>, StoreError>;

    /// Responses submitted inside `window`, restricted to the tenant's company.
    async fn read_responses(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Vec<Response>, StoreError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Up to `limit` current results for windows starting before `before`, oldest first.
    async fn read_history(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        before: &Window,
        limit: usize,
    ) -> Result<Vec<AnalysisResult>, StoreError>;

    async fn current_result(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Option<StoredResult>, StoreError>;

    /// Every record ever written for the key, superseded ones included, oldest first.
    async fn lineage(
        &self,
        tenant: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Vec<StoredResult>, StoreError>;

    /// With a fence, nothing is written unless that claim still owns the running job.
    async fn persist_result(
        &self,
        tenant: &TenantContext,
        result: &AnalysisResult,
        fence: Option<ClaimFence>,
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError>;
}

#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn on_job_completed(&self, event: &CompletionEvent) -> Result<(), StoreError>;
}

/// Notifier for deployments without a downstream consumer; delivered events are logged.
pub struct TracingNotifier;

#[async_trait]
impl CompletionNotifier for TracingNotifier {
    async fn on_job_completed(&self, event: &CompletionEvent) -> Result<(), StoreError> {
        tracing::info!(
            job_id = %event.job_id,
            company_id = %event.company_id,
            status = %event.status,
            partial = event.partial,
            error_code = ?event.reason_code,
            "analysis job completed"
        );
        Ok(())
    }
}

/// Bounds one storage call; an elapsed timer becomes `storage_timeout`.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(PipelineError::from),
        Err(_) => Err(StoreError::Timeout(limit).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[tokio::test]
    async fn slow_storage_calls_become_transient_timeouts() {
        let err = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.reason_code(), "storage_timeout");
        assert_eq!(err.class(), ErrorClass::TransientInfra);
    }

    #[tokio::test]
    async fn store_errors_keep_their_classification() {
        let err = bounded(Duration::from_secs(1), async {
            Err::<(), _>(StoreError::Corrupt("bad payload".to_string()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.reason_code(), "corrupt_record");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn tracing_notifier_accepts_every_event() {
        let (_, survey) = crate::test_support::survey_fixture();
        let job = crate::test_support::queued_job(&survey, crate::test_support::window_at(0));
        let event = CompletionEvent::for_job(&job, job.created_at);
        TracingNotifier.on_job_completed(&event).await.unwrap();
    }
}
