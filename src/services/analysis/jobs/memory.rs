//! Single-process backend used by tests and embedded runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{CompletionNotifier, JobQueue, ResponseSource, ResultStore};
use super::types::{
    transition_payload, AnalysisJob, CancelOutcome, Claim, ClaimFence, ClaimRequest,
    CompletionEvent, EnqueueOutcome, EnqueueRequest, FinishOutcome, JobError, JobEvent,
    JobEventKind, JobStatus, PendingCompletion, Transition,
};
use crate::domain::{Company, Response, Survey, Window};
use crate::error::StoreError;
use crate::ids::{idempotency_key, CompanyId, JobId, SurveyId};
use crate::services::analysis::results::{
    plan_write, AnalysisResult, PersistOutcome, StoredResult, WritePlan,
};
use crate::tenant::TenantContext;

#[derive(Default)]
struct State {
    companies: HashMap<CompanyId, Company>,
    surveys: HashMap<SurveyId, Survey>,
    responses: Vec<Response>,
    /// Insertion order doubles as FIFO order within a company.
    jobs: Vec<AnalysisJob>,
    events: Vec<JobEvent>,
    served_at: HashMap<CompanyId, u64>,
    serve_clock: u64,
    results: Vec<StoredResult>,
    outbox: Vec<OutboxRow>,
    /// Events handed to this store acting as the notifier.
    completions: Vec<CompletionEvent>,
}

struct OutboxRow {
    id: i64,
    event: CompletionEvent,
    delivered_at: Option<DateTime<Utc>>,
}

impl State {
    fn job_mut(&mut self, job_id: JobId) -> Option<&mut AnalysisJob> {
        self.jobs.iter_mut().find(|job| job.id == job_id)
    }

    fn push_outbox(&mut self, event: CompletionEvent) {
        let id = self.outbox.len() as i64 + 1;
        self.outbox.push(OutboxRow {
            id,
            event,
            delivered_at: None,
        });
    }

    fn record(&mut self, job_id: JobId, kind: JobEventKind, payload: serde_json::Value, at: DateTime<Utc>) {
        self.events.push(JobEvent {
            job_id,
            kind,
            payload,
            at,
        });
    }

    /// Jobs whose lease lapsed on their final attempt cannot be reclaimed.
    fn fail_exhausted(&mut self, now: DateTime<Utc>, max_attempts: u32) {
        let exhausted: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Running && job.is_eligible(now))
            .filter(|job| job.attempts >= max_attempts)
            .map(|job| job.id)
            .collect();
        for job_id in exhausted {
            let Some(job) = self.job_mut(job_id) else {
                continue;
            };
            let error = JobError::lease_exhausted(job.attempts, now);
            job.apply(Transition::Failed(error), now);
            let event = CompletionEvent::for_job(job, now);
            tracing::warn!(job_id = %job_id, attempts = job.attempts, "analysis job exhausted its attempts");
            self.record(
                job_id,
                JobEventKind::Failed,
                serde_json::json!({ "error_code": "attempts_exhausted" }),
                now,
            );
            self.push_outbox(event);
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_company(&self, company: Company) {
        self.state.lock().await.companies.insert(company.id, company);
    }

    pub async fn insert_survey(&self, survey: Survey) {
        self.state.lock().await.surveys.insert(survey.id, survey);
    }

    pub async fn insert_responses(&self, responses: impl IntoIterator<Item = Response>) {
        self.state.lock().await.responses.extend(responses);
    }

    pub async fn completions(&self) -> Vec<CompletionEvent> {
        self.state.lock().await.completions.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(
        &self,
        request: &EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let key = idempotency_key(request.company_id, request.survey_id, &request.window);
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .jobs
            .iter()
            .find(|job| job.idempotency_key == key && job.status.is_active())
        {
            return Ok(EnqueueOutcome {
                idempotency_key: key,
                job: existing.clone(),
                created: false,
            });
        }

        let job = AnalysisJob {
            id: JobId::new_v4(),
            company_id: request.company_id,
            survey_id: request.survey_id,
            window: request.window,
            idempotency_key: key.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            claim_token: None,
            worker_id: None,
            lease_expires_at: None,
            not_before: now,
            cancel_requested_at: None,
            last_error: None,
            partial: false,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        state.jobs.push(job.clone());
        state.record(
            job.id,
            JobEventKind::Created,
            serde_json::json!({ "idempotency_key": key }),
            now,
        );
        Ok(EnqueueOutcome {
            idempotency_key: key,
            job,
            created: true,
        })
    }

    async fn claim_next(&self, request: &ClaimRequest<'_>) -> Result<Option<Claim>, StoreError> {
        let now = request.now;
        let mut state = self.state.lock().await;
        state.fail_exhausted(now, request.max_attempts);

        // Oldest eligible job per company, then the least recently served company.
        let mut heads: Vec<(u64, usize)> = Vec::new();
        let mut seen: Vec<CompanyId> = Vec::new();
        for (idx, job) in state.jobs.iter().enumerate() {
            if !job.is_eligible(now) || seen.contains(&job.company_id) {
                continue;
            }
            seen.push(job.company_id);
            let served = state.served_at.get(&job.company_id).copied().unwrap_or(0);
            heads.push((served, idx));
        }
        let Some(&(_, idx)) = heads.iter().min() else {
            return Ok(None);
        };

        state.serve_clock += 1;
        let clock = state.serve_clock;
        let token = Uuid::new_v4();
        let job = &mut state.jobs[idx];
        let reclaimed = job.status == JobStatus::Running;
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.claim_token = Some(token);
        job.worker_id = Some(request.worker_id.to_string());
        job.lease_expires_at = Some(request.lease_expiry());
        job.started_at = Some(now);
        let claimed = job.clone();
        state.served_at.insert(claimed.company_id, clock);

        let kind = if reclaimed {
            JobEventKind::Reclaimed
        } else {
            JobEventKind::Claimed
        };
        state.record(
            claimed.id,
            kind,
            serde_json::json!({ "worker_id": request.worker_id, "attempt": claimed.attempts }),
            now,
        );
        Ok(Some(Claim {
            job: claimed,
            token,
            reclaimed,
        }))
    }

    async fn finish(
        &self,
        job_id: JobId,
        claim_token: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.job_mut(job_id) else {
            return Err(StoreError::Corrupt(format!("job {job_id} vanished while running")));
        };
        if job.status != JobStatus::Running || job.claim_token != Some(claim_token) {
            let status = job.status;
            state.record(
                job_id,
                JobEventKind::StaleCompletion,
                serde_json::json!({ "attempted": transition.status().as_str(), "status": status.as_str() }),
                now,
            );
            return Ok(FinishOutcome::StaleClaim);
        }

        let payload = transition_payload(&transition);
        let kind = JobEventKind::for_transition(&transition);
        job.apply(transition, now);
        let updated = job.clone();
        state.record(job_id, kind, payload, now);
        if updated.status.is_terminal() {
            state.push_outbox(CompletionEvent::for_job(&updated, now));
        }
        Ok(FinishOutcome::Applied(updated))
    }

    async fn request_cancel(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.job_mut(job_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.cancel_requested_at = Some(now);
                job.completed_at = Some(now);
                let job = job.clone();
                state.record(
                    job_id,
                    JobEventKind::Cancelled,
                    serde_json::json!({ "before_start": true }),
                    now,
                );
                state.push_outbox(CompletionEvent::for_job(&job, now));
                Ok(CancelOutcome::CancelledBeforeStart(job))
            }
            JobStatus::Running => {
                job.cancel_requested_at.get_or_insert(now);
                let job = job.clone();
                state.record(job_id, JobEventKind::CancelRequested, serde_json::json!({}), now);
                Ok(CancelOutcome::Requested(job))
            }
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .any(|job| job.id == job_id && job.cancel_requested_at.is_some()))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<AnalysisJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|job| job.id == job_id).cloned())
    }

    async fn list_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn pending_completions(&self, limit: usize) -> Result<Vec<PendingCompletion>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|row| row.delivered_at.is_none())
            .take(limit)
            .map(|row| PendingCompletion {
                id: row.id,
                event: row.event.clone(),
            })
            .collect())
    }

    async fn mark_delivered(&self, ids: &[i64], now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for row in state.outbox.iter_mut().filter(|row| ids.contains(&row.id)) {
            row.delivered_at.get_or_insert(now);
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseSource for MemoryStore {
    async fn load_company(&self, company_id: CompanyId) -> Result<Option<Company>, StoreError> {
        Ok(self.state.lock().await.companies.get(&company_id).cloned())
    }

    async fn load_survey(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
    ) -> Result<Option<Survey>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .surveys
            .get(&survey_id)
            .filter(|survey| survey.company_id == tenant.company_id())
            .cloned())
    }

    async fn read_responses(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Vec<Response>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .responses
            .iter()
            .filter(|r| r.company_id == tenant.company_id())
            .filter(|r| r.survey_id == survey_id && window.contains(r.submitted_at))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn read_history(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        before: &Window,
        limit: usize,
    ) -> Result<Vec<AnalysisResult>, StoreError> {
        let state = self.state.lock().await;
        let mut prior: Vec<&AnalysisResult> = state
            .results
            .iter()
            .filter(|stored| stored.is_current())
            .map(|stored| &stored.result)
            .filter(|r| r.company_id == tenant.company_id() && r.survey_id == survey_id)
            .filter(|r| r.window.start < before.start)
            .collect();
        prior.sort_by_key(|r| r.window);
        let skip = prior.len().saturating_sub(limit);
        Ok(prior.into_iter().skip(skip).cloned().collect())
    }

    async fn current_result(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Option<StoredResult>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .iter()
            .find(|stored| {
                stored.is_current()
                    && stored.result.company_id == tenant.company_id()
                    && stored.result.survey_id == survey_id
                    && stored.result.window == *window
            })
            .cloned())
    }

    async fn lineage(
        &self,
        tenant: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Vec<StoredResult>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .iter()
            .filter(|stored| {
                stored.result.company_id == tenant.company_id()
                    && stored.result.idempotency_key == idempotency_key
            })
            .cloned()
            .collect())
    }

    async fn persist_result(
        &self,
        tenant: &TenantContext,
        result: &AnalysisResult,
        fence: Option<ClaimFence>,
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        if result.company_id != tenant.company_id() {
            return Err(StoreError::Corrupt(format!(
                "result for company {} written under company {}",
                result.company_id,
                tenant.company_id()
            )));
        }
        let mut state = self.state.lock().await;
        if let Some(fence) = fence {
            let owned = state.jobs.iter().any(|job| fence.holds(job));
            if !owned {
                return Ok(PersistOutcome::Fenced {
                    job_id: fence.job_id,
                });
            }
        }
        let lineage: Vec<StoredResult> = state
            .results
            .iter()
            .filter(|stored| stored.result.idempotency_key == result.idempotency_key)
            .cloned()
            .collect();

        match plan_write(&lineage, result) {
            WritePlan::Discard(outcome) => Ok(outcome),
            WritePlan::Insert { supersedes } => {
                let record_id = result.record_id();
                if let Some(previous) = supersedes {
                    if let Some(stored) = state.results.iter_mut().find(|s| s.record_id == previous) {
                        stored.superseded_at = Some(now);
                        stored.superseded_by = Some(record_id);
                    }
                }
                state.results.push(StoredResult {
                    record_id,
                    result: result.clone(),
                    stored_at: now,
                    superseded_at: None,
                    superseded_by: None,
                });
                Ok(PersistOutcome::Current {
                    record_id,
                    superseded: supersedes,
                })
            }
        }
    }
}

#[async_trait]
impl CompletionNotifier for MemoryStore {
    async fn on_job_completed(&self, event: &CompletionEvent) -> Result<(), StoreError> {
        self.state.lock().await.completions.push(event.clone());
        Ok(())
    }
}
