use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backoff::RetryPolicy;
use super::store::{bounded, CompletionNotifier, JobQueue, ResponseSource, ResultStore};
use super::types::{
    AnalysisJob, CancelOutcome, Claim, ClaimFence, ClaimRequest, EnqueueOutcome, EnqueueRequest,
    FinishOutcome, JobError, JobEvent, JobStatus, Transition,
};
use crate::config::{AnalysisSettings, EngineConfig};
use crate::error::{ErrorClass, PipelineError, TransientKind};
use crate::ids::JobId;
use crate::services::analysis::pipeline::{analyze, PipelineInput};
use crate::services::analysis::results::{AnalysisResult, PersistOutcome, ResultCacheWriter};
use crate::tenant::TenantContext;

const RELAY_BATCH: usize = 64;

/// Backends the engine runs against.
#[derive(Clone)]
pub struct EngineStores {
    pub queue: Arc<dyn JobQueue>,
    pub responses: Arc<dyn ResponseSource>,
    pub results: Arc<dyn ResultStore>,
    pub notifier: Arc<dyn CompletionNotifier>,
}

/// What one claim → process → complete cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub job_id: JobId,
    pub attempts: u32,
    pub status: JobStatus,
    /// False when the claim went stale and another worker owns the job.
    pub applied: bool,
    pub persisted: Option<PersistOutcome>,
}

pub struct AnalysisJobService {
    queue: Arc<dyn JobQueue>,
    responses: Arc<dyn ResponseSource>,
    writer: ResultCacheWriter,
    notifier: Arc<dyn CompletionNotifier>,
    settings: AnalysisSettings,
    retry: RetryPolicy,
    worker_count: usize,
    poll_interval: Duration,
    storage_timeout: Duration,
    job_budget: Duration,
    visibility_timeout: Duration,
    running: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl AnalysisJobService {
    pub fn new(stores: EngineStores, config: &EngineConfig) -> Self {
        Self {
            queue: stores.queue,
            responses: stores.responses,
            writer: ResultCacheWriter::new(stores.results, config.storage_timeout()),
            notifier: stores.notifier,
            settings: config.analysis.clone(),
            retry: config.retry_policy(),
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval(),
            storage_timeout: config.storage_timeout(),
            job_budget: config.job_time_budget(),
            visibility_timeout: config.visibility_timeout(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn results(&self) -> &ResultCacheWriter {
        &self.writer
    }

    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome, PipelineError> {
        let outcome = bounded(self.storage_timeout, self.queue.enqueue(request, Utc::now())).await?;
        tracing::info!(
            job_id = %outcome.job.id,
            company_id = %request.company_id,
            survey_id = %request.survey_id,
            idempotency_key = %outcome.idempotency_key,
            created = outcome.created,
            "analysis job enqueued"
        );
        Ok(outcome)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<AnalysisJob>, PipelineError> {
        bounded(self.storage_timeout, self.queue.get_job(job_id)).await
    }

    pub async fn list_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, PipelineError> {
        bounded(self.storage_timeout, self.queue.list_events(job_id)).await
    }

    pub async fn request_cancel(&self, job_id: JobId) -> Result<CancelOutcome, PipelineError> {
        let outcome = bounded(
            self.storage_timeout,
            self.queue.request_cancel(job_id, Utc::now()),
        )
        .await?;
        match &outcome {
            CancelOutcome::Requested(_) => {
                let token_opt = { self.running.lock().await.get(&job_id).cloned() };
                if let Some(token) = token_opt {
                    token.cancel();
                }
            }
            CancelOutcome::CancelledBeforeStart(_) => self.relay_quietly().await,
            _ => {}
        }
        Ok(outcome)
    }

    /// Hands undelivered completion events to the notifier, oldest first.
    ///
    /// A row is acknowledged only after the notifier accepts it. The first failure stops the
    /// pass; that row and the ones behind it are retried on the next pass.
    pub async fn relay_completions(&self) -> Result<usize, PipelineError> {
        let pending = bounded(self.storage_timeout, self.queue.pending_completions(RELAY_BATCH)).await?;
        let mut delivered = Vec::with_capacity(pending.len());
        for entry in &pending {
            if let Err(err) = self.notifier.on_job_completed(&entry.event).await {
                tracing::warn!(
                    job_id = %entry.event.job_id,
                    error = %err,
                    "failed to deliver completion event; will retry"
                );
                break;
            }
            delivered.push(entry.id);
        }
        if !delivered.is_empty() {
            bounded(
                self.storage_timeout,
                self.queue.mark_delivered(&delivered, Utc::now()),
            )
            .await?;
        }
        Ok(delivered.len())
    }

    async fn relay_quietly(&self) {
        if let Err(err) = self.relay_completions().await {
            tracing::warn!(
                error = %err,
                error_code = err.reason_code(),
                "completion relay pass failed"
            );
        }
    }

    /// Spawns `worker_count` independent claim loops.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|idx| {
                let service = self.clone();
                let cancel = cancel.clone();
                let worker_id = format!("worker-{idx}");
                tokio::spawn(async move { service.worker_loop(worker_id, cancel).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: String, cancel: CancellationToken) {
        tracing::info!(worker_id = %worker_id, "analysis worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.run_once(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        error = %err,
                        error_code = err.reason_code(),
                        "analysis worker failed to claim or complete job"
                    );
                    true
                }
            };
            if idle {
                self.relay_quietly().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        tracing::info!(worker_id = %worker_id, "analysis worker stopped");
    }

    /// Claims and runs at most one job. `Ok(None)` means nothing was eligible.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobRun>, PipelineError> {
        let request = ClaimRequest {
            worker_id,
            now: Utc::now(),
            lease: self.visibility_timeout,
            max_attempts: self.retry.max_attempts,
        };
        let Some(claim) = bounded(self.storage_timeout, self.queue.claim_next(&request)).await?
        else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "analysis_job",
            job_id = %claim.job.id,
            company_id = %claim.job.company_id,
            survey_id = %claim.job.survey_id,
            attempt = claim.job.attempts,
            worker_id = %worker_id,
        );
        self.run_claim(claim).instrument(span).await.map(Some)
    }

    async fn run_claim(&self, claim: Claim) -> Result<JobRun, PipelineError> {
        let started = Instant::now();
        let fence = claim.fence();
        let job = claim.job;
        // The claim timestamp orders writes within a result lineage.
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock().await;
            running.insert(job.id, cancel.clone());
        }

        tracing::info!(
            phase = "runner_start",
            reclaimed = claim.reclaimed,
            window = %job.window,
            "analysis job execution started"
        );

        let outcome = match tokio::time::timeout(
            self.job_budget,
            self.execute(&job, fence, started_at, &cancel),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::transient(
                TransientKind::JobTimeout,
                format!("exceeded time budget of {} s", self.job_budget.as_secs_f64()),
            )),
        };

        {
            let mut running = self.running.lock().await;
            running.remove(&job.id);
        }

        let now = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;
        let (transition, persisted) = self.decide(&job, outcome, now);
        let attempted = transition.status();

        let finished = bounded(
            self.storage_timeout,
            self.queue.finish(job.id, claim.token, transition.clone(), now),
        )
        .await?;
        let updated = match finished {
            FinishOutcome::Applied(updated) => updated,
            FinishOutcome::StaleClaim => {
                tracing::warn!(
                    phase = "runner_complete",
                    status = "stale_completion",
                    attempted = %attempted,
                    duration_ms,
                    "claim expired before completion; discarding"
                );
                return Ok(JobRun {
                    job_id: job.id,
                    attempts: job.attempts,
                    status: attempted,
                    applied: false,
                    persisted,
                });
            }
        };

        match &transition {
            Transition::Succeeded { partial } => tracing::info!(
                phase = "runner_complete",
                status = "succeeded",
                partial,
                duration_ms,
                "analysis job execution finished"
            ),
            Transition::Retry { error, not_before } => tracing::warn!(
                phase = "runner_complete",
                status = "retry_scheduled",
                error_code = %error.code,
                not_before = %not_before.to_rfc3339(),
                duration_ms,
                "analysis job will be retried"
            ),
            Transition::Failed(error) => tracing::warn!(
                phase = "runner_complete",
                status = "failed",
                error_code = %error.code,
                error_message = %error.message,
                duration_ms,
                "analysis job execution finished"
            ),
            Transition::Cancelled => tracing::info!(
                phase = "runner_complete",
                status = "cancelled",
                duration_ms,
                "analysis job execution finished"
            ),
        }

        if updated.status.is_terminal() {
            self.relay_quietly().await;
        }

        Ok(JobRun {
            job_id: updated.id,
            attempts: updated.attempts,
            status: updated.status,
            applied: true,
            persisted,
        })
    }

    fn decide(
        &self,
        job: &AnalysisJob,
        outcome: Result<(AnalysisResult, PersistOutcome), PipelineError>,
        now: DateTime<Utc>,
    ) -> (Transition, Option<PersistOutcome>) {
        let err = match outcome {
            Ok((result, persisted)) => {
                return (
                    Transition::Succeeded {
                        partial: result.partial,
                    },
                    Some(persisted),
                )
            }
            Err(PipelineError::Cancelled) => return (Transition::Cancelled, None),
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::TransientInfra if self.retry.allows_retry(job.attempts) => {
                let delay = self.retry.delay(job.attempts, &mut rand::thread_rng());
                let not_before = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                (
                    Transition::Retry {
                        error: JobError::from_pipeline(&err, now),
                        not_before,
                    },
                    None,
                )
            }
            ErrorClass::TransientInfra => {
                let mut error = JobError::from_pipeline(&err, now);
                error.code = "attempts_exhausted".to_string();
                error.message = format!(
                    "{} after {} attempts: {}",
                    err.reason_code(),
                    job.attempts,
                    err
                );
                (Transition::Failed(error), None)
            }
            ErrorClass::Computation => {
                tracing::error!(
                    error = %err,
                    error_code = err.reason_code(),
                    window = %job.window,
                    "analysis computation failed"
                );
                (Transition::Failed(JobError::from_pipeline(&err, now)), None)
            }
            _ => (Transition::Failed(JobError::from_pipeline(&err, now)), None),
        }
    }

    async fn checkpoint(&self, job_id: JobId, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if bounded(self.storage_timeout, self.queue.is_cancel_requested(job_id)).await? {
            cancel.cancel();
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    async fn execute(
        &self,
        job: &AnalysisJob,
        fence: ClaimFence,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(AnalysisResult, PersistOutcome), PipelineError> {
        self.checkpoint(job.id, cancel).await?;

        let company = bounded(self.storage_timeout, self.responses.load_company(job.company_id))
            .await?
            .ok_or(PipelineError::CompanyNotFound(job.company_id))?;
        let tenant = TenantContext::for_company(&company)?;
        let survey = bounded(
            self.storage_timeout,
            self.responses.load_survey(&tenant, job.survey_id),
        )
        .await?
        .ok_or(PipelineError::SurveyNotFound(job.survey_id))?;
        tenant.ensure_owns(survey.company_id, "survey")?;
        if !survey.active {
            return Err(PipelineError::SurveyInactive(survey.id));
        }

        let responses = bounded(
            self.storage_timeout,
            self.responses.read_responses(&tenant, survey.id, &job.window),
        )
        .await?;
        let history = self
            .writer
            .history(&tenant, survey.id, &job.window, self.settings.trend_history_windows)
            .await?;
        tracing::info!(
            phase = "load",
            responses = responses.len(),
            history = history.len(),
            "analysis inputs loaded"
        );

        let result = analyze(
            PipelineInput {
                tenant: &tenant,
                survey: &survey,
                job,
                job_started_at: started_at,
                responses: &responses,
                history: &history,
                settings: &self.settings,
            },
            |stage| {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                tracing::debug!(phase = stage.as_str(), "analysis stage starting");
                Ok(())
            },
        )?;
        if result.partial {
            tracing::info!(phase = "aggregate", "some sections lacked data; result is partial");
        }

        // Nothing is committed once cancellation has been requested.
        self.checkpoint(job.id, cancel).await?;
        let persisted = self
            .writer
            .persist(&tenant, &result, Some(fence), Utc::now())
            .await?;
        Ok((result, persisted))
    }
}
