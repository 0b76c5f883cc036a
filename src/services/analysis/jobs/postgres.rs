//! PostgreSQL backend. Schema: `migrations/0001_analysis_engine.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::store::{JobQueue, ResponseSource, ResultStore};
use super::types::{
    transition_payload, AnalysisJob, CancelOutcome, Claim, ClaimFence, ClaimRequest,
    CompletionEvent, EnqueueOutcome, EnqueueRequest, FinishOutcome, JobError, JobEvent,
    JobEventKind, JobStatus, PendingCompletion, Transition,
};
use crate::domain::{Company, Question, Response, Survey, Window};
use crate::error::StoreError;
use crate::ids::{idempotency_key, CompanyId, JobId, SurveyId};
use crate::services::analysis::results::{
    plan_write, AnalysisResult, PersistOutcome, StoredResult, WritePlan,
};
use crate::tenant::TenantContext;

const JOB_COLUMNS: &str = "id, company_id, survey_id, window_start, window_end, idempotency_key, \
     status, attempts, claim_token, worker_id, lease_expires_at, not_before, cancel_requested_at, \
     last_error, partial, created_at, started_at, completed_at";

const RESULT_COLUMNS: &str = "record_id, result, stored_at, superseded_at, superseded_by";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    company_id: Uuid,
    survey_id: Uuid,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    idempotency_key: String,
    status: String,
    attempts: i32,
    claim_token: Option<Uuid>,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    not_before: DateTime<Utc>,
    cancel_requested_at: Option<DateTime<Utc>>,
    last_error: Option<SqlJson<JobError>>,
    partial: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for AnalysisJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("job {} has unknown status {:?}", row.id, row.status))
        })?;
        let window = Window::new(row.window_start, row.window_end)
            .map_err(|err| StoreError::Corrupt(format!("job {}: {err}", row.id)))?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            StoreError::Corrupt(format!("job {} has negative attempts {}", row.id, row.attempts))
        })?;
        Ok(AnalysisJob {
            id: JobId(row.id),
            company_id: CompanyId(row.company_id),
            survey_id: SurveyId(row.survey_id),
            window,
            idempotency_key: row.idempotency_key,
            status,
            attempts,
            claim_token: row.claim_token,
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
            not_before: row.not_before,
            cancel_requested_at: row.cancel_requested_at,
            last_error: row.last_error.map(|json| json.0),
            partial: row.partial,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    record_id: Uuid,
    result: SqlJson<AnalysisResult>,
    stored_at: DateTime<Utc>,
    superseded_at: Option<DateTime<Utc>>,
    superseded_by: Option<Uuid>,
}

impl From<ResultRow> for StoredResult {
    fn from(row: ResultRow) -> Self {
        StoredResult {
            record_id: row.record_id,
            result: row.result.0,
            stored_at: row.stored_at,
            superseded_at: row.superseded_at,
            superseded_by: row.superseded_by,
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn active_job_for_key(&self, key: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE idempotency_key = $1 AND status IN ('queued', 'running') LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AnalysisJob::try_from).transpose()
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;
        row.map(AnalysisJob::try_from).transpose()
    }

    /// Writes back every field a transition or a cancel can touch.
    async fn write_job(
        tx: &mut Transaction<'_, Postgres>,
        job: &AnalysisJob,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $2,
                claim_token = $3,
                lease_expires_at = $4,
                not_before = $5,
                cancel_requested_at = $6,
                last_error = $7,
                partial = $8,
                completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.claim_token)
        .bind(job.lease_expires_at)
        .bind(job.not_before)
        .bind(job.cancel_requested_at)
        .bind(job.last_error.clone().map(SqlJson))
        .bind(job.partial)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn append_event(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        kind: JobEventKind,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_job_events (job_id, kind, payload, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(kind.as_str())
        .bind(SqlJson(payload))
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Written in the transaction that makes the job terminal; the runner relays it.
    async fn append_outbox(
        tx: &mut Transaction<'_, Postgres>,
        event: &CompletionEvent,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_job_outbox (job_id, payload, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(event.job_id.as_uuid())
        .bind(SqlJson(event))
        .bind(event.at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Fails running jobs whose final attempt's lease lapsed.
    async fn fail_exhausted(
        tx: &mut Transaction<'_, Postgres>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<(), StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE status = 'running' AND lease_expires_at <= $1 AND attempts >= $2 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(max_attempts as i32)
        .fetch_all(&mut **tx)
        .await?;

        for row in rows {
            let mut job = AnalysisJob::try_from(row)?;
            let error = JobError::lease_exhausted(job.attempts, now);
            job.apply(Transition::Failed(error), now);
            Self::write_job(tx, &job).await?;
            Self::append_event(
                tx,
                job.id,
                JobEventKind::Failed,
                serde_json::json!({ "error_code": "attempts_exhausted" }),
                now,
            )
            .await?;
            Self::append_outbox(tx, &CompletionEvent::for_job(&job, now)).await?;
            tracing::warn!(job_id = %job.id, attempts = job.attempts, "analysis job exhausted its attempts");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresStore {
    async fn enqueue(
        &self,
        request: &EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let key = idempotency_key(request.company_id, request.survey_id, &request.window);
        if let Some(existing) = self.active_job_for_key(&key).await? {
            return Ok(EnqueueOutcome {
                idempotency_key: key,
                job: existing,
                created: false,
            });
        }

        let mut tx = self.pool.begin().await?;
        let inserted: Result<JobRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO analysis_jobs (
                id, company_id, survey_id, window_start, window_end, idempotency_key,
                status, attempts, not_before, partial, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, $7, FALSE, $7)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.company_id.as_uuid())
        .bind(request.survey_id.as_uuid())
        .bind(request.window.start)
        .bind(request.window.end)
        .bind(&key)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                // Lost the race on the active-key index; the winner's job is the answer.
                drop(tx);
                let existing = self.active_job_for_key(&key).await?.ok_or_else(|| {
                    StoreError::Contention(format!("active job for key {key} finished mid-enqueue"))
                })?;
                return Ok(EnqueueOutcome {
                    idempotency_key: key,
                    job: existing,
                    created: false,
                });
            }
            Err(err) => return Err(err.into()),
        };
        let job = AnalysisJob::try_from(row)?;
        Self::append_event(
            &mut tx,
            job.id,
            JobEventKind::Created,
            serde_json::json!({ "idempotency_key": key }),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(EnqueueOutcome {
            idempotency_key: key,
            job,
            created: true,
        })
    }

    async fn claim_next(&self, request: &ClaimRequest<'_>) -> Result<Option<Claim>, StoreError> {
        let now = request.now;
        let mut tx = self.pool.begin().await?;
        Self::fail_exhausted(&mut tx, now, request.max_attempts).await?;

        let next: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT j.id, j.status
            FROM analysis_jobs j
            LEFT JOIN analysis_company_fairness f ON f.company_id = j.company_id
            WHERE (j.status = 'queued' AND j.not_before <= $1)
               OR (j.status = 'running' AND j.lease_expires_at <= $1)
            ORDER BY COALESCE(f.last_served, 0) ASC, j.created_at ASC, j.id ASC
            LIMIT 1
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((job_id, previous_status)) = next else {
            tx.commit().await?;
            return Ok(None);
        };

        let token = Uuid::new_v4();
        let row: JobRow = sqlx::query_as(&format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'running',
                attempts = attempts + 1,
                claim_token = $2,
                worker_id = $3,
                lease_expires_at = $4,
                started_at = $5
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(token)
        .bind(request.worker_id)
        .bind(request.lease_expiry())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let job = AnalysisJob::try_from(row)?;

        sqlx::query(
            r#"
            INSERT INTO analysis_company_fairness (company_id, last_served)
            VALUES ($1, nextval('analysis_serve_clock'))
            ON CONFLICT (company_id)
            DO UPDATE SET last_served = EXCLUDED.last_served
            "#,
        )
        .bind(job.company_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        let reclaimed = previous_status == JobStatus::Running.as_str();
        let kind = if reclaimed {
            JobEventKind::Reclaimed
        } else {
            JobEventKind::Claimed
        };
        Self::append_event(
            &mut tx,
            job.id,
            kind,
            serde_json::json!({ "worker_id": request.worker_id, "attempt": job.attempts }),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(Some(Claim {
            job,
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
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_job(&mut tx, job_id).await? else {
            return Err(StoreError::Corrupt(format!("job {job_id} vanished while running")));
        };
        if job.status != JobStatus::Running || job.claim_token != Some(claim_token) {
            Self::append_event(
                &mut tx,
                job_id,
                JobEventKind::StaleCompletion,
                serde_json::json!({
                    "attempted": transition.status().as_str(),
                    "status": job.status.as_str(),
                }),
                now,
            )
            .await?;
            tx.commit().await?;
            return Ok(FinishOutcome::StaleClaim);
        }

        let payload = transition_payload(&transition);
        let kind = JobEventKind::for_transition(&transition);
        job.apply(transition, now);
        Self::write_job(&mut tx, &job).await?;
        Self::append_event(&mut tx, job_id, kind, payload, now).await?;
        if job.status.is_terminal() {
            Self::append_outbox(&mut tx, &CompletionEvent::for_job(&job, now)).await?;
        }
        tx.commit().await?;
        Ok(FinishOutcome::Applied(job))
    }

    async fn request_cancel(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_job(&mut tx, job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        let outcome = match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.cancel_requested_at = Some(now);
                job.completed_at = Some(now);
                Self::write_job(&mut tx, &job).await?;
                Self::append_event(
                    &mut tx,
                    job_id,
                    JobEventKind::Cancelled,
                    serde_json::json!({ "before_start": true }),
                    now,
                )
                .await?;
                Self::append_outbox(&mut tx, &CompletionEvent::for_job(&job, now)).await?;
                CancelOutcome::CancelledBeforeStart(job)
            }
            JobStatus::Running => {
                job.cancel_requested_at.get_or_insert(now);
                Self::write_job(&mut tx, &job).await?;
                Self::append_event(
                    &mut tx,
                    job_id,
                    JobEventKind::CancelRequested,
                    serde_json::json!({}),
                    now,
                )
                .await?;
                CancelOutcome::Requested(job)
            }
            status => CancelOutcome::AlreadyFinished(status),
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT cancel_requested_at IS NOT NULL FROM analysis_jobs WHERE id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|(requested,)| requested))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<AnalysisJob>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 LIMIT 1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(AnalysisJob::try_from).transpose()
    }

    async fn list_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            kind: String,
            payload: SqlJson<serde_json::Value>,
            created_at: DateTime<Utc>,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT kind, payload, created_at
            FROM analysis_job_events
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let kind = JobEventKind::parse(&row.kind).ok_or_else(|| {
                    StoreError::Corrupt(format!("unknown job event kind {:?}", row.kind))
                })?;
                Ok(JobEvent {
                    job_id,
                    kind,
                    payload: row.payload.0,
                    at: row.created_at,
                })
            })
            .collect()
    }

    async fn pending_completions(&self, limit: usize) -> Result<Vec<PendingCompletion>, StoreError> {
        let rows: Vec<(i64, SqlJson<CompletionEvent>)> = sqlx::query_as(
            r#"
            SELECT id, payload
            FROM analysis_job_outbox
            WHERE delivered_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, payload)| PendingCompletion {
                id,
                event: payload.0,
            })
            .collect())
    }

    async fn mark_delivered(&self, ids: &[i64], now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analysis_job_outbox
            SET delivered_at = $2
            WHERE id = ANY($1) AND delivered_at IS NULL
            "#,
        )
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResponseSource for PostgresStore {
    async fn load_company(&self, company_id: CompanyId) -> Result<Option<Company>, StoreError> {
        let row: Option<(Uuid, bool)> =
            sqlx::query_as("SELECT id, active FROM companies WHERE id = $1")
                .bind(company_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, active)| Company {
            id: CompanyId(id),
            active,
        }))
    }

    async fn load_survey(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
    ) -> Result<Option<Survey>, StoreError> {
        let row: Option<(Uuid, Uuid, bool, SqlJson<Vec<Question>>)> = sqlx::query_as(
            r#"
            SELECT id, company_id, active, questions
            FROM surveys
            WHERE id = $1 AND company_id = $2
            "#,
        )
        .bind(survey_id.as_uuid())
        .bind(tenant.company_id().as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, company_id, active, questions)| Survey {
            id: SurveyId(id),
            company_id: CompanyId(company_id),
            questions: questions.0,
            active,
        }))
    }

    async fn read_responses(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Vec<Response>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: Uuid,
            survey_id: Uuid,
            company_id: Uuid,
            submitted_at: DateTime<Utc>,
            answers: SqlJson<BTreeMap<String, serde_json::Value>>,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT id, survey_id, company_id, submitted_at, answers
            FROM survey_responses
            WHERE company_id = $1
              AND survey_id = $2
              AND submitted_at >= $3
              AND submitted_at < $4
            ORDER BY submitted_at ASC, id ASC
            "#,
        )
        .bind(tenant.company_id().as_uuid())
        .bind(survey_id.as_uuid())
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Response {
                id: row.id.into(),
                survey_id: SurveyId(row.survey_id),
                company_id: CompanyId(row.company_id),
                submitted_at: row.submitted_at,
                answers: row.answers.0,
            })
            .collect())
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn read_history(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        before: &Window,
        limit: usize,
    ) -> Result<Vec<AnalysisResult>, StoreError> {
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
            FROM analysis_results
            WHERE company_id = $1
              AND survey_id = $2
              AND superseded_at IS NULL
              AND window_start < $3
            ORDER BY window_start DESC, window_end DESC
            LIMIT $4
            "#
        ))
        .bind(tenant.company_id().as_uuid())
        .bind(survey_id.as_uuid())
        .bind(before.start)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        let mut history: Vec<AnalysisResult> = rows.into_iter().map(|row| row.result.0).collect();
        history.reverse();
        Ok(history)
    }

    async fn current_result(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Option<StoredResult>, StoreError> {
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
            FROM analysis_results
            WHERE company_id = $1
              AND survey_id = $2
              AND window_start = $3
              AND window_end = $4
              AND superseded_at IS NULL
            LIMIT 1
            "#
        ))
        .bind(tenant.company_id().as_uuid())
        .bind(survey_id.as_uuid())
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StoredResult::from))
    }

    async fn lineage(
        &self,
        tenant: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Vec<StoredResult>, StoreError> {
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
            FROM analysis_results
            WHERE company_id = $1 AND idempotency_key = $2
            ORDER BY stored_at ASC, record_id ASC
            "#
        ))
        .bind(tenant.company_id().as_uuid())
        .bind(idempotency_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoredResult::from).collect())
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
        let mut tx = self.pool.begin().await?;
        if let Some(fence) = fence {
            // FOR SHARE holds off a concurrent reclaim or finish until this write commits.
            let row: Option<JobRow> = sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 FOR SHARE"
            ))
            .bind(fence.job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
            let owned = match row {
                Some(row) => fence.holds(&AnalysisJob::try_from(row)?),
                None => false,
            };
            if !owned {
                tx.commit().await?;
                return Ok(PersistOutcome::Fenced {
                    job_id: fence.job_id,
                });
            }
        }
        // Serializes writers of one lineage, including the very first write for a key.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&result.idempotency_key)
            .execute(&mut *tx)
            .await?;
        let rows: Vec<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM analysis_results WHERE idempotency_key = $1"
        ))
        .bind(&result.idempotency_key)
        .fetch_all(&mut *tx)
        .await?;
        let lineage: Vec<StoredResult> = rows.into_iter().map(StoredResult::from).collect();

        let supersedes = match plan_write(&lineage, result) {
            WritePlan::Discard(outcome) => {
                tx.commit().await?;
                return Ok(outcome);
            }
            WritePlan::Insert { supersedes } => supersedes,
        };
        let record_id = result.record_id();
        if let Some(previous) = supersedes {
            sqlx::query(
                r#"
                UPDATE analysis_results
                SET superseded_at = $2, superseded_by = $3
                WHERE record_id = $1
                "#,
            )
            .bind(previous)
            .bind(now)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO analysis_results (
                record_id, idempotency_key, job_id, company_id, survey_id,
                window_start, window_end, job_started_at, result, stored_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record_id)
        .bind(&result.idempotency_key)
        .bind(result.job_id.as_uuid())
        .bind(result.company_id.as_uuid())
        .bind(result.survey_id.as_uuid())
        .bind(result.window.start)
        .bind(result.window.end)
        .bind(result.job_started_at)
        .bind(SqlJson(result))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(PersistOutcome::Current {
            record_id,
            superseded: supersedes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(status: &str) -> JobRow {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        JobRow {
            id: Uuid::from_u128(1),
            company_id: Uuid::from_u128(2),
            survey_id: Uuid::from_u128(3),
            window_start: start,
            window_end: start + chrono::Duration::days(1),
            idempotency_key: "k".to_string(),
            status: status.to_string(),
            attempts: 2,
            claim_token: None,
            worker_id: Some("worker-0".to_string()),
            lease_expires_at: None,
            not_before: start,
            cancel_requested_at: None,
            last_error: Some(SqlJson(JobError::new("storage_timeout", "slow", start))),
            partial: false,
            created_at: start,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn job_rows_map_to_jobs() {
        let job = AnalysisJob::try_from(row("queued")).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.company_id, CompanyId(Uuid::from_u128(2)));
        assert_eq!(job.last_error.unwrap().code, "storage_timeout");
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let err = AnalysisJob::try_from(row("pending")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn inverted_window_is_corrupt() {
        let mut bad = row("running");
        std::mem::swap(&mut bad.window_start, &mut bad.window_end);
        assert!(matches!(
            AnalysisJob::try_from(bad).unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }
}
