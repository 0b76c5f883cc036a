//! Result lineage and the cache writer.
//!
//! Results for one (company, survey, window) key form an append-only lineage. Exactly one
//! record per key is current; older ones are marked superseded, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::aggregate::AggregateReport;
use super::anomaly::AnomalyFlag;
use super::cleaner::Exclusion;
use super::jobs::store::{bounded, ResultStore};
use super::jobs::ClaimFence;
use super::trend::TrendReport;
use super::validator::ValidationRejection;
use crate::domain::Window;
use crate::error::PipelineError;
use crate::ids::{result_record_id, CompanyId, JobId, SurveyId};
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub received: u64,
    pub rejected: u64,
    pub excluded: u64,
    pub usable: u64,
    pub low_signal: u64,
    pub retained_outliers: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub company_id: CompanyId,
    pub survey_id: SurveyId,
    pub window: Window,
    pub idempotency_key: String,
    pub job_id: JobId,
    /// Start of the attempt that produced this result; orders writes within a lineage.
    pub job_started_at: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    /// Set when any section was reported insufficient.
    pub partial: bool,
    pub batch: BatchSummary,
    pub rejections: Vec<ValidationRejection>,
    pub exclusions: Vec<Exclusion>,
    pub aggregates: AggregateReport,
    pub trends: TrendReport,
    pub anomalies: Vec<AnomalyFlag>,
}

impl AnalysisResult {
    pub fn record_id(&self) -> Uuid {
        result_record_id(&self.idempotency_key, self.job_id)
    }

    fn lineage_order(&self) -> (DateTime<Utc>, JobId) {
        (self.job_started_at, self.job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub record_id: Uuid,
    pub result: AnalysisResult,
    pub stored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Uuid>,
}

impl StoredResult {
    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PersistOutcome {
    Current {
        record_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        superseded: Option<Uuid>,
    },
    /// This job already wrote a record for the key.
    Duplicate { record_id: Uuid },
    /// A later-started job's result is already current.
    Stale { current_job_id: JobId },
    /// The writer's claim no longer owns the job; nothing was written.
    Fenced { job_id: JobId },
}

impl PersistOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistOutcome::Current { .. } => "current",
            PersistOutcome::Duplicate { .. } => "duplicate",
            PersistOutcome::Stale { .. } => "stale",
            PersistOutcome::Fenced { .. } => "fenced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritePlan {
    Insert { supersedes: Option<Uuid> },
    Discard(PersistOutcome),
}

/// Decides a write against the existing lineage for the incoming result's key.
pub(crate) fn plan_write(lineage: &[StoredResult], incoming: &AnalysisResult) -> WritePlan {
    if let Some(existing) = lineage.iter().find(|r| r.result.job_id == incoming.job_id) {
        return WritePlan::Discard(PersistOutcome::Duplicate {
            record_id: existing.record_id,
        });
    }
    match lineage.iter().find(|r| r.is_current()) {
        Some(current) if current.result.lineage_order() > incoming.lineage_order() => {
            WritePlan::Discard(PersistOutcome::Stale {
                current_job_id: current.result.job_id,
            })
        }
        Some(current) => WritePlan::Insert {
            supersedes: Some(current.record_id),
        },
        None => WritePlan::Insert { supersedes: None },
    }
}

/// Broadcast after a result becomes current so read-side caches can drop the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultInvalidation {
    pub company_id: CompanyId,
    pub survey_id: SurveyId,
    pub window: Window,
    pub idempotency_key: String,
    pub record_id: Uuid,
}

pub struct ResultCacheWriter {
    store: Arc<dyn ResultStore>,
    invalidations: broadcast::Sender<ResultInvalidation>,
    storage_timeout: Duration,
}

impl ResultCacheWriter {
    pub fn new(store: Arc<dyn ResultStore>, storage_timeout: Duration) -> Self {
        let (invalidations, _) = broadcast::channel(256);
        Self {
            store,
            invalidations,
            storage_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResultInvalidation> {
        self.invalidations.subscribe()
    }

    pub async fn persist(
        &self,
        tenant: &TenantContext,
        result: &AnalysisResult,
        fence: Option<ClaimFence>,
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, PipelineError> {
        tenant.ensure_owns(result.company_id, "analysis result")?;
        let outcome = bounded(
            self.storage_timeout,
            self.store.persist_result(tenant, result, fence, now),
        )
        .await?;

        match outcome {
            PersistOutcome::Current { record_id, superseded } => {
                tracing::info!(
                    idempotency_key = %result.idempotency_key,
                    %record_id,
                    superseded = ?superseded,
                    "analysis result is current"
                );
                // No receivers is fine; nothing is caching this key.
                let _ = self.invalidations.send(ResultInvalidation {
                    company_id: result.company_id,
                    survey_id: result.survey_id,
                    window: result.window,
                    idempotency_key: result.idempotency_key.clone(),
                    record_id,
                });
            }
            PersistOutcome::Duplicate { record_id } => {
                tracing::info!(
                    idempotency_key = %result.idempotency_key,
                    %record_id,
                    "duplicate result write discarded"
                );
            }
            PersistOutcome::Stale { current_job_id } => {
                tracing::warn!(
                    idempotency_key = %result.idempotency_key,
                    %current_job_id,
                    "stale result write discarded"
                );
            }
            PersistOutcome::Fenced { job_id } => {
                tracing::warn!(
                    idempotency_key = %result.idempotency_key,
                    %job_id,
                    "claim lost before result write; discarded"
                );
            }
        }
        Ok(outcome)
    }

    pub async fn current(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Option<StoredResult>, PipelineError> {
        let found = bounded(
            self.storage_timeout,
            self.store.current_result(tenant, survey_id, window),
        )
        .await?;
        if let Some(stored) = &found {
            tenant.ensure_owns(stored.result.company_id, "analysis result")?;
        }
        Ok(found)
    }

    pub async fn history(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        before: &Window,
        limit: usize,
    ) -> Result<Vec<AnalysisResult>, PipelineError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let results = bounded(
            self.storage_timeout,
            self.store.read_history(tenant, survey_id, before, limit),
        )
        .await?;
        for result in &results {
            tenant.ensure_owns(result.company_id, "analysis result")?;
        }
        Ok(results)
    }

    pub async fn lineage(
        &self,
        tenant: &TenantContext,
        idempotency_key: &str,
    ) -> Result<Vec<StoredResult>, PipelineError> {
        bounded(self.storage_timeout, self.store.lineage(tenant, idempotency_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analysis::jobs::memory::MemoryStore;
    use crate::test_support::{analysis_result, survey_fixture, window_at};
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn plan_detects_duplicate_and_stale_writes() {
        let (tenant, survey) = survey_fixture();
        let window = window_at(0);
        let first = analysis_result(&tenant, &survey, window, JobId::new_v4(), ts(1));
        let stored = StoredResult {
            record_id: first.record_id(),
            result: first.clone(),
            stored_at: ts(2),
            superseded_at: None,
            superseded_by: None,
        };

        assert_eq!(
            plan_write(std::slice::from_ref(&stored), &first),
            WritePlan::Discard(PersistOutcome::Duplicate {
                record_id: first.record_id()
            })
        );

        let older = analysis_result(&tenant, &survey, window, JobId::new_v4(), ts(0));
        assert_eq!(
            plan_write(std::slice::from_ref(&stored), &older),
            WritePlan::Discard(PersistOutcome::Stale {
                current_job_id: first.job_id
            })
        );

        let newer = analysis_result(&tenant, &survey, window, JobId::new_v4(), ts(5));
        assert_eq!(
            plan_write(&[stored], &newer),
            WritePlan::Insert {
                supersedes: Some(first.record_id())
            }
        );
    }

    #[tokio::test]
    async fn supersede_keeps_prior_records_and_one_current() {
        let (tenant, survey) = survey_fixture();
        let store = Arc::new(MemoryStore::new());
        let writer = ResultCacheWriter::new(store, Duration::from_secs(1));
        let mut invalidations = writer.subscribe();
        let window = window_at(0);

        let first = analysis_result(&tenant, &survey, window, JobId::new_v4(), ts(1));
        let second = analysis_result(&tenant, &survey, window, JobId::new_v4(), ts(2));
        writer.persist(&tenant, &first, None, ts(3)).await.unwrap();
        let outcome = writer.persist(&tenant, &second, None, ts(4)).await.unwrap();
        assert_eq!(
            outcome,
            PersistOutcome::Current {
                record_id: second.record_id(),
                superseded: Some(first.record_id())
            }
        );

        let lineage = writer.lineage(&tenant, &first.idempotency_key).await.unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage.iter().filter(|r| r.is_current()).count(), 1);
        assert_eq!(lineage[0].superseded_by, Some(second.record_id()));

        let current = writer.current(&tenant, survey.id, &window).await.unwrap().unwrap();
        assert_eq!(current.result.job_id, second.job_id);

        assert_eq!(invalidations.recv().await.unwrap().record_id, first.record_id());
        assert_eq!(invalidations.recv().await.unwrap().record_id, second.record_id());
    }

    #[tokio::test]
    async fn double_write_of_one_job_yields_one_record() {
        let (tenant, survey) = survey_fixture();
        let writer = ResultCacheWriter::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
        let result = analysis_result(&tenant, &survey, window_at(0), JobId::new_v4(), ts(1));

        writer.persist(&tenant, &result, None, ts(2)).await.unwrap();
        let again = writer.persist(&tenant, &result, None, ts(3)).await.unwrap();
        assert_eq!(again.as_str(), "duplicate");
        let lineage = writer.lineage(&tenant, &result.idempotency_key).await.unwrap();
        assert_eq!(lineage.len(), 1);
    }

    #[tokio::test]
    async fn history_returns_earlier_windows_oldest_first() {
        let (tenant, survey) = survey_fixture();
        let writer = ResultCacheWriter::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
        for day in 0..5 {
            let result = analysis_result(&tenant, &survey, window_at(day), JobId::new_v4(), ts(1));
            writer.persist(&tenant, &result, None, ts(2)).await.unwrap();
        }

        let history = writer.history(&tenant, survey.id, &window_at(4), 3).await.unwrap();
        let starts: Vec<_> = history.iter().map(|r| r.window).collect();
        assert_eq!(starts, vec![window_at(1), window_at(2), window_at(3)]);
    }

    #[tokio::test]
    async fn foreign_results_are_refused() {
        let (tenant, survey) = survey_fixture();
        let (other_tenant, other_survey) = crate::test_support::survey_fixture_for(7);
        let writer = ResultCacheWriter::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
        let foreign = analysis_result(&other_tenant, &other_survey, window_at(0), JobId::new_v4(), ts(1));

        let err = writer.persist(&tenant, &foreign, None, ts(2)).await.unwrap_err();
        assert_eq!(err.reason_code(), "tenant_isolation_violation");
        assert!(writer.current(&tenant, survey.id, &window_at(0)).await.unwrap().is_none());
    }
}
