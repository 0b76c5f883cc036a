use chrono::{DateTime, Utc};

use super::aggregate::{aggregate, AggregateReport};
use super::anomaly::detect_anomalies;
use super::cleaner::clean_batch;
use super::jobs::AnalysisJob;
use super::results::{AnalysisResult, BatchSummary};
use super::trend::detect_trends;
use super::validator::validate_batch;
use crate::config::AnalysisSettings;
use crate::domain::{Response, Survey};
use crate::error::PipelineError;
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Clean,
    Aggregate,
    Detect,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Clean => "clean",
            Stage::Aggregate => "aggregate",
            Stage::Detect => "detect",
        }
    }
}

pub struct PipelineInput<'a> {
    pub tenant: &'a TenantContext,
    pub survey: &'a Survey,
    pub job: &'a AnalysisJob,
    pub job_started_at: DateTime<Utc>,
    pub responses: &'a [Response],
    /// Prior results for earlier windows, oldest first.
    pub history: &'a [AnalysisResult],
    pub settings: &'a AnalysisSettings,
}

/// Runs validation through detection for one batch.
///
/// `checkpoint` runs before every stage; returning an error (typically `Cancelled`) stops
/// the run before anything is produced.
pub fn analyze<F>(
    input: PipelineInput<'_>,
    mut checkpoint: F,
) -> Result<AnalysisResult, PipelineError>
where
    F: FnMut(Stage) -> Result<(), PipelineError>,
{
    let PipelineInput {
        tenant,
        survey,
        job,
        job_started_at,
        responses,
        history,
        settings,
    } = input;
    tenant.ensure_owns(job.company_id, "analysis job")?;
    for prior in history {
        tenant.ensure_owns(prior.company_id, "analysis result")?;
    }

    checkpoint(Stage::Validate)?;
    let validated = validate_batch(tenant, survey, responses)?;
    let for_anomalies = validated.accepted.clone();

    checkpoint(Stage::Clean)?;
    let cleaned = clean_batch(survey, validated.accepted, settings);

    checkpoint(Stage::Aggregate)?;
    let aggregates = aggregate(survey, &cleaned, settings)?;

    checkpoint(Stage::Detect)?;
    let prior: Vec<&AggregateReport> = history.iter().map(|r| &r.aggregates).collect();
    let trends = detect_trends(survey, &aggregates, &prior, settings);
    let anomalies = detect_anomalies(survey, &for_anomalies, &aggregates, &prior, settings);

    let batch = BatchSummary {
        received: responses.len() as u64,
        rejected: validated.rejected.len() as u64,
        excluded: cleaned.excluded.len() as u64,
        usable: cleaned.usable.len() as u64,
        low_signal: cleaned.low_signal.len() as u64,
        retained_outliers: cleaned.retained_outliers as u64,
    };
    tracing::debug!(
        received = batch.received,
        rejected = batch.rejected,
        excluded = batch.excluded,
        usable = batch.usable,
        signals = trends.signals.len(),
        anomalies = anomalies.len(),
        "analysis stages complete"
    );

    Ok(AnalysisResult {
        company_id: job.company_id,
        survey_id: job.survey_id,
        window: job.window,
        idempotency_key: job.idempotency_key.clone(),
        job_id: job.id,
        job_started_at,
        computed_at: Utc::now(),
        partial: aggregates.is_partial(),
        batch,
        rejections: validated.rejected,
        exclusions: cleaned.excluded,
        aggregates,
        trends,
        anomalies,
    })
}
