use super::aggregate::AggregateReport;
use super::stats::streaming::Welford;
use crate::config::AnalysisSettings;
use crate::domain::{Answer, QuestionKind, Survey, ValidatedResponse};
use crate::ids::ResponseId;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

const MIN_RESPONSE_SAMPLES: u64 = 3;
const MIN_HISTORY_POINTS: usize = 2;
const BAND_SCALE_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyScope {
    Response {
        response_id: ResponseId,
        question_id: String,
    },
    Aggregate {
        question_id: String,
        metric: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    ResponseZScore,
    OutsideHistoricalBand,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::ResponseZScore => "response_z_score",
            AnomalyReason::OutsideHistoricalBand => "outside_historical_band",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub scope: AnomalyScope,
    pub deviation_score: f64,
    pub reason: AnomalyReason,
    pub observed: f64,
    pub expected: f64,
    pub threshold: f64,
}

/// Numeric answers whose z-score against the batch exceeds the configured threshold.
pub fn response_anomalies(
    survey: &Survey,
    batch: &[ValidatedResponse],
    settings: &AnalysisSettings,
) -> Vec<AnomalyFlag> {
    let mut flags = Vec::new();
    for question in &survey.questions {
        if !matches!(question.kind, QuestionKind::Numeric { .. }) {
            continue;
        }
        let values: Vec<(ResponseId, f64)> = batch
            .iter()
            .filter_map(|r| {
                r.answers
                    .get(&question.id)
                    .and_then(Answer::as_numeric)
                    .map(|v| (r.id, v))
            })
            .collect();
        let acc: Welford = values.iter().map(|(_, v)| *v).collect();
        if acc.count() < MIN_RESPONSE_SAMPLES {
            continue;
        }
        let Some(mean) = acc.mean() else {
            continue;
        };
        for (response_id, value) in values {
            let Some(z) = acc.z_score(value) else {
                continue;
            };
            if z.abs() > settings.anomaly_z_threshold {
                flags.push(AnomalyFlag {
                    scope: AnomalyScope::Response {
                        response_id,
                        question_id: question.id.clone(),
                    },
                    deviation_score: z.abs(),
                    reason: AnomalyReason::ResponseZScore,
                    observed: value,
                    expected: mean,
                    threshold: settings.anomaly_z_threshold,
                });
            }
        }
    }
    flags
}

/// Aggregate means and answer counts that fall outside mean ± k·stddev of prior windows.
pub fn aggregate_anomalies(
    survey: &Survey,
    current: &AggregateReport,
    history: &[&AggregateReport],
    settings: &AnalysisSettings,
) -> Vec<AnomalyFlag> {
    let mut flags = Vec::new();
    for question in &survey.questions {
        let Some(section) = current.questions.get(&question.id) else {
            continue;
        };
        let prior_sections: Vec<_> = history
            .iter()
            .filter_map(|prior| prior.questions.get(&question.id))
            .collect();

        if let Some(summary) = section.numeric() {
            let prior_means: Vec<f64> = prior_sections
                .iter()
                .filter_map(|s| s.numeric().map(|n| n.mean))
                .collect();
            if let Some(flag) = band_check(&question.id, "mean", summary.mean, &prior_means, settings) {
                flags.push(flag);
            }
        }

        let prior_counts: Vec<f64> = prior_sections
            .iter()
            .map(|s| s.sample_count() as f64)
            .collect();
        let observed = section.sample_count() as f64;
        if let Some(flag) = band_check(&question.id, "count", observed, &prior_counts, settings) {
            flags.push(flag);
        }
    }
    flags
}

fn band_check(
    question_id: &str,
    metric: &str,
    observed: f64,
    history: &[f64],
    settings: &AnalysisSettings,
) -> Option<AnomalyFlag> {
    if history.len() < MIN_HISTORY_POINTS || !observed.is_finite() {
        return None;
    }
    let expected = history.iter().mean();
    let spread = history.iter().std_dev();
    if !expected.is_finite() || !spread.is_finite() {
        return None;
    }
    let scale = spread.max(expected.abs() * BAND_SCALE_FLOOR);
    if !(scale > 0.0) {
        return None;
    }
    let deviation = (observed - expected).abs() / scale;
    (deviation > settings.anomaly_band_k).then(|| AnomalyFlag {
        scope: AnomalyScope::Aggregate {
            question_id: question_id.to_string(),
            metric: metric.to_string(),
        },
        deviation_score: deviation,
        reason: AnomalyReason::OutsideHistoricalBand,
        observed,
        expected,
        threshold: settings.anomaly_band_k,
    })
}

/// Combines both detectors; ordered by deviation descending, then scope.
pub fn detect_anomalies(
    survey: &Survey,
    validated: &[ValidatedResponse],
    current: &AggregateReport,
    history: &[&AggregateReport],
    settings: &AnalysisSettings,
) -> Vec<AnomalyFlag> {
    let mut flags = response_anomalies(survey, validated, settings);
    flags.extend(aggregate_anomalies(survey, current, history, settings));
    flags.sort_by(|a, b| {
        b.deviation_score
            .total_cmp(&a.deviation_score)
            .then_with(|| a.scope.cmp(&b.scope))
    });
    flags
}
