use super::aggregate::{AggregateReport, DistributionSummary, NumericSummary};
use super::stats::significance::{mean_difference_p_value, proportion_difference_p_value};
use crate::config::AnalysisSettings;
use crate::domain::{QuestionKind, Survey};
use serde::{Deserialize, Serialize};

const SIGNIFICANCE_ALPHA: f64 = 0.05;
const MIN_PRIOR_WINDOWS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSignal {
    pub question_id: String,
    pub metric: String,
    /// Relative change against the trailing average (0.2 = +20%).
    pub delta: f64,
    pub current: f64,
    pub baseline: f64,
    pub direction: TrendDirection,
    pub significant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    InsufficientHistory,
    InsufficientPriorSamples,
    ZeroBaseline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressedMetric {
    pub question_id: String,
    pub metric: String,
    pub reason: SuppressionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub signals: Vec<TrendSignal>,
    pub suppressed: Vec<SuppressedMetric>,
}

/// One prior window's view of a metric.
struct PriorPoint {
    value: f64,
    variance: f64,
    samples: u64,
}

struct MetricInput {
    current: f64,
    current_variance: f64,
    current_samples: u64,
    priors: Vec<Option<PriorPoint>>,
}

enum MetricKind {
    Mean,
    Share,
}

/// Compares the current window with the trailing average of up to
/// `trend_history_windows` prior windows. `history` is ordered oldest first.
pub fn detect_trends(
    survey: &Survey,
    current: &AggregateReport,
    history: &[&AggregateReport],
    settings: &AnalysisSettings,
) -> TrendReport {
    let take = settings.trend_history_windows.min(history.len());
    let window = &history[history.len() - take..];
    let mut report = TrendReport::default();

    for question in &survey.questions {
        let Some(section) = current.questions.get(&question.id) else {
            continue;
        };
        match &question.kind {
            QuestionKind::Numeric { .. } => {
                let Some(summary) = section.numeric() else {
                    continue;
                };
                let input = MetricInput {
                    current: summary.mean,
                    current_variance: summary.variance.unwrap_or(0.0),
                    current_samples: summary.count,
                    priors: window
                        .iter()
                        .map(|prior| {
                            prior
                                .questions
                                .get(&question.id)
                                .and_then(|s| s.numeric())
                                .map(mean_point)
                        })
                        .collect(),
                };
                evaluate(&mut report, &question.id, "mean", MetricKind::Mean, input, settings);
            }
            QuestionKind::Categorical { options } | QuestionKind::MultiSelect { options, .. } => {
                let Some(summary) = section.distribution() else {
                    continue;
                };
                for option in options {
                    let option = option.trim();
                    let share = summary.shares.get(option).copied().unwrap_or(0.0);
                    let input = MetricInput {
                        current: share,
                        current_variance: 0.0,
                        current_samples: summary.respondents,
                        priors: window
                            .iter()
                            .map(|prior| {
                                prior
                                    .questions
                                    .get(&question.id)
                                    .and_then(|s| s.distribution())
                                    .map(|d| share_point(d, option))
                            })
                            .collect(),
                    };
                    let metric = format!("share:{option}");
                    evaluate(&mut report, &question.id, &metric, MetricKind::Share, input, settings);
                }
            }
            QuestionKind::FreeText => {}
        }
    }

    report
}

fn mean_point(summary: &NumericSummary) -> PriorPoint {
    PriorPoint {
        value: summary.mean,
        variance: summary.variance.unwrap_or(0.0),
        samples: summary.count,
    }
}

fn share_point(summary: &DistributionSummary, option: &str) -> PriorPoint {
    PriorPoint {
        value: summary.shares.get(option).copied().unwrap_or(0.0),
        variance: 0.0,
        samples: summary.respondents,
    }
}

fn evaluate(
    report: &mut TrendReport,
    question_id: &str,
    metric: &str,
    kind: MetricKind,
    input: MetricInput,
    settings: &AnalysisSettings,
) {
    let suppress = |report: &mut TrendReport, reason| {
        report.suppressed.push(SuppressedMetric {
            question_id: question_id.to_string(),
            metric: metric.to_string(),
            reason,
        });
    };

    if input.priors.len() < MIN_PRIOR_WINDOWS {
        suppress(report, SuppressionReason::InsufficientHistory);
        return;
    }
    let mut priors = Vec::with_capacity(input.priors.len());
    for point in input.priors {
        match point {
            Some(p) if p.samples >= settings.trend_min_prior_samples => priors.push(p),
            _ => {
                suppress(report, SuppressionReason::InsufficientPriorSamples);
                return;
            }
        }
    }

    let n = priors.len() as f64;
    let baseline = priors.iter().map(|p| p.value).sum::<f64>() / n;
    if baseline.abs() < 1e-12 {
        suppress(report, SuppressionReason::ZeroBaseline);
        return;
    }

    let delta = (input.current - baseline) / baseline.abs();
    if delta.abs() <= settings.trend_significance_pct / 100.0 {
        return;
    }

    let baseline_samples: u64 = priors.iter().map(|p| p.samples).sum();
    let p_value = match kind {
        MetricKind::Mean => {
            let baseline_variance = priors.iter().map(|p| p.variance).sum::<f64>() / n;
            mean_difference_p_value(
                input.current,
                input.current_variance,
                input.current_samples,
                baseline,
                baseline_variance,
                baseline_samples,
            )
        }
        MetricKind::Share => proportion_difference_p_value(
            input.current,
            input.current_samples,
            baseline,
            baseline_samples,
        ),
    };

    report.signals.push(TrendSignal {
        question_id: question_id.to_string(),
        metric: metric.to_string(),
        delta,
        current: input.current,
        baseline,
        direction: if delta > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        },
        significant: p_value.is_some_and(|p| p < SIGNIFICANCE_ALPHA),
        p_value,
    });
}
