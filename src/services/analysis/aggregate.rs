use super::cleaner::CleanedBatch;
use super::stats::quantile::{Percentiles, StreamingPercentiles};
use super::stats::streaming::Welford;
use crate::config::AnalysisSettings;
use crate::domain::{Answer, QuestionKind, Survey};
use crate::error::{DataInsufficient, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "is", "it", "its",
    "of", "on", "or", "so", "that", "the", "this", "to", "was", "we", "were", "with",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub count: u64,
    pub mean: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub percentiles: Percentiles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub respondents: u64,
    pub counts: BTreeMap<String, u64>,
    pub shares: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub token: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSummary {
    pub answers: u64,
    pub low_signal: u64,
    pub top_tokens: Vec<TokenCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionStats {
    Numeric(NumericSummary),
    Distribution(DistributionSummary),
    Text(TextSummary),
}

/// Per-question output. Too-small samples are reported absent, never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuestionSection {
    Available { stats: QuestionStats },
    Insufficient { reason: DataInsufficient },
}

impl QuestionSection {
    pub fn numeric(&self) -> Option<&NumericSummary> {
        match self {
            QuestionSection::Available {
                stats: QuestionStats::Numeric(summary),
            } => Some(summary),
            _ => None,
        }
    }

    pub fn distribution(&self) -> Option<&DistributionSummary> {
        match self {
            QuestionSection::Available {
                stats: QuestionStats::Distribution(summary),
            } => Some(summary),
            _ => None,
        }
    }

    pub fn sample_count(&self) -> u64 {
        match self {
            QuestionSection::Available { stats } => match stats {
                QuestionStats::Numeric(s) => s.count,
                QuestionStats::Distribution(s) => s.respondents,
                QuestionStats::Text(s) => s.answers,
            },
            QuestionSection::Insufficient { reason } => reason.available,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, QuestionSection::Insufficient { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub usable_responses: u64,
    pub questions: BTreeMap<String, QuestionSection>,
}

impl AggregateReport {
    pub fn is_partial(&self) -> bool {
        self.questions.values().any(QuestionSection::is_insufficient)
    }
}

enum Accumulator {
    Numeric {
        moments: Welford,
        quantiles: StreamingPercentiles,
    },
    Distribution { respondents: u64, counts: BTreeMap<String, u64> },
    Text(TokenAccumulator),
}

impl Accumulator {
    fn for_kind(kind: &QuestionKind, top_k: usize) -> Self {
        match kind {
            QuestionKind::Numeric { .. } => Accumulator::Numeric {
                moments: Welford::new(),
                quantiles: StreamingPercentiles::new(),
            },
            QuestionKind::Categorical { options } | QuestionKind::MultiSelect { options, .. } => {
                Accumulator::Distribution {
                    respondents: 0,
                    counts: options.iter().map(|o| (o.trim().to_string(), 0)).collect(),
                }
            }
            QuestionKind::FreeText => Accumulator::Text(TokenAccumulator::new(top_k)),
        }
    }

    fn push(&mut self, answer: &Answer, low_signal: bool) {
        match (self, answer) {
            (Accumulator::Numeric { moments, quantiles }, Answer::Numeric(value)) => {
                moments.push(*value);
                quantiles.push(*value);
            }
            (Accumulator::Distribution { respondents, counts }, Answer::Categorical(choice)) => {
                *respondents += 1;
                *counts.entry(choice.clone()).or_insert(0) += 1;
            }
            (Accumulator::Distribution { respondents, counts }, Answer::MultiSelect(choices)) => {
                *respondents += 1;
                for choice in choices {
                    *counts.entry(choice.clone()).or_insert(0) += 1;
                }
            }
            (Accumulator::Text(tokens), Answer::FreeText(text)) => tokens.push(text, low_signal),
            _ => {}
        }
    }

    fn sample_count(&self) -> u64 {
        match self {
            Accumulator::Numeric { moments, .. } => moments.count(),
            Accumulator::Distribution { respondents, .. } => *respondents,
            Accumulator::Text(tokens) => tokens.answers,
        }
    }

    fn finish(self, question_id: &str) -> Result<QuestionStats, PipelineError> {
        match self {
            Accumulator::Numeric { moments, quantiles } => {
                let (Some(mean), Some(min), Some(max)) = (moments.mean(), moments.min(), moments.max())
                else {
                    return Err(PipelineError::computation(
                        "aggregate",
                        format!("{question_id}: numeric summary requested for empty sample"),
                    ));
                };
                if !mean.is_finite() {
                    return Err(PipelineError::computation(
                        "aggregate",
                        format!("{question_id}: non-finite mean over {} values", moments.count()),
                    ));
                }
                let percentiles = quantiles.estimate().ok_or_else(|| {
                    PipelineError::computation(
                        "aggregate",
                        format!("{question_id}: percentile computation failed"),
                    )
                })?;
                Ok(QuestionStats::Numeric(NumericSummary {
                    count: moments.count(),
                    mean,
                    variance: moments.variance(),
                    std_dev: moments.std_dev(),
                    min,
                    max,
                    percentiles,
                }))
            }
            Accumulator::Distribution {
                respondents,
                counts,
            } => {
                let shares = counts
                    .iter()
                    .map(|(option, count)| (option.clone(), *count as f64 / respondents as f64))
                    .collect();
                Ok(QuestionStats::Distribution(DistributionSummary {
                    respondents,
                    counts,
                    shares,
                }))
            }
            Accumulator::Text(tokens) => Ok(QuestionStats::Text(tokens.finish())),
        }
    }
}

/// Token frequencies with a bounded working set; only the top `top_k` are reported.
struct TokenAccumulator {
    answers: u64,
    low_signal: u64,
    top_k: usize,
    cap: usize,
    counts: HashMap<String, u64>,
}

impl TokenAccumulator {
    fn new(top_k: usize) -> Self {
        Self {
            answers: 0,
            low_signal: 0,
            top_k,
            cap: (top_k * 20).max(1_000),
            counts: HashMap::new(),
        }
    }

    fn push(&mut self, text: &str, low_signal: bool) {
        self.answers += 1;
        if low_signal {
            self.low_signal += 1;
            return;
        }
        for token in tokenize(text) {
            *self.counts.entry(token).or_insert(0) += 1;
        }
        if self.counts.len() > self.cap {
            self.prune();
        }
    }

    fn prune(&mut self) {
        let mut floor = 1;
        while self.counts.len() > self.cap {
            self.counts.retain(|_, count| *count > floor);
            floor += 1;
        }
    }

    fn finish(self) -> TextSummary {
        let mut ranked: Vec<TokenCount> = self
            .counts
            .into_iter()
            .map(|(token, count)| TokenCount { token, count })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.token.cmp(&b.token)));
        ranked.truncate(self.top_k);
        TextSummary {
            answers: self.answers,
            low_signal: self.low_signal,
            top_tokens: ranked,
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
}

/// Computes per-question statistics in a single pass over the usable batch.
pub fn aggregate(
    survey: &Survey,
    cleaned: &CleanedBatch,
    settings: &AnalysisSettings,
) -> Result<AggregateReport, PipelineError> {
    let mut accumulators: BTreeMap<&str, Accumulator> = survey
        .questions
        .iter()
        .map(|q| (q.id.as_str(), Accumulator::for_kind(&q.kind, settings.top_k_tokens)))
        .collect();
    let low_signal = cleaned.low_signal_keys();

    for response in &cleaned.usable {
        for (question_id, answer) in &response.answers {
            if let Some(acc) = accumulators.get_mut(question_id.as_str()) {
                let flagged = low_signal.contains(&(response.id, question_id.as_str()));
                acc.push(answer, flagged);
            }
        }
    }

    let mut questions = BTreeMap::new();
    for (question_id, acc) in accumulators {
        let available = acc.sample_count();
        let section = if available < settings.aggregate_min_samples {
            QuestionSection::Insufficient {
                reason: DataInsufficient {
                    available,
                    required: settings.aggregate_min_samples,
                },
            }
        } else {
            QuestionSection::Available {
                stats: acc.finish(question_id)?,
            }
        };
        questions.insert(question_id.to_string(), section);
    }

    Ok(AggregateReport {
        usable_responses: cleaned.usable.len() as u64,
        questions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analysis::cleaner::clean_batch;
    use crate::test_support::{numeric_batch, survey_fixture, validated};
    use serde_json::json;

    #[test]
    fn numeric_summary_has_moments_and_percentiles() {
        let (_, survey) = survey_fixture();
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let settings = AnalysisSettings::default();
        let cleaned = clean_batch(&survey, numeric_batch(&survey, &values), &settings);

        let report = aggregate(&survey, &cleaned, &settings).unwrap();
        let summary = report.questions["satisfaction"].numeric().unwrap();
        assert_eq!(summary.count, 10);
        assert!((summary.mean - 5.5).abs() < 1e-12);
        assert!((summary.variance.unwrap() - 55.0 / 6.0).abs() < 1e-9);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 10.0);
        assert!((summary.percentiles.p50 - 5.5).abs() < 1e-12);
        assert!((summary.percentiles.p90 - 9.1).abs() < 1e-9);
    }

    #[test]
    fn large_batches_report_streamed_percentiles() {
        let (_, survey) = survey_fixture();
        let values: Vec<f64> = (0..2000).map(|i| f64::from(i % 11)).collect();
        let settings = AnalysisSettings::default();
        let cleaned = clean_batch(&survey, numeric_batch(&survey, &values), &settings);

        let report = aggregate(&survey, &cleaned, &settings).unwrap();
        let summary = report.questions["satisfaction"].numeric().unwrap();
        assert_eq!(summary.count, 2000);
        let p = summary.percentiles;
        for (got, want) in [(p.p25, 2.0), (p.p50, 5.0), (p.p75, 8.0), (p.p90, 9.0)] {
            assert!((got - want).abs() < 0.05, "{p:?}");
        }
    }

    #[test]
    fn sparse_questions_are_marked_insufficient() {
        let (_, survey) = survey_fixture();
        let settings = AnalysisSettings::default();
        let batch = (0..6)
            .map(|i| {
                let answers = if i < 2 {
                    json!({ "satisfaction": 4, "plan": "pro" })
                } else {
                    json!({ "satisfaction": 4 })
                };
                validated(&survey, i, answers)
            })
            .collect();
        let cleaned = clean_batch(&survey, batch, &settings);
        let report = aggregate(&survey, &cleaned, &settings).unwrap();

        assert!(report.questions["satisfaction"].numeric().is_some());
        assert_eq!(
            report.questions["plan"],
            QuestionSection::Insufficient {
                reason: DataInsufficient {
                    available: 2,
                    required: 5
                }
            }
        );
        assert!(report.is_partial());
    }

    #[test]
    fn distributions_include_every_option() {
        let (_, survey) = survey_fixture();
        let settings = AnalysisSettings::default();
        let batch = ["free", "pro", "pro", "free", "pro"]
            .iter()
            .enumerate()
            .map(|(i, plan)| {
                validated(
                    &survey,
                    i as u32,
                    json!({ "satisfaction": 5, "plan": plan, "features": ["api", "export"] }),
                )
            })
            .collect();
        let cleaned = clean_batch(&survey, batch, &settings);
        let report = aggregate(&survey, &cleaned, &settings).unwrap();

        let plan = report.questions["plan"].distribution().unwrap();
        assert_eq!(plan.respondents, 5);
        assert_eq!(plan.counts["pro"], 3);
        assert_eq!(plan.counts["enterprise"], 0);
        assert!((plan.shares["pro"] - 0.6).abs() < 1e-12);

        let features = report.questions["features"].distribution().unwrap();
        assert_eq!(features.counts["api"], 5);
        assert_eq!(features.shares["export"], 1.0);
    }

    #[test]
    fn token_summary_is_bounded_and_skips_low_signal_text() {
        let (_, survey) = survey_fixture();
        let mut settings = AnalysisSettings::default();
        settings.top_k_tokens = 2;
        let comments = [
            "Export is slow",
            "slow export, slow sync",
            "Love the export",
            "ok",
            "sync works",
        ];
        let batch = comments
            .iter()
            .enumerate()
            .map(|(i, c)| validated(&survey, i as u32, json!({ "satisfaction": 5, "comment": c })))
            .collect();
        let cleaned = clean_batch(&survey, batch, &settings);
        let report = aggregate(&survey, &cleaned, &settings).unwrap();

        let QuestionSection::Available {
            stats: QuestionStats::Text(text),
        } = &report.questions["comment"]
        else {
            panic!("expected text summary");
        };
        assert_eq!(text.answers, 5);
        assert_eq!(text.low_signal, 1);
        assert_eq!(
            text.top_tokens,
            vec![
                TokenCount {
                    token: "export".to_string(),
                    count: 3
                },
                TokenCount {
                    token: "slow".to_string(),
                    count: 3
                },
            ]
        );
    }

    #[test]
    fn token_pruning_keeps_frequent_tokens() {
        let mut acc = TokenAccumulator::new(1);
        acc.cap = 3;
        acc.push("alpha alpha beta", false);
        acc.push("alpha gamma delta epsilon", false);
        assert!(acc.counts.len() <= 3);
        assert_eq!(acc.counts.get("alpha"), Some(&3));
        let summary = acc.finish();
        assert_eq!(summary.top_tokens[0].token, "alpha");
    }
}
