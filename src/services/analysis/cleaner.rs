use super::stats::streaming::Welford;
use crate::config::AnalysisSettings;
use crate::domain::{Answer, QuestionKind, Survey, ValidatedResponse};
use crate::ids::ResponseId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub response_id: ResponseId,
    pub question_id: String,
    pub value: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowSignalAnswer {
    pub response_id: ResponseId,
    pub question_id: String,
    pub length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CleanedBatch {
    pub usable: Vec<ValidatedResponse>,
    pub excluded: Vec<Exclusion>,
    pub low_signal: Vec<LowSignalAnswer>,
    /// Outliers were kept because excluding them would breach the minimum batch size.
    pub retained_outliers: usize,
}

impl CleanedBatch {
    pub fn low_signal_keys(&self) -> HashSet<(ResponseId, &str)> {
        self.low_signal
            .iter()
            .map(|entry| (entry.response_id, entry.question_id.as_str()))
            .collect()
    }
}

/// Partitions a validated batch into usable and excluded responses.
///
/// Deterministic: the batch is ordered by (submitted_at, id) before any decision, and ties
/// between equally extreme outliers break on response id.
pub fn clean_batch(
    survey: &Survey,
    mut batch: Vec<ValidatedResponse>,
    settings: &AnalysisSettings,
) -> CleanedBatch {
    batch.sort_by(|a, b| (a.submitted_at, a.id).cmp(&(b.submitted_at, b.id)));
    for response in &mut batch {
        for answer in response.answers.values_mut() {
            if let Answer::FreeText(text) = answer {
                *text = normalize_text(text);
            }
        }
    }

    let mut strongest: BTreeMap<ResponseId, Exclusion> = BTreeMap::new();
    if batch.len() >= settings.cleaning_min_batch {
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
            if values.len() < settings.cleaning_min_batch {
                continue;
            }
            let acc: Welford = values.iter().map(|(_, v)| *v).collect();
            for (response_id, value) in values {
                let Some(z) = acc.z_score(value) else {
                    continue;
                };
                if z.abs() <= settings.cleaning_sigma {
                    continue;
                }
                let replace = strongest
                    .get(&response_id)
                    .map_or(true, |current| z.abs() > current.z_score.abs());
                if replace {
                    strongest.insert(
                        response_id,
                        Exclusion {
                            response_id,
                            question_id: question.id.clone(),
                            value,
                            z_score: z,
                        },
                    );
                }
            }
        }
    }

    let mut candidates: Vec<Exclusion> = strongest.into_values().collect();
    candidates.sort_by(|a, b| {
        b.z_score
            .abs()
            .total_cmp(&a.z_score.abs())
            .then(a.response_id.cmp(&b.response_id))
    });
    let allowed = batch.len().saturating_sub(settings.cleaning_min_batch);
    let retained_outliers = candidates.len().saturating_sub(allowed);
    candidates.truncate(allowed);
    if retained_outliers > 0 {
        tracing::info!(
            retained_outliers,
            min_batch = settings.cleaning_min_batch,
            "kept outliers to preserve minimum batch size"
        );
    }

    let excluded_ids: HashSet<ResponseId> = candidates.iter().map(|e| e.response_id).collect();
    let usable: Vec<ValidatedResponse> = batch
        .into_iter()
        .filter(|r| !excluded_ids.contains(&r.id))
        .collect();

    let mut low_signal = Vec::new();
    for response in &usable {
        for (question_id, answer) in &response.answers {
            if let Answer::FreeText(text) = answer {
                let length = text.chars().count();
                if length < settings.min_text_length {
                    low_signal.push(LowSignalAnswer {
                        response_id: response.id,
                        question_id: question_id.clone(),
                        length,
                    });
                }
            }
        }
    }

    CleanedBatch {
        usable,
        excluded: candidates,
        low_signal,
        retained_outliers,
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
