use crate::domain::{Answer, Question, QuestionKind, Response, Survey, ValidatedResponse};
use crate::error::PipelineError;
use crate::ids::ResponseId;
use crate::tenant::TenantContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerError {
    #[error("{question_id}: required answer missing")]
    MissingRequired { question_id: String },
    #[error("{question_id}: expected {expected}, got {found}")]
    TypeMismatch {
        question_id: String,
        expected: String,
        found: String,
    },
    #[error("{question_id}: {detail}")]
    OutOfRange { question_id: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRejection {
    pub response_id: ResponseId,
    pub errors: Vec<AnswerError>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidatedBatch {
    pub accepted: Vec<ValidatedResponse>,
    pub rejected: Vec<ValidationRejection>,
}

/// Structural problems with the survey definition itself; these fail the job without retry.
pub fn check_survey_schema(survey: &Survey) -> Result<(), PipelineError> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for question in &survey.questions {
        if question.id.trim().is_empty() {
            problems.push("question with empty id".to_string());
        }
        if !seen.insert(question.id.as_str()) {
            problems.push(format!("duplicate question id {}", question.id));
        }
        match &question.kind {
            QuestionKind::Numeric {
                min: Some(min),
                max: Some(max),
            } if min > max => {
                problems.push(format!("{}: min {min} exceeds max {max}", question.id));
            }
            QuestionKind::Categorical { options } | QuestionKind::MultiSelect { options, .. }
                if options.iter().all(|o| o.trim().is_empty()) =>
            {
                problems.push(format!("{}: choice question without options", question.id));
            }
            QuestionKind::MultiSelect {
                max_selections: Some(0),
                ..
            } => {
                problems.push(format!("{}: max_selections must be positive", question.id));
            }
            _ => {}
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InvalidSchema {
            survey_id: survey.id,
            problems,
        })
    }
}

/// Validates one response against its survey, coercing answers to canonical form.
///
/// Answers for question ids the survey does not define are dropped with a warning.
pub fn validate_response(
    survey: &Survey,
    response: &Response,
) -> Result<ValidatedResponse, ValidationRejection> {
    let mut answers = BTreeMap::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for question_id in response.answers.keys() {
        if survey.question(question_id).is_none() {
            tracing::warn!(
                response_id = %response.id,
                question_id = %question_id,
                "dropping answer for unknown question"
            );
            warnings.push(format!("unknown question {question_id} dropped"));
        }
    }

    for question in &survey.questions {
        let raw = response.answers.get(&question.id).filter(|v| !v.is_null());
        match raw.map(|value| coerce_answer(question, value)) {
            None | Some(Ok(None)) => {
                if question.required {
                    errors.push(AnswerError::MissingRequired {
                        question_id: question.id.clone(),
                    });
                }
            }
            Some(Ok(Some(answer))) => {
                answers.insert(question.id.clone(), answer);
            }
            Some(Err(err)) => errors.push(err),
        }
    }

    if !errors.is_empty() {
        return Err(ValidationRejection {
            response_id: response.id,
            errors,
        });
    }

    Ok(ValidatedResponse {
        id: response.id,
        survey_id: response.survey_id,
        company_id: response.company_id,
        submitted_at: response.submitted_at,
        answers,
        warnings,
    })
}

/// Validates a whole batch under a tenant context.
///
/// Responses owned by another company or survey abort the batch; malformed answers only
/// reject the individual response.
pub fn validate_batch(
    tenant: &TenantContext,
    survey: &Survey,
    responses: &[Response],
) -> Result<ValidatedBatch, PipelineError> {
    tenant.ensure_owns(survey.company_id, "survey")?;
    check_survey_schema(survey)?;

    let mut batch = ValidatedBatch::default();
    for response in responses {
        tenant.ensure_owns(response.company_id, "response")?;
        if response.survey_id != survey.id {
            return Err(PipelineError::CorruptRecord(format!(
                "response {} belongs to survey {}, expected {}",
                response.id, response.survey_id, survey.id
            )));
        }
        match validate_response(survey, response) {
            Ok(accepted) => batch.accepted.push(accepted),
            Err(rejection) => batch.rejected.push(rejection),
        }
    }
    Ok(batch)
}

fn coerce_answer(question: &Question, raw: &Value) -> Result<Option<Answer>, AnswerError> {
    let question_id = &question.id;
    let mismatch = |expected: &str| AnswerError::TypeMismatch {
        question_id: question_id.clone(),
        expected: expected.to_string(),
        found: json_type_name(raw).to_string(),
    };

    match &question.kind {
        QuestionKind::Numeric { min, max } => {
            let value = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) if s.trim().is_empty() => return Ok(None),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            let Some(value) = value.filter(|v| v.is_finite()) else {
                return Err(mismatch("number"));
            };
            if min.is_some_and(|min| value < min) || max.is_some_and(|max| value > max) {
                return Err(AnswerError::OutOfRange {
                    question_id: question_id.clone(),
                    detail: format!(
                        "{value} outside [{}, {}]",
                        min.map_or("-inf".to_string(), |v| v.to_string()),
                        max.map_or("inf".to_string(), |v| v.to_string())
                    ),
                });
            }
            Ok(Some(Answer::Numeric(value)))
        }
        QuestionKind::Categorical { options } => {
            let candidate = match raw {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return Err(mismatch("string")),
            };
            if candidate.is_empty() {
                return Ok(None);
            }
            match_option(question_id, options, &candidate).map(|o| Some(Answer::Categorical(o)))
        }
        QuestionKind::MultiSelect {
            options,
            max_selections,
        } => {
            let items: Vec<String> = match raw {
                Value::String(s) => vec![s.trim().to_string()],
                Value::Array(values) => {
                    let mut items = Vec::with_capacity(values.len());
                    for value in values {
                        match value {
                            Value::String(s) => items.push(s.trim().to_string()),
                            _ => return Err(mismatch("array of strings")),
                        }
                    }
                    items
                }
                _ => return Err(mismatch("array of strings")),
            };
            let mut selected = Vec::with_capacity(items.len());
            for item in items.iter().filter(|item| !item.is_empty()) {
                selected.push(match_option(question_id, options, item)?);
            }
            selected.sort();
            selected.dedup();
            if selected.is_empty() {
                return Ok(None);
            }
            if let Some(limit) = max_selections {
                if selected.len() > *limit {
                    return Err(AnswerError::OutOfRange {
                        question_id: question_id.clone(),
                        detail: format!("{} selections exceed limit {limit}", selected.len()),
                    });
                }
            }
            Ok(Some(Answer::MultiSelect(selected)))
        }
        QuestionKind::FreeText => match raw {
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => Ok(Some(Answer::FreeText(s.clone()))),
            _ => Err(mismatch("string")),
        },
    }
}

fn match_option(question_id: &str, options: &[String], candidate: &str) -> Result<String, AnswerError> {
    options
        .iter()
        .find(|option| option.trim().eq_ignore_ascii_case(candidate))
        .map(|option| option.trim().to_string())
        .ok_or_else(|| AnswerError::OutOfRange {
            question_id: question_id.to_string(),
            detail: format!("'{candidate}' is not an allowed option"),
        })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
