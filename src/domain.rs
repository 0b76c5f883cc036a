use crate::ids::{CompanyId, ResponseId, SurveyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Half-open `[start, end)`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, String> {
        if end <= start {
            return Err(format!(
                "window end ({}) must be after start ({})",
                end.to_rfc3339(),
                start.to_rfc3339()
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    Numeric {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Categorical {
        options: Vec<String>,
    },
    MultiSelect {
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_selections: Option<usize>,
    },
    FreeText,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::Numeric { .. } => "numeric",
            QuestionKind::Categorical { .. } => "categorical",
            QuestionKind::MultiSelect { .. } => "multi_select",
            QuestionKind::FreeText => "free_text",
        }
    }

    pub fn options(&self) -> Option<&[String]> {
        match self {
            QuestionKind::Categorical { options } | QuestionKind::MultiSelect { options, .. } => {
                Some(options)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub id: SurveyId,
    pub company_id: CompanyId,
    pub questions: Vec<Question>,
    pub active: bool,
}

impl Survey {
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

/// A submitted response as stored; answers are the raw JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: ResponseId,
    pub survey_id: SurveyId,
    pub company_id: CompanyId,
    pub submitted_at: DateTime<Utc>,
    pub answers: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Answer {
    Numeric(f64),
    Categorical(String),
    MultiSelect(Vec<String>),
    FreeText(String),
}

impl Answer {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Answer::Numeric(value) => Some(*value),
            _ => None,
        }
    }
}

/// A response whose answers passed schema validation and were coerced to canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedResponse {
    pub id: ResponseId,
    pub survey_id: SurveyId,
    pub company_id: CompanyId,
    pub submitted_at: DateTime<Utc>,
    pub answers: BTreeMap<String, Answer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}
