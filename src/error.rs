use crate::ids::{CompanyId, SurveyId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse error family; the orchestrator decides retry vs. terminal failure from this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    TransientInfra,
    Computation,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    StorageTimeout,
    StorageUnavailable,
    LockContention,
    JobTimeout,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::StorageTimeout => "storage_timeout",
            TransientKind::StorageUnavailable => "storage_unavailable",
            TransientKind::LockContention => "lock_contention",
            TransientKind::JobTimeout => "job_timeout",
        }
    }
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("company {0} not found")]
    CompanyNotFound(CompanyId),
    #[error("company {0} is inactive")]
    CompanyInactive(CompanyId),
    #[error("survey {0} not found")]
    SurveyNotFound(SurveyId),
    #[error("survey {0} is inactive")]
    SurveyInactive(SurveyId),
    #[error("invalid schema for survey {survey_id}: {}", .problems.join("; "))]
    InvalidSchema {
        survey_id: SurveyId,
        problems: Vec<String>,
    },
    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),
    #[error("{entity} owned by company {found} accessed under company {expected}")]
    TenantIsolation {
        expected: CompanyId,
        found: CompanyId,
        entity: &'static str,
    },
    #[error("{kind}: {message}")]
    Transient { kind: TransientKind, message: String },
    #[error("computation error in {stage}: {message}")]
    Computation {
        stage: &'static str,
        message: String,
    },
    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn computation(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Computation {
            stage,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Transient { .. } => ErrorClass::TransientInfra,
            PipelineError::Computation { .. } => ErrorClass::Computation,
            PipelineError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientInfra
    }

    /// Stable code surfaced on failed jobs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::CompanyNotFound(_) => "company_not_found",
            PipelineError::CompanyInactive(_) => "company_inactive",
            PipelineError::SurveyNotFound(_) => "survey_not_found",
            PipelineError::SurveyInactive(_) => "survey_inactive",
            PipelineError::InvalidSchema { .. } => "invalid_survey_schema",
            PipelineError::CorruptRecord(_) => "corrupt_record",
            PipelineError::TenantIsolation { .. } => "tenant_isolation_violation",
            PipelineError::Transient { kind, .. } => kind.as_str(),
            PipelineError::Computation { .. } => "computation_error",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

/// Not enough data points for a section; the section is reported absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("data insufficient: {available} of {required} required samples")]
pub struct DataInsufficient {
    pub available: u64,
    pub required: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("lock contention: {0}")]
    Contention(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(elapsed) => PipelineError::transient(
                TransientKind::StorageTimeout,
                format!("timed out after {} ms", elapsed.as_millis()),
            ),
            StoreError::Contention(message) => {
                PipelineError::transient(TransientKind::LockContention, message)
            }
            StoreError::Unavailable(message) => {
                PipelineError::transient(TransientKind::StorageUnavailable, message)
            }
            StoreError::Corrupt(message) => PipelineError::CorruptRecord(message),
            StoreError::Database(db_err) => classify_sqlx(db_err),
        }
    }
}

fn classify_sqlx(err: sqlx::Error) -> PipelineError {
    match &err {
        sqlx::Error::PoolTimedOut => {
            PipelineError::transient(TransientKind::StorageTimeout, err.to_string())
        }
        sqlx::Error::Database(db) => {
            classify_sqlstate(db.code().as_deref().unwrap_or(""), err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            PipelineError::CorruptRecord(err.to_string())
        }
        _ => PipelineError::transient(TransientKind::StorageUnavailable, err.to_string()),
    }
}

/// Retrying only helps for contention and resource classes. Data exceptions (22), constraint
/// violations (23) and schema errors (42) fail the same way every time.
fn classify_sqlstate(code: &str, message: String) -> PipelineError {
    match code {
        "40001" | "40P01" | "55P03" => PipelineError::transient(TransientKind::LockContention, message),
        // query_canceled, raised by statement_timeout
        "57014" => PipelineError::transient(TransientKind::StorageTimeout, message),
        _ if code.starts_with("22") || code.starts_with("23") || code.starts_with("42") => {
            PipelineError::CorruptRecord(format!("SQLSTATE {code}: {message}"))
        }
        _ => PipelineError::transient(TransientKind::StorageUnavailable, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classes_split_retryable_from_terminal() {
        for code in ["40001", "40P01", "55P03", "57014", "08006", "53300", ""] {
            let err = classify_sqlstate(code, "db".to_string());
            assert!(err.is_retryable(), "{code} should retry");
        }
        assert_eq!(classify_sqlstate("40P01", String::new()).reason_code(), "lock_contention");
        assert_eq!(classify_sqlstate("57014", String::new()).reason_code(), "storage_timeout");

        // undefined_table, invalid_text_representation, not_null_violation
        for code in ["42P01", "22P02", "23502"] {
            let err = classify_sqlstate(code, "db".to_string());
            assert!(!err.is_retryable(), "{code} should fail fast");
            assert_eq!(err.reason_code(), "corrupt_record");
            assert!(err.to_string().contains(code));
        }
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = PipelineError::transient(TransientKind::LockContention, "busy");
        assert!(transient.is_retryable());
        assert_eq!(transient.reason_code(), "lock_contention");

        let schema = PipelineError::InvalidSchema {
            survey_id: SurveyId(uuid::Uuid::nil()),
            problems: vec!["duplicate question id q1".to_string()],
        };
        assert!(!schema.is_retryable());
        assert_eq!(schema.class(), ErrorClass::Validation);

        let computation = PipelineError::computation("aggregate", "nan mean");
        assert!(!computation.is_retryable());
        assert_eq!(computation.reason_code(), "computation_error");
    }

    #[test]
    fn store_errors_map_onto_the_taxonomy() {
        let err: PipelineError = StoreError::Timeout(Duration::from_millis(250)).into();
        assert_eq!(err.reason_code(), "storage_timeout");
        assert!(err.is_retryable());

        let err: PipelineError = StoreError::Corrupt("answers column".to_string()).into();
        assert!(!err.is_retryable());

        let err: PipelineError = StoreError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(err.reason_code(), "storage_timeout");
    }
}
