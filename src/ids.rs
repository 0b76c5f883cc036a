use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::domain::Window;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_newtype!(CompanyId);
uuid_newtype!(SurveyId);
uuid_newtype!(ResponseId);
uuid_newtype!(JobId);

/// Namespace for result record ids (`Uuid::new_v5`).
const RESULT_RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b0a_8e55_1f0c_7d2b_9a31);

fn stable_hex_id(namespace: &str, key: &str, len: usize) -> String {
    let payload = [namespace.trim(), key.trim()].join("|");
    let digest = Sha256::digest(payload.as_bytes());
    let hex = format!("{digest:x}");
    hex.chars().take(len).collect()
}

/// Deterministic key collapsing duplicate submissions for the same
/// (company, survey, window) into one logical unit of work.
pub fn idempotency_key(company_id: CompanyId, survey_id: SurveyId, window: &Window) -> String {
    let key = format!(
        "{}|{}|{}|{}",
        company_id,
        survey_id,
        window.start.timestamp_micros(),
        window.end.timestamp_micros()
    );
    stable_hex_id("analysis_job", &key, 32)
}

pub fn result_record_id(idempotency_key: &str, job_id: JobId) -> Uuid {
    let name = format!("{idempotency_key}|{job_id}");
    Uuid::new_v5(&RESULT_RECORD_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window(day: u32) -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, day + 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn idempotency_key_is_stable_and_scoped() {
        let company = CompanyId(Uuid::from_u128(1));
        let other_company = CompanyId(Uuid::from_u128(2));
        let survey = SurveyId(Uuid::from_u128(10));

        let a = idempotency_key(company, survey, &window(1));
        let b = idempotency_key(company, survey, &window(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, idempotency_key(other_company, survey, &window(1)));
        assert_ne!(a, idempotency_key(company, survey, &window(2)));
    }

    #[test]
    fn result_record_id_depends_on_job() {
        let key = "abc";
        let first = result_record_id(key, JobId(Uuid::from_u128(1)));
        assert_eq!(first, result_record_id(key, JobId(Uuid::from_u128(1))));
        assert_ne!(first, result_record_id(key, JobId(Uuid::from_u128(2))));
    }
}
