use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{Answer, Company, Question, QuestionKind, Response, Survey, ValidatedResponse, Window};
use crate::error::StoreError;
use crate::ids::{idempotency_key, CompanyId, JobId, ResponseId, SurveyId};
use crate::services::analysis::jobs::memory::MemoryStore;
use crate::services::analysis::jobs::store::{CompletionNotifier, ResponseSource};
use crate::services::analysis::jobs::{AnalysisJob, CompletionEvent, JobStatus};
use crate::services::analysis::results::{AnalysisResult, BatchSummary};
use crate::services::analysis::validator::validate_response;
use crate::tenant::TenantContext;

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// One-day window, `day` days after the fixture epoch.
pub fn window_at(day: i64) -> Window {
    let start = epoch() + ChronoDuration::days(day);
    Window::new(start, start + ChronoDuration::days(1)).expect("fixture window")
}

pub fn company(n: u32) -> Company {
    Company {
        id: CompanyId(Uuid::from_u128(0xC0_0000_0000 + n as u128)),
        active: true,
    }
}

pub fn survey_fixture() -> (TenantContext, Survey) {
    survey_fixture_for(1)
}

pub fn survey_fixture_for(n: u32) -> (TenantContext, Survey) {
    let owner = company(n);
    let tenant = TenantContext::for_company(&owner).expect("active fixture company");
    let survey = Survey {
        id: SurveyId(Uuid::from_u128(0x5A_0000_0000 + n as u128)),
        company_id: owner.id,
        active: true,
        questions: vec![
            Question {
                id: "satisfaction".to_string(),
                kind: QuestionKind::Numeric {
                    min: Some(0.0),
                    max: Some(10.0),
                },
                required: true,
            },
            Question {
                id: "plan".to_string(),
                kind: QuestionKind::Categorical {
                    options: vec!["free".into(), "pro".into(), "enterprise".into()],
                },
                required: false,
            },
            Question {
                id: "features".to_string(),
                kind: QuestionKind::MultiSelect {
                    options: vec!["export".into(), "alerts".into(), "api".into()],
                    max_selections: None,
                },
                required: false,
            },
            Question {
                id: "comment".to_string(),
                kind: QuestionKind::FreeText,
                required: false,
            },
        ],
    };
    (tenant, survey)
}

fn response_id(survey: &Survey, idx: u32) -> ResponseId {
    ResponseId(Uuid::from_u128(
        (survey.id.as_uuid().as_u128() << 32) + idx as u128,
    ))
}

/// Raw response submitted `idx` minutes into `window_at(0)`.
pub fn response(survey: &Survey, idx: u32, answers: Value) -> Response {
    response_for(survey, idx, idx as i64, answers)
}

pub fn response_for(survey: &Survey, idx: u32, minute: i64, answers: Value) -> Response {
    let answers: BTreeMap<String, Value> = match answers {
        Value::Object(map) => map.into_iter().collect(),
        other => panic!("fixture answers must be an object, got {other}"),
    };
    Response {
        id: response_id(survey, idx),
        survey_id: survey.id,
        company_id: survey.company_id,
        submitted_at: window_at(0).start + ChronoDuration::minutes(minute),
        answers,
    }
}

pub fn validated(survey: &Survey, idx: u32, answers: Value) -> ValidatedResponse {
    validate_response(survey, &response(survey, idx, answers)).expect("fixture must validate")
}

/// Validated responses answering only `satisfaction`; bounds are not checked.
pub fn numeric_batch(survey: &Survey, values: &[f64]) -> Vec<ValidatedResponse> {
    values
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            let idx = idx as u32;
            let mut answers = BTreeMap::new();
            answers.insert("satisfaction".to_string(), Answer::Numeric(*value));
            ValidatedResponse {
                id: response_id(survey, idx),
                survey_id: survey.id,
                company_id: survey.company_id,
                submitted_at: window_at(0).start + ChronoDuration::minutes(idx as i64),
                answers,
                warnings: Vec::new(),
            }
        })
        .collect()
}

pub fn queued_job(survey: &Survey, window: Window) -> AnalysisJob {
    let now = window.end;
    AnalysisJob {
        id: JobId::new_v4(),
        company_id: survey.company_id,
        survey_id: survey.id,
        window,
        idempotency_key: idempotency_key(survey.company_id, survey.id, &window),
        status: JobStatus::Queued,
        attempts: 0,
        claim_token: None,
        worker_id: None,
        lease_expires_at: None,
        not_before: now,
        cancel_requested_at: None,
        last_error: None,
        partial: false,
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

pub fn analysis_result(
    tenant: &TenantContext,
    survey: &Survey,
    window: Window,
    job_id: JobId,
    job_started_at: DateTime<Utc>,
) -> AnalysisResult {
    AnalysisResult {
        company_id: tenant.company_id(),
        survey_id: survey.id,
        window,
        idempotency_key: idempotency_key(tenant.company_id(), survey.id, &window),
        job_id,
        job_started_at,
        computed_at: job_started_at,
        partial: false,
        batch: BatchSummary::default(),
        rejections: Vec::new(),
        exclusions: Vec::new(),
        aggregates: Default::default(),
        trends: Default::default(),
        anomalies: Vec::new(),
    }
}

/// Memory store holding the default fixture company, survey and `n` valid responses in
/// `window_at(0)`.
pub async fn seeded_store(n: u32) -> (Arc<MemoryStore>, TenantContext, Survey) {
    let (tenant, survey) = survey_fixture();
    let store = Arc::new(MemoryStore::new());
    store.insert_company(company(1)).await;
    store.insert_survey(survey.clone()).await;
    store
        .insert_responses((0..n).map(|i| {
            let plan = if i % 3 == 0 { "pro" } else { "free" };
            response(
                &survey,
                i,
                serde_json::json!({
                    "satisfaction": 3 + (i % 5),
                    "plan": plan,
                    "comment": "export is handy",
                }),
            )
        }))
        .await;
    (store, tenant, survey)
}

/// Fails the first `failures` response reads with `storage_unavailable`, optionally
/// sleeping before every read.
pub struct FlakyResponseSource {
    inner: Arc<dyn ResponseSource>,
    failures_left: AtomicU32,
    delay: Option<Duration>,
}

impl FlakyResponseSource {
    pub fn new(inner: Arc<dyn ResponseSource>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ResponseSource for FlakyResponseSource {
    async fn load_company(&self, company_id: CompanyId) -> Result<Option<Company>, StoreError> {
        self.inner.load_company(company_id).await
    }

    async fn load_survey(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
    ) -> Result<Option<Survey>, StoreError> {
        self.inner.load_survey(tenant, survey_id).await
    }

    async fn read_responses(
        &self,
        tenant: &TenantContext,
        survey_id: SurveyId,
        window: &Window,
    ) -> Result<Vec<Response>, StoreError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        self.inner.read_responses(tenant, survey_id, window).await
    }
}

/// Notifier that rejects its first `failures` deliveries, then forwards.
pub struct FlakyNotifier {
    inner: Arc<dyn CompletionNotifier>,
    failures_left: AtomicU32,
}

impl FlakyNotifier {
    pub fn new(inner: Arc<dyn CompletionNotifier>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl CompletionNotifier for FlakyNotifier {
    async fn on_job_completed(&self, event: &CompletionEvent) -> Result<(), StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected delivery failure".to_string()));
        }
        self.inner.on_job_completed(event).await
    }
}
