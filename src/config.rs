use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::analysis::jobs::RetryPolicy;

const ENV_PREFIX: &str = "SURVEY_ANALYSIS_";

/// Thresholds for the analysis stages. Defaults are engineering choices, all overridable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub cleaning_sigma: f64,
    pub cleaning_min_batch: usize,
    pub min_text_length: usize,
    pub aggregate_min_samples: u64,
    pub top_k_tokens: usize,
    pub trend_significance_pct: f64,
    pub trend_history_windows: usize,
    pub trend_min_prior_samples: u64,
    pub anomaly_z_threshold: f64,
    pub anomaly_band_k: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            cleaning_sigma: 3.0,
            cleaning_min_batch: 30,
            min_text_length: 3,
            aggregate_min_samples: 5,
            top_k_tokens: 50,
            trend_significance_pct: 15.0,
            trend_history_windows: 4,
            trend_min_prior_samples: 10,
            anomaly_z_threshold: 3.0,
            anomaly_band_k: 2.5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    #[serde(skip)]
    pub database_url: Option<String>,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub storage_timeout_ms: u64,
    pub job_time_budget_seconds: u64,
    pub visibility_timeout_seconds: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
    pub analysis: AnalysisSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_count: 2,
            poll_interval_ms: 500,
            storage_timeout_ms: 10_000,
            job_time_budget_seconds: 300,
            visibility_timeout_seconds: 360,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            backoff_jitter: 0.2,
            analysis: AnalysisSettings::default(),
        }
    }
}

/// Optional JSON settings file; any key left out falls through to env/defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SettingsOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    worker_count: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    storage_timeout_ms: Option<u64>,
    #[serde(default)]
    job_time_budget_seconds: Option<u64>,
    #[serde(default)]
    visibility_timeout_seconds: Option<u64>,
    #[serde(default)]
    max_attempts: Option<u64>,
    #[serde(default)]
    backoff_base_ms: Option<u64>,
    #[serde(default)]
    backoff_cap_ms: Option<u64>,
    #[serde(default)]
    backoff_jitter: Option<f64>,
    #[serde(default)]
    cleaning_sigma: Option<f64>,
    #[serde(default)]
    cleaning_min_batch: Option<u64>,
    #[serde(default)]
    min_text_length: Option<u64>,
    #[serde(default)]
    aggregate_min_samples: Option<u64>,
    #[serde(default)]
    top_k_tokens: Option<u64>,
    #[serde(default)]
    trend_significance_pct: Option<f64>,
    #[serde(default)]
    trend_history_windows: Option<u64>,
    #[serde(default)]
    trend_min_prior_samples: Option<u64>,
    #[serde(default)]
    anomaly_z_threshold: Option<f64>,
    #[serde(default)]
    anomaly_band_k: Option<f64>,
}

fn settings_path(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup(&format!("{ENV_PREFIX}CONFIG_PATH"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn load_settings_file(path: &Path) -> Option<SettingsOverrides> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "settings file not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read settings file; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse settings file; using env defaults"
            );
            None
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let file = settings_path(&lookup).and_then(|path| load_settings_file(&path));
        Ok(Self::from_sources(&lookup, file.unwrap_or_default()))
    }

    pub(crate) fn from_sources(
        lookup: &dyn Fn(&str) -> Option<String>,
        file: SettingsOverrides,
    ) -> Self {
        let env = Env { lookup };
        let defaults = EngineConfig::default();
        let analysis_defaults = AnalysisSettings::default();

        let database_url = env.string("DATABASE_URL").or_else(|| {
            file.database_url
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        });

        let worker_count = env
            .u64("WORKER_COUNT")
            .or(file.worker_count)
            .unwrap_or(defaults.worker_count as u64)
            .clamp(1, 64) as usize;
        let poll_interval_ms = env
            .u64("POLL_INTERVAL_MS")
            .or(file.poll_interval_ms)
            .unwrap_or(defaults.poll_interval_ms)
            .clamp(10, 60_000);
        let storage_timeout_ms = env
            .u64("STORAGE_TIMEOUT_MS")
            .or(file.storage_timeout_ms)
            .unwrap_or(defaults.storage_timeout_ms)
            .clamp(100, 300_000);
        let job_time_budget_seconds = env
            .u64("JOB_TIME_BUDGET_SECONDS")
            .or(file.job_time_budget_seconds)
            .unwrap_or(defaults.job_time_budget_seconds)
            .clamp(1, 24 * 3600);
        // A lease shorter than the job budget would let a healthy job be reclaimed mid-run.
        let visibility_timeout_seconds = env
            .u64("VISIBILITY_TIMEOUT_SECONDS")
            .or(file.visibility_timeout_seconds)
            .unwrap_or(job_time_budget_seconds + 60)
            .max(job_time_budget_seconds + 1);
        let max_attempts = env
            .u64("MAX_ATTEMPTS")
            .or(file.max_attempts)
            .unwrap_or(defaults.max_attempts as u64)
            .clamp(1, 50) as u32;
        let backoff_base_ms = env
            .u64("BACKOFF_BASE_MS")
            .or(file.backoff_base_ms)
            .unwrap_or(defaults.backoff_base_ms)
            .min(3_600_000);
        let backoff_cap_ms = env
            .u64("BACKOFF_CAP_MS")
            .or(file.backoff_cap_ms)
            .unwrap_or(defaults.backoff_cap_ms)
            .max(backoff_base_ms);
        let backoff_jitter = env
            .f64("BACKOFF_JITTER")
            .or(file.backoff_jitter)
            .unwrap_or(defaults.backoff_jitter)
            .clamp(0.0, 1.0);

        let analysis = AnalysisSettings {
            cleaning_sigma: env
                .f64("CLEANING_SIGMA")
                .or(file.cleaning_sigma)
                .unwrap_or(analysis_defaults.cleaning_sigma)
                .clamp(0.5, 20.0),
            cleaning_min_batch: env
                .u64("CLEANING_MIN_BATCH")
                .or(file.cleaning_min_batch)
                .unwrap_or(analysis_defaults.cleaning_min_batch as u64)
                .clamp(3, 1_000_000) as usize,
            min_text_length: env
                .u64("MIN_TEXT_LENGTH")
                .or(file.min_text_length)
                .unwrap_or(analysis_defaults.min_text_length as u64)
                .min(10_000) as usize,
            aggregate_min_samples: env
                .u64("AGGREGATE_MIN_SAMPLES")
                .or(file.aggregate_min_samples)
                .unwrap_or(analysis_defaults.aggregate_min_samples)
                .clamp(1, 1_000_000),
            top_k_tokens: env
                .u64("TOP_K_TOKENS")
                .or(file.top_k_tokens)
                .unwrap_or(analysis_defaults.top_k_tokens as u64)
                .clamp(1, 10_000) as usize,
            trend_significance_pct: env
                .f64("TREND_SIGNIFICANCE_PCT")
                .or(file.trend_significance_pct)
                .unwrap_or(analysis_defaults.trend_significance_pct)
                .clamp(0.1, 1_000.0),
            trend_history_windows: env
                .u64("TREND_HISTORY_WINDOWS")
                .or(file.trend_history_windows)
                .unwrap_or(analysis_defaults.trend_history_windows as u64)
                .clamp(2, 104) as usize,
            trend_min_prior_samples: env
                .u64("TREND_MIN_PRIOR_SAMPLES")
                .or(file.trend_min_prior_samples)
                .unwrap_or(analysis_defaults.trend_min_prior_samples)
                .min(1_000_000),
            anomaly_z_threshold: env
                .f64("ANOMALY_Z_THRESHOLD")
                .or(file.anomaly_z_threshold)
                .unwrap_or(analysis_defaults.anomaly_z_threshold)
                .clamp(0.5, 50.0),
            anomaly_band_k: env
                .f64("ANOMALY_BAND_K")
                .or(file.anomaly_band_k)
                .unwrap_or(analysis_defaults.anomaly_band_k)
                .clamp(0.5, 50.0),
        };

        Self {
            database_url,
            worker_count,
            poll_interval_ms,
            storage_timeout_ms,
            job_time_budget_seconds,
            visibility_timeout_seconds,
            max_attempts,
            backoff_base_ms,
            backoff_cap_ms,
            backoff_jitter,
            analysis,
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("SURVEY_ANALYSIS_DATABASE_URL must be set (or database_url in the settings file)")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn job_time_budget(&self) -> Duration {
        Duration::from_secs(self.job_time_budget_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_cap_ms),
            jitter: self.backoff_jitter,
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn u64(&self, suffix: &str) -> Option<u64> {
        self.string(suffix)
            .and_then(|value| value.parse::<u64>().ok())
    }

    fn f64(&self, suffix: &str) -> Option<f64> {
        self.string(suffix)
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_documented_values() {
        let lookup = lookup_from(&[]);
        let config = EngineConfig::from_sources(&lookup, SettingsOverrides::default());
        assert_eq!(config.analysis, AnalysisSettings::default());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.job_time_budget(), Duration::from_secs(300));
        assert_eq!(config.visibility_timeout(), Duration::from_secs(360));
        assert!(config.database_url.is_none());
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn env_values_are_trimmed_clamped_and_bad_values_ignored() {
        let lookup = lookup_from(&[
            ("WORKER_COUNT", " 500 "),
            ("CLEANING_SIGMA", "not-a-number"),
            ("ANOMALY_Z_THRESHOLD", "4.5"),
            ("BACKOFF_JITTER", "NaN"),
            ("DATABASE_URL", "  "),
        ]);
        let config = EngineConfig::from_sources(&lookup, SettingsOverrides::default());
        assert_eq!(config.worker_count, 64);
        assert_eq!(config.analysis.cleaning_sigma, 3.0);
        assert_eq!(config.analysis.anomaly_z_threshold, 4.5);
        assert_eq!(config.backoff_jitter, 0.2);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn visibility_timeout_never_undercuts_job_budget() {
        let lookup = lookup_from(&[
            ("JOB_TIME_BUDGET_SECONDS", "120"),
            ("VISIBILITY_TIMEOUT_SECONDS", "30"),
        ]);
        let config = EngineConfig::from_sources(&lookup, SettingsOverrides::default());
        assert!(config.visibility_timeout() > config.job_time_budget());
    }

    #[test]
    fn settings_file_fills_gaps_and_env_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "trend_significance_pct": 20.0, "top_k_tokens": 10, "max_attempts": 3 }"#,
        )?;
        let file = load_settings_file(&path).expect("settings parsed");
        let lookup = lookup_from(&[("MAX_ATTEMPTS", "7")]);
        let config = EngineConfig::from_sources(&lookup, file);
        assert_eq!(config.analysis.trend_significance_pct, 20.0);
        assert_eq!(config.analysis.top_k_tokens, 10);
        assert_eq!(config.max_attempts, 7);
        Ok(())
    }

    #[test]
    fn unreadable_settings_file_is_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json")?;
        assert!(load_settings_file(&path).is_none());
        assert!(load_settings_file(&dir.path().join("missing.json")).is_none());
        Ok(())
    }
}
