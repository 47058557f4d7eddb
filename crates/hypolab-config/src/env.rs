//! Environment layer.
//!
//! Environment variables are turned into a [`ConfigOverrides`] so they merge
//! with exactly the same rules as explicit overrides. Empty values count as
//! unset; malformed values are fatal.

use crate::overrides::{
    ConfigOverrides, DateRangeOverrides, LlmOverrides, OutputOverrides, ProcessingOverrides,
    StatisticalOverrides, TableOverrides,
};
use crate::{ConfigError, Profile};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;

pub const GCP_PROJECT_ID_ENV: &str = "GCP_PROJECT_ID";
pub const GCP_DATASET_ID_ENV: &str = "GCP_DATASET_ID";
pub const TABLE_PATTERN_ENV: &str = "HYPOLAB_TABLE_PATTERN";
pub const PUBLIC_DATASET_PROJECT_ENV: &str = "HYPOLAB_PUBLIC_DATASET_PROJECT";
pub const START_DATE_ENV: &str = "HYPOLAB_START_DATE";
pub const END_DATE_ENV: &str = "HYPOLAB_END_DATE";
pub const ALPHA_ENV: &str = "HYPOLAB_ALPHA";
pub const MIN_EFFECT_SIZE_ENV: &str = "HYPOLAB_MIN_EFFECT_SIZE";
pub const MIN_SAMPLE_SIZE_ENV: &str = "HYPOLAB_MIN_SAMPLE_SIZE";
pub const SQL_RETRIES_ENV: &str = "MAX_RETRIES";
pub const ANALYSIS_RETRIES_ENV: &str = "HYPOLAB_ANALYSIS_RETRIES";
pub const MAX_CONCURRENCY_ENV: &str = "HYPOLAB_MAX_CONCURRENCY";
pub const REQUEST_TIMEOUT_ENV: &str = "REQUEST_TIMEOUT";
pub const ANALYSIS_PLAN_ENV: &str = "HYPOLAB_ANALYSIS_PLAN";
pub const REQUEST_INTERVAL_ENV: &str = "HYPOLAB_REQUEST_INTERVAL_MS";
pub const OUTPUT_DIR_ENV: &str = "HYPOLAB_OUTPUT_DIR";
pub const DATA_DIR_ENV: &str = "HYPOLAB_DATA_DIR";
pub const PROFILE_ENV: &str = "HYPOLAB_PROFILE";
pub const LLM_MODEL_ENV: &str = "HYPOLAB_LLM_MODEL";

/// Source of environment variables.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

fn string_var(env: &dyn EnvSource, name: &str) -> Option<String> {
    env.var(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: FromStr>(
    env: &dyn EnvSource,
    name: &str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match string_var(env, name) {
        None => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: v,
            expected,
        }),
    }
}

/// Read every recognised variable into an overrides layer.
pub fn overrides_from_env(env: &dyn EnvSource) -> Result<ConfigOverrides, ConfigError> {
    let profile = match string_var(env, PROFILE_ENV) {
        Some(v) => Some(v.parse::<Profile>()?),
        None => None,
    };

    let public_dataset_project = string_var(env, PUBLIC_DATASET_PROJECT_ENV).map(|v| {
        if v.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(v)
        }
    });

    Ok(ConfigOverrides {
        profile,
        date_range: DateRangeOverrides {
            start_date: string_var(env, START_DATE_ENV),
            end_date: string_var(env, END_DATE_ENV),
            short_range_days: None,
        },
        table: TableOverrides {
            project_id: string_var(env, GCP_PROJECT_ID_ENV),
            dataset_id: string_var(env, GCP_DATASET_ID_ENV),
            table_pattern: string_var(env, TABLE_PATTERN_ENV),
            public_dataset_project,
        },
        statistical: StatisticalOverrides {
            alpha: parsed_var(env, ALPHA_ENV, "float in (0, 1)")?,
            min_effect_size: parsed_var(env, MIN_EFFECT_SIZE_ENV, "non-negative float")?,
            min_sample_size: parsed_var(env, MIN_SAMPLE_SIZE_ENV, "integer")?,
            ..Default::default()
        },
        processing: ProcessingOverrides {
            sql_retry_limit: parsed_var(env, SQL_RETRIES_ENV, "integer retry ceiling")?,
            analysis_retry_limit: parsed_var(env, ANALYSIS_RETRIES_ENV, "integer retry ceiling")?,
            max_concurrent_requests: parsed_var(env, MAX_CONCURRENCY_ENV, "integer")?,
            request_timeout_secs: parsed_var(env, REQUEST_TIMEOUT_ENV, "integer seconds")?,
            analysis_plan: parsed_var(env, ANALYSIS_PLAN_ENV, "true or false")?,
            min_request_interval_ms: parsed_var(env, REQUEST_INTERVAL_ENV, "integer milliseconds")?,
            ..Default::default()
        },
        output: OutputOverrides {
            base_dir: string_var(env, OUTPUT_DIR_ENV).map(PathBuf::from),
            data_dir: string_var(env, DATA_DIR_ENV).map(PathBuf::from),
            ..Default::default()
        },
        llm: LlmOverrides {
            model: string_var(env, LLM_MODEL_ENV),
            ..Default::default()
        },
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_values_are_unset() {
        let overrides = overrides_from_env(&env(&[(ALPHA_ENV, "  "), (GCP_PROJECT_ID_ENV, "")]))
            .unwrap();
        assert_eq!(overrides.statistical.alpha, None);
        assert_eq!(overrides.table.project_id, None);
    }

    #[test]
    fn malformed_numbers_are_fatal() {
        let err = overrides_from_env(&env(&[(SQL_RETRIES_ENV, "three")])).unwrap_err();
        match err {
            ConfigError::InvalidEnv { name, value, .. } => {
                assert_eq!(name, SQL_RETRIES_ENV);
                assert_eq!(value, "three");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reads_known_variables() {
        let overrides = overrides_from_env(&env(&[
            (GCP_PROJECT_ID_ENV, "proj"),
            (SQL_RETRIES_ENV, "3"),
            (PROFILE_ENV, "production"),
            (PUBLIC_DATASET_PROJECT_ENV, "none"),
            (OUTPUT_DIR_ENV, "/var/hypolab"),
        ]))
        .unwrap();
        assert_eq!(overrides.table.project_id.as_deref(), Some("proj"));
        assert_eq!(overrides.processing.sql_retry_limit, Some(3));
        assert_eq!(overrides.profile, Some(Profile::Production));
        assert_eq!(overrides.table.public_dataset_project, Some(None));
        assert_eq!(overrides.output.base_dir, Some(PathBuf::from("/var/hypolab")));
    }
}
