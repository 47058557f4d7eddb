use crate::{AnalysisConfig, ConfigError};
use serde::{Deserialize, Serialize};

/// Named bundle of adjustments applied on top of the built-in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Development,
    /// Stricter statistics, more SQL retries.
    Production,
    /// Small and fast: short windows, tiny samples.
    Testing,
    /// One week of data.
    Demo,
}

impl Profile {
    pub(crate) fn apply(self, config: &mut AnalysisConfig) {
        match self {
            Self::Development => {}
            Self::Production => {
                config.statistical.alpha = 0.01;
                config.statistical.power = 0.9;
                config.statistical.min_sample_size = 1000;
                config.processing.sql_retry_limit = 10;
                config.processing.analysis_plan = true;
            }
            Self::Testing => {
                config.date_range.short_range_days = 3;
                config.processing.refinement_rounds = 1;
                config.statistical.min_sample_size = 10;
            }
            Self::Demo => {
                config.date_range.start_date = "20201101".to_string();
                config.date_range.end_date = "20201107".to_string();
                config.date_range.short_range_days = 3;
                config.processing.refinement_rounds = 1;
            }
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "testing" | "test" => Ok(Self::Testing),
            "demo" => Ok(Self::Demo),
            other => Err(ConfigError::Invalid(format!(
                "unknown profile {other:?} (expected development|production|testing|demo)"
            ))),
        }
    }
}
