//! Run configuration for hypolab.
//!
//! One immutable [`AnalysisConfig`] is resolved per run and handed to every
//! component. Resolution is layered, lowest to highest precedence:
//!
//! 1. built-in defaults
//! 2. the selected [`Profile`]
//! 3. environment variables (read through an injectable [`EnvSource`])
//! 4. explicit [`ConfigOverrides`] (CLI flags, override files)
//!
//! The derived helpers on [`AnalysisConfig`] (date filters, table references,
//! significance checks) are pure functions of the resolved values.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod env;
mod output;
mod overrides;
mod profile;

pub use env::{overrides_from_env, EnvSource, ProcessEnv};
pub use output::OutputConfig;
pub use overrides::{
    ConfigOverrides, DateRangeOverrides, DeviceOverrides, EventOverrides, LlmOverrides,
    OutputOverrides, ProcessingOverrides, ReportOverrides, SchemaOverrides, StatisticalOverrides,
    TableOverrides,
};
pub use profile::Profile;

/// Date format used by `_TABLE_SUFFIX` partitions.
pub const TABLE_SUFFIX_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}={value:?} (expected {expected})")]
    InvalidEnv {
        name: String,
        value: String,
        expected: &'static str,
    },
    #[error("invalid date for {field}: {value:?} (expected YYYYMMDD)")]
    InvalidDate { field: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing configuration: {0}")]
    Missing(&'static str),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse overrides {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Categories
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRangeConfig {
    pub start_date: String,
    pub end_date: String,
    pub short_range_days: u32,
}

impl Default for DateRangeConfig {
    fn default() -> Self {
        Self {
            start_date: "20201101".to_string(),
            end_date: "20210131".to_string(),
            short_range_days: 7,
        }
    }
}

impl DateRangeConfig {
    /// End of the short analysis window, clamped to `end_date`.
    pub fn short_end_date(&self) -> String {
        let (Ok(start), Ok(end)) = (
            parse_suffix_date("start_date", &self.start_date),
            parse_suffix_date("end_date", &self.end_date),
        ) else {
            return self.end_date.clone();
        };
        let short_end = start + chrono::Duration::days(i64::from(self.short_range_days));
        short_end
            .min(end)
            .format(TABLE_SUFFIX_DATE_FORMAT)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Billing project; queries run as jobs in this project.
    pub project_id: String,
    /// Dataset name, or `project.dataset` when the data lives elsewhere.
    pub dataset_id: String,
    pub table_pattern: String,
    pub public_dataset_project: Option<String>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: "ga4_obfuscated_sample_ecommerce".to_string(),
            table_pattern: "events_*".to_string(),
            public_dataset_project: Some("bigquery-public-data".to_string()),
        }
    }
}

impl TableConfig {
    /// Project that owns the dataset (not necessarily the billing project).
    pub fn source_project(&self) -> &str {
        if let Some(public) = self.public_dataset_project.as_deref() {
            return public;
        }
        match self.dataset_id.split_once('.') {
            Some((project, _)) => project,
            None => &self.project_id,
        }
    }

    pub fn dataset_name(&self) -> &str {
        match self.dataset_id.split_once('.') {
            Some((_, dataset)) => dataset,
            None => &self.dataset_id,
        }
    }

    pub fn full_table_reference(&self) -> String {
        format!(
            "`{}.{}.{}`",
            self.source_project(),
            self.dataset_name(),
            self.table_pattern
        )
    }

    pub fn is_public_dataset(&self) -> bool {
        self.public_dataset_project.is_some()
    }
}

/// Field names of the event table. None of these are fixed by the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaFields {
    pub user_id_field: String,
    pub event_name_field: String,
    pub device_category_field: String,
    pub geo_country_field: String,
    pub traffic_source_field: String,
    pub traffic_medium_field: String,
    pub event_timestamp_field: String,
    pub table_suffix_field: String,
}

impl Default for SchemaFields {
    fn default() -> Self {
        Self {
            user_id_field: "user_pseudo_id".to_string(),
            event_name_field: "event_name".to_string(),
            device_category_field: "device.category".to_string(),
            geo_country_field: "geo.country".to_string(),
            traffic_source_field: "traffic_source.source".to_string(),
            traffic_medium_field: "traffic_source.medium".to_string(),
            event_timestamp_field: "event_timestamp".to_string(),
            table_suffix_field: "_TABLE_SUFFIX".to_string(),
        }
    }
}

impl SchemaFields {
    pub fn purchase_event_condition(&self) -> String {
        format!("{} = 'purchase'", self.event_name_field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub categories: Vec<String>,
    pub default_control: String,
    pub default_treatment: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            categories: vec!["mobile".into(), "desktop".into(), "tablet".into()],
            default_control: "desktop".to_string(),
            default_treatment: "mobile".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub primary_events: Vec<String>,
    pub funnel_events: Vec<String>,
    pub engagement_events: Vec<String>,
}

impl Default for EventConfig {
    fn default() -> Self {
        let list = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            primary_events: list(&["purchase", "add_to_cart", "begin_checkout"]),
            funnel_events: list(&["view_item", "add_to_cart", "begin_checkout", "purchase"]),
            engagement_events: list(&["page_view", "scroll", "user_engagement", "session_start"]),
        }
    }
}

impl EventConfig {
    /// All configured event names, first occurrence order, no duplicates.
    pub fn all_events(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in self
            .primary_events
            .iter()
            .chain(&self.funnel_events)
            .chain(&self.engagement_events)
        {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalConfig {
    pub alpha: f64,
    pub power: f64,
    pub confidence_level: f64,
    pub min_effect_size: f64,
    pub min_sample_size: u64,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            power: 0.8,
            confidence_level: 0.95,
            min_effect_size: 0.05,
            min_sample_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Retry ceiling for SQL synthesis (total attempts per hypothesis).
    pub sql_retry_limit: u32,
    /// Retry ceiling for report regeneration.
    pub analysis_retry_limit: u32,
    pub min_required_rows: usize,
    pub required_columns: Vec<String>,
    pub hypothesis_count: usize,
    pub refinement_rounds: u32,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub sql_preflight_parse: bool,
    pub min_report_chars: usize,
    /// Plan several analysis steps per hypothesis instead of one query.
    pub analysis_plan: bool,
    pub max_analysis_steps: usize,
    /// Minimum spacing between LLM requests; 0 disables pacing.
    pub min_request_interval_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sql_retry_limit: 5,
            analysis_retry_limit: 3,
            min_required_rows: 1,
            required_columns: Vec::new(),
            hypothesis_count: 5,
            refinement_rounds: 2,
            max_concurrent_requests: 3,
            request_timeout_secs: 60,
            sql_preflight_parse: false,
            min_report_chars: 100,
            analysis_plan: false,
            max_analysis_steps: 4,
            min_request_interval_ms: 100,
        }
    }
}

/// Audience the rendered prose report is written for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportStyle {
    #[default]
    ExecutiveSummary,
    TechnicalDetail,
    ActionItems,
    VisualInsights,
    StakeholderUpdate,
    Custom(String),
}

impl ReportStyle {
    pub fn slug(&self) -> &str {
        match self {
            Self::ExecutiveSummary => "executive_summary",
            Self::TechnicalDetail => "technical_detail",
            Self::ActionItems => "action_items",
            Self::VisualInsights => "visual_insights",
            Self::StakeholderUpdate => "stakeholder_update",
            Self::Custom(_) => "custom",
        }
    }
}

impl std::str::FromStr for ReportStyle {
    type Err = std::convert::Infallible;

    /// Unknown names become [`ReportStyle::Custom`] requirements text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "executive_summary" => Self::ExecutiveSummary,
            "technical_detail" => Self::TechnicalDetail,
            "action_items" => Self::ActionItems,
            "visual_insights" => Self::VisualInsights,
            "stakeholder_update" => Self::StakeholderUpdate,
            other => Self::Custom(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportLanguage {
    #[default]
    English,
    Japanese,
    Chinese,
    Mixed,
}

impl std::str::FromStr for ReportLanguage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "english" | "en" => Ok(Self::English),
            "japanese" | "ja" => Ok(Self::Japanese),
            "chinese" | "zh" => Ok(Self::Chinese),
            "mixed" => Ok(Self::Mixed),
            other => Err(ConfigError::Invalid(format!(
                "unknown report language {other:?} (expected english|japanese|chinese|mixed)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub style: ReportStyle,
    pub language: ReportLanguage,
    /// Keywords a rendered report must mention to count as complete.
    pub required_sections: Vec<String>,
    pub render_with_llm: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            style: ReportStyle::default(),
            language: ReportLanguage::default(),
            required_sections: vec!["Hypothesis".to_string()],
            render_with_llm: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Model name; empty means the provider's default.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

// ============================================================================
// AnalysisConfig
// ============================================================================

/// Control/treatment SQL filters for a device comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentDesign {
    pub control_label: String,
    pub treatment_label: String,
    pub control_filter: String,
    pub treatment_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisConfig {
    pub profile: Profile,
    pub date_range: DateRangeConfig,
    pub table: TableConfig,
    pub schema: SchemaFields,
    pub device: DeviceConfig,
    pub events: EventConfig,
    pub statistical: StatisticalConfig,
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
    pub report: ReportConfig,
    pub llm: LlmSettings,
}

impl AnalysisConfig {
    /// Built-in defaults adjusted by `profile`.
    pub fn defaults(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            ..Self::default()
        };
        profile.apply(&mut config);
        config
    }

    /// Resolve the run configuration.
    ///
    /// Precedence: `overrides` > environment > profile > defaults.
    pub fn resolve(env: &dyn EnvSource, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let env_layer = overrides_from_env(env)?;
        let profile = overrides
            .profile
            .or(env_layer.profile)
            .unwrap_or_default();

        let mut config = Self::defaults(profile);
        env_layer.apply_to(&mut config);
        overrides.apply_to(&mut config);
        config.validate()?;

        tracing::debug!(profile = ?config.profile, "resolved analysis configuration");
        Ok(config)
    }

    /// Resolve against the process environment.
    pub fn from_process_env(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve(&ProcessEnv, overrides)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let start = parse_suffix_date("date_range.start_date", &self.date_range.start_date)?;
        let end = parse_suffix_date("date_range.end_date", &self.date_range.end_date)?;
        if start > end {
            return Err(ConfigError::Invalid(format!(
                "date_range.start_date {} is after end_date {}",
                self.date_range.start_date, self.date_range.end_date
            )));
        }

        let alpha = self.statistical.alpha;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "statistical.alpha must be in (0, 1), got {alpha}"
            )));
        }
        if self.statistical.min_effect_size.is_nan() || self.statistical.min_effect_size < 0.0 {
            return Err(ConfigError::Invalid(
                "statistical.min_effect_size must be non-negative".to_string(),
            ));
        }
        if self.processing.sql_retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "processing.sql_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.processing.analysis_retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "processing.analysis_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.processing.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "processing.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.processing.analysis_plan && self.processing.max_analysis_steps == 0 {
            return Err(ConfigError::Invalid(
                "processing.max_analysis_steps must be at least 1 when analysis_plan is on".to_string(),
            ));
        }
        if self.table.dataset_id.trim().is_empty() {
            return Err(ConfigError::Missing("table.dataset_id"));
        }
        Ok(())
    }

    /// Billing project for warehouse jobs. Required before any query runs.
    pub fn require_project(&self) -> Result<&str, ConfigError> {
        let project = self.table.project_id.trim();
        if project.is_empty() {
            return Err(ConfigError::Missing("table.project_id (set GCP_PROJECT_ID)"));
        }
        Ok(project)
    }

    /// `_TABLE_SUFFIX BETWEEN 'start' AND 'end'`.
    pub fn date_filter(&self, use_short_range: bool) -> String {
        let end = if use_short_range {
            self.date_range.short_end_date()
        } else {
            self.date_range.end_date.clone()
        };
        format!(
            "{} BETWEEN '{}' AND '{}'",
            self.schema.table_suffix_field, self.date_range.start_date, end
        )
    }

    pub fn full_table_reference(&self) -> String {
        self.table.full_table_reference()
    }

    pub fn event_filter<S: AsRef<str>>(&self, event_names: &[S]) -> String {
        let events = event_names
            .iter()
            .map(|e| format!("'{}'", e.as_ref().replace('\'', "\\'")))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} IN ({events})", self.schema.event_name_field)
    }

    /// `SELECT fields FROM table WHERE date_filter [AND conditions...]`.
    pub fn base_sql_query<S: AsRef<str>>(&self, select_fields: &[S], conditions: &[S]) -> String {
        let fields = select_fields
            .iter()
            .map(|f| f.as_ref())
            .collect::<Vec<_>>()
            .join(", ");
        let mut clauses = vec![self.date_filter(false)];
        clauses.extend(conditions.iter().map(|c| c.as_ref().to_string()));
        format!(
            "SELECT {fields} FROM {} WHERE {}",
            self.full_table_reference(),
            clauses.join(" AND ")
        )
    }

    pub fn experiment_design(
        &self,
        control_device: Option<&str>,
        treatment_device: Option<&str>,
    ) -> ExperimentDesign {
        let control = control_device.unwrap_or(&self.device.default_control);
        let treatment = treatment_device.unwrap_or(&self.device.default_treatment);
        let field = &self.schema.device_category_field;
        ExperimentDesign {
            control_label: control.to_string(),
            treatment_label: treatment.to_string(),
            control_filter: format!("{field} = '{control}'"),
            treatment_filter: format!("{field} = '{treatment}'"),
        }
    }

    /// `|effect| > min_effect_size`. NaN is never significant.
    pub fn is_significant_effect(&self, effect_size: f64) -> bool {
        effect_size.abs() > self.statistical.min_effect_size
    }

    /// `p < alpha`. NaN is never significant.
    pub fn is_significant_p(&self, p_value: f64) -> bool {
        p_value < self.statistical.alpha
    }

    pub fn has_min_sample(&self, sample_size: u64) -> bool {
        sample_size >= self.statistical.min_sample_size
    }
}

pub(crate) fn parse_suffix_date(field: &'static str, value: &str) -> Result<NaiveDate, ConfigError> {
    let trimmed = value.trim();
    if trimmed.len() != 8 {
        return Err(ConfigError::InvalidDate {
            field,
            value: value.to_string(),
        });
    }
    NaiveDate::parse_from_str(trimmed, TABLE_SUFFIX_DATE_FORMAT).map_err(|_| {
        ConfigError::InvalidDate {
            field,
            value: value.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_validate() {
        let config = AnalysisConfig::resolve(&env(&[]), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.profile, Profile::Development);
        assert_eq!(config.statistical.alpha, 0.05);
        assert_eq!(config.processing.sql_retry_limit, 5);
    }

    #[test]
    fn date_range_override_wins_over_defaults() {
        let overrides = ConfigOverrides {
            date_range: DateRangeOverrides {
                start_date: Some("20230101".to_string()),
                end_date: Some("20231231".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = AnalysisConfig::resolve(&env(&[]), &overrides).unwrap();
        assert_eq!(
            config.date_filter(false),
            "_TABLE_SUFFIX BETWEEN '20230101' AND '20231231'"
        );
    }

    #[test]
    fn date_range_override_wins_over_demo_profile_and_env() {
        let overrides = ConfigOverrides {
            profile: Some(Profile::Demo),
            date_range: DateRangeOverrides {
                start_date: Some("20230101".to_string()),
                end_date: Some("20231231".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let vars = env(&[("HYPOLAB_START_DATE", "20220101"), ("HYPOLAB_END_DATE", "20220131")]);
        let config = AnalysisConfig::resolve(&vars, &overrides).unwrap();
        assert_eq!(
            config.date_filter(false),
            "_TABLE_SUFFIX BETWEEN '20230101' AND '20231231'"
        );
    }

    #[test]
    fn alpha_precedence_override_env_default() {
        let no_env = env(&[]);
        let with_env = env(&[("HYPOLAB_ALPHA", "0.02")]);
        let explicit = ConfigOverrides {
            statistical: StatisticalOverrides {
                alpha: Some(0.001),
                ..Default::default()
            },
            ..Default::default()
        };

        let default_cfg = AnalysisConfig::resolve(&no_env, &ConfigOverrides::default()).unwrap();
        let env_cfg = AnalysisConfig::resolve(&with_env, &ConfigOverrides::default()).unwrap();
        let override_cfg = AnalysisConfig::resolve(&with_env, &explicit).unwrap();

        assert_eq!(default_cfg.statistical.alpha, 0.05);
        assert_eq!(env_cfg.statistical.alpha, 0.02);
        assert_eq!(override_cfg.statistical.alpha, 0.001);
    }

    #[test]
    fn short_range_is_clamped_to_end_date() {
        let range = DateRangeConfig {
            start_date: "20201101".to_string(),
            end_date: "20201104".to_string(),
            short_range_days: 7,
        };
        assert_eq!(range.short_end_date(), "20201104");

        let range = DateRangeConfig {
            short_range_days: 2,
            ..range
        };
        assert_eq!(range.short_end_date(), "20201103");
    }

    #[test]
    fn rejects_inverted_date_range() {
        let overrides = ConfigOverrides {
            date_range: DateRangeOverrides {
                start_date: Some("20231231".to_string()),
                end_date: Some("20230101".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = AnalysisConfig::resolve(&env(&[]), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_dates() {
        let vars = env(&[("HYPOLAB_START_DATE", "2023-01-01")]);
        let err = AnalysisConfig::resolve(&vars, &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDate { .. }));
    }

    #[test]
    fn table_reference_prefers_public_project() {
        let mut table = TableConfig::default();
        assert_eq!(
            table.full_table_reference(),
            "`bigquery-public-data.ga4_obfuscated_sample_ecommerce.events_*`"
        );

        table.public_dataset_project = None;
        table.project_id = "my-project".to_string();
        table.dataset_id = "analytics_123".to_string();
        assert_eq!(table.full_table_reference(), "`my-project.analytics_123.events_*`");

        table.dataset_id = "other-project.analytics_9".to_string();
        assert_eq!(table.full_table_reference(), "`other-project.analytics_9.events_*`");
    }

    #[test]
    fn base_query_includes_date_filter_and_conditions() {
        let config = AnalysisConfig::default();
        let filter = config.event_filter(&["purchase", "add_to_cart"]);
        assert_eq!(filter, "event_name IN ('purchase', 'add_to_cart')");

        let sql = config.base_sql_query(&["user_pseudo_id", "event_name"], &[filter.as_str()]);
        assert!(sql.starts_with("SELECT user_pseudo_id, event_name FROM `bigquery-public-data."));
        assert!(sql.contains("WHERE _TABLE_SUFFIX BETWEEN '20201101' AND '20210131' AND event_name IN"));
    }

    #[test]
    fn experiment_design_uses_device_defaults() {
        let config = AnalysisConfig::default();
        let design = config.experiment_design(None, Some("tablet"));
        assert_eq!(design.control_filter, "device.category = 'desktop'");
        assert_eq!(design.treatment_filter, "device.category = 'tablet'");
    }

    #[test]
    fn significance_checks() {
        let config = AnalysisConfig::default();
        assert!(config.is_significant_p(0.01));
        assert!(!config.is_significant_p(0.05));
        assert!(!config.is_significant_p(f64::NAN));
        assert!(config.is_significant_effect(-0.2));
        assert!(!config.is_significant_effect(0.05));
        assert!(!config.is_significant_effect(f64::NAN));
    }

    #[test]
    fn all_events_deduplicates_in_order() {
        let events = EventConfig::default().all_events();
        assert_eq!(events[0], "purchase");
        assert_eq!(events.iter().filter(|e| *e == "add_to_cart").count(), 1);
        assert!(events.contains(&"session_start".to_string()));
    }

    #[test]
    fn require_project_is_fatal_when_unset() {
        let config = AnalysisConfig::default();
        assert!(matches!(config.require_project(), Err(ConfigError::Missing(_))));

        let vars = env(&[("GCP_PROJECT_ID", "billing-project")]);
        let config = AnalysisConfig::resolve(&vars, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.require_project().unwrap(), "billing-project");
    }

    #[test]
    fn report_style_parses_custom_text() {
        let style: ReportStyle = "action_items".parse().unwrap();
        assert_eq!(style, ReportStyle::ActionItems);
        let style: ReportStyle = "one paragraph for the CFO".parse().unwrap();
        assert_eq!(style, ReportStyle::Custom("one paragraph for the CFO".to_string()));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn p_value_significance_is_monotonic(alpha in 0.001f64..0.5, p1 in 0.0f64..1.0, p2 in 0.0f64..1.0) {
            let mut config = AnalysisConfig::default();
            config.statistical.alpha = alpha;
            let (lo, hi) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };
            // a significant larger p-value implies the smaller one is significant too
            if config.is_significant_p(hi) {
                prop_assert!(config.is_significant_p(lo));
            }
            prop_assert_eq!(config.is_significant_p(lo), config.is_significant_p(lo));
        }

        #[test]
        fn effect_significance_is_monotonic(threshold in 0.0f64..1.0, e1 in -2.0f64..2.0, e2 in -2.0f64..2.0) {
            let mut config = AnalysisConfig::default();
            config.statistical.min_effect_size = threshold;
            let (small, large) = if e1.abs() <= e2.abs() { (e1, e2) } else { (e2, e1) };
            if config.is_significant_effect(small) {
                prop_assert!(config.is_significant_effect(large));
            }
        }
    }
}
