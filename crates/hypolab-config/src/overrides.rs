//! Typed configuration overrides.
//!
//! Each category has a struct of optional fields. Merging is field by field
//! and category by category, in declaration order, so the result never
//! depends on map iteration order.

use crate::{
    AnalysisConfig, ConfigError, DateRangeConfig, DeviceConfig, EventConfig, LlmSettings,
    OutputConfig, ProcessingConfig, Profile, ReportConfig, ReportLanguage, ReportStyle,
    SchemaFields, StatisticalConfig, TableConfig,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

macro_rules! override_section {
    ($(#[$meta:meta])* $name:ident => $target:ty { $($(#[$fmeta:meta])* $field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default, deny_unknown_fields)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: Option<$ty>,)*
        }

        impl $name {
            /// Fields set on `top` win; unset fields fall through to `self`.
            pub fn layered(self, top: Self) -> Self {
                Self {
                    $($field: top.$field.or(self.$field),)*
                }
            }

            pub fn apply_to(&self, target: &mut $target) {
                $(
                    if let Some(value) = &self.$field {
                        target.$field = value.clone();
                    }
                )*
            }

            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }
        }
    };
}

override_section!(DateRangeOverrides => DateRangeConfig {
    start_date: String,
    end_date: String,
    short_range_days: u32,
});

override_section!(TableOverrides => TableConfig {
    project_id: String,
    dataset_id: String,
    table_pattern: String,
    /// `null` clears the public project so the dataset is read from
    /// `project_id`.
    #[serde(deserialize_with = "explicit_null", skip_serializing_if = "Option::is_none")]
    public_dataset_project: Option<String>,
});

/// A present key, `null` included, is a set override.
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

override_section!(SchemaOverrides => SchemaFields {
    user_id_field: String,
    event_name_field: String,
    device_category_field: String,
    geo_country_field: String,
    traffic_source_field: String,
    traffic_medium_field: String,
    event_timestamp_field: String,
    table_suffix_field: String,
});

override_section!(DeviceOverrides => DeviceConfig {
    categories: Vec<String>,
    default_control: String,
    default_treatment: String,
});

override_section!(EventOverrides => EventConfig {
    primary_events: Vec<String>,
    funnel_events: Vec<String>,
    engagement_events: Vec<String>,
});

override_section!(StatisticalOverrides => StatisticalConfig {
    alpha: f64,
    power: f64,
    confidence_level: f64,
    min_effect_size: f64,
    min_sample_size: u64,
});

override_section!(ProcessingOverrides => ProcessingConfig {
    sql_retry_limit: u32,
    analysis_retry_limit: u32,
    min_required_rows: usize,
    required_columns: Vec<String>,
    hypothesis_count: usize,
    refinement_rounds: u32,
    max_concurrent_requests: usize,
    request_timeout_secs: u64,
    sql_preflight_parse: bool,
    min_report_chars: usize,
    analysis_plan: bool,
    max_analysis_steps: usize,
    min_request_interval_ms: u64,
});

override_section!(OutputOverrides => OutputConfig {
    base_dir: PathBuf,
    data_dir: PathBuf,
    filename_prefix: String,
    timestamp_format: String,
});

override_section!(ReportOverrides => ReportConfig {
    style: ReportStyle,
    language: ReportLanguage,
    required_sections: Vec<String>,
    render_with_llm: bool,
});

override_section!(LlmOverrides => LlmSettings {
    model: String,
    temperature: f32,
    max_tokens: usize,
});

/// Caller-supplied overrides, nested by category.
///
/// ```json
/// {
///   "date_range": { "start_date": "20230101", "end_date": "20231231" },
///   "statistical": { "alpha": 0.01 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub profile: Option<Profile>,
    pub date_range: DateRangeOverrides,
    pub table: TableOverrides,
    pub schema: SchemaOverrides,
    pub device: DeviceOverrides,
    pub events: EventOverrides,
    pub statistical: StatisticalOverrides,
    pub processing: ProcessingOverrides,
    pub output: OutputOverrides,
    pub report: ReportOverrides,
    pub llm: LlmOverrides,
}

impl ConfigOverrides {
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Stack `top` over `self`; every field set on `top` wins.
    pub fn layered(self, top: Self) -> Self {
        Self {
            profile: top.profile.or(self.profile),
            date_range: self.date_range.layered(top.date_range),
            table: self.table.layered(top.table),
            schema: self.schema.layered(top.schema),
            device: self.device.layered(top.device),
            events: self.events.layered(top.events),
            statistical: self.statistical.layered(top.statistical),
            processing: self.processing.layered(top.processing),
            output: self.output.layered(top.output),
            report: self.report.layered(top.report),
            llm: self.llm.layered(top.llm),
        }
    }

    /// Apply every set field. The profile is not applied here; it selects
    /// the defaults the overrides land on.
    pub fn apply_to(&self, config: &mut AnalysisConfig) {
        self.date_range.apply_to(&mut config.date_range);
        self.table.apply_to(&mut config.table);
        self.schema.apply_to(&mut config.schema);
        self.device.apply_to(&mut config.device);
        self.events.apply_to(&mut config.events);
        self.statistical.apply_to(&mut config.statistical);
        self.processing.apply_to(&mut config.processing);
        self.output.apply_to(&mut config.output);
        self.report.apply_to(&mut config.report);
        self.llm.apply_to(&mut config.llm);
    }
}
