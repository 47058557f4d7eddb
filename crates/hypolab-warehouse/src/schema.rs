//! Schema extraction and data exploration.
//!
//! Both produce markdown documents that are handed to the model verbatim:
//! `schema.txt` describes table structure, `data_exploration.txt` shows what
//! values actually occur.

use crate::{ResultSet, Warehouse, WarehouseError};
use chrono::{DateTime, Local};
use hypolab_config::AnalysisConfig;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaField {
    /// Dotted path, e.g. `device.category`.
    pub path: String,
    pub data_type: String,
}

impl SchemaField {
    fn depth(&self) -> usize {
        self.path.matches('.').count()
    }

    /// `RECORD` for structs, element type for arrays.
    pub fn display_type(&self) -> &str {
        let inner = self
            .data_type
            .strip_prefix("ARRAY<")
            .and_then(|t| t.strip_suffix('>'))
            .unwrap_or(&self.data_type);
        if inner.starts_with("STRUCT<") {
            "RECORD"
        } else {
            inner
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.data_type.starts_with("ARRAY<") {
            "REPEATED"
        } else {
            "NULLABLE"
        }
    }
}

/// Structure of the sharded event table, taken from its first shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub dataset: String,
    pub table_pattern: String,
    pub shard_count: u64,
    pub first_shard: String,
    pub last_shard: String,
    pub fields: Vec<SchemaField>,
}

fn shard_prefix(config: &AnalysisConfig) -> String {
    config.table.table_pattern.trim_end_matches('*').to_string()
}

fn information_schema(config: &AnalysisConfig, view: &str) -> String {
    format!(
        "`{}.{}.INFORMATION_SCHEMA.{view}`",
        config.table.source_project(),
        config.table.dataset_name()
    )
}

pub fn shard_query(config: &AnalysisConfig) -> String {
    format!(
        "SELECT COUNT(*) AS shard_count, MIN(table_name) AS first_shard, MAX(table_name) AS last_shard \
         FROM {} WHERE STARTS_WITH(table_name, '{}')",
        information_schema(config, "TABLES"),
        shard_prefix(config)
    )
}

pub fn field_paths_query(config: &AnalysisConfig, table_name: &str) -> String {
    format!(
        "SELECT field_path, data_type FROM {} WHERE table_name = '{table_name}' ORDER BY field_path",
        information_schema(config, "COLUMN_FIELD_PATHS")
    )
}

/// Read shard metadata and field paths for the configured table pattern.
pub async fn extract_schema(
    warehouse: &dyn Warehouse,
    config: &AnalysisConfig,
) -> Result<TableSchema, WarehouseError> {
    let shards = warehouse.query(&shard_query(config)).await?;
    let text = |column: &str| {
        shards
            .cell(0, column)
            .map(|c| c.to_string())
            .unwrap_or_default()
    };
    let shard_count = shards
        .cell(0, "shard_count")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.0) as u64;
    let first_shard = text("first_shard");
    let last_shard = text("last_shard");
    if shard_count == 0 || first_shard.is_empty() || first_shard == "NULL" {
        return Err(WarehouseError::Query(format!(
            "no tables matching {} in {}",
            config.table.table_pattern,
            config.table.dataset_id
        )));
    }

    let paths = warehouse
        .query(&field_paths_query(config, &first_shard))
        .await?;
    let fields = (0..paths.row_count())
        .filter_map(|row| {
            let path = paths.cell(row, "field_path")?.to_string();
            let data_type = paths.cell(row, "data_type")?.to_string();
            Some(SchemaField { path, data_type })
        })
        .collect::<Vec<_>>();
    tracing::info!(shards = shard_count, fields = fields.len(), table = %first_shard, "extracted schema");

    Ok(TableSchema {
        dataset: config.table.dataset_id.clone(),
        table_pattern: config.table.table_pattern.clone(),
        shard_count,
        first_shard,
        last_shard,
        fields,
    })
}

fn field_description(name: &str) -> &'static str {
    match name {
        "event_date" => "Event date (YYYYMMDD)",
        "event_timestamp" => "Event time in microseconds since epoch",
        "event_name" => "Event name (page_view, purchase, ...)",
        "event_value_in_usd" => "Event value in USD",
        "user_id" => "Signed-in user id",
        "user_pseudo_id" => "Anonymous user identifier",
        "user_first_touch_timestamp" => "First touch timestamp",
        "event_params" => "Event parameters (key/value records)",
        "user_properties" => "User properties",
        "device" => "Device information (category, OS, ...)",
        "geo" => "Geography (country, region, ...)",
        "traffic_source" => "Acquisition source (source, medium, ...)",
        "app_info" => "App information",
        "user_ltv" => "Lifetime value",
        "privacy_info" => "Privacy consent information",
        "ecommerce" => "Ecommerce totals for the event",
        "items" => "Items attached to the event",
        _ => "",
    }
}

/// Markdown schema document.
pub fn render_schema(schema: &TableSchema, config: &AnalysisConfig, at: &DateTime<Local>) -> String {
    let mut out = format!(
        "# Table Schema\nGenerated on: {}\nDataset: {}\n\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        schema.dataset
    );
    out.push_str(&format!(
        "## {} (date-sharded)\n\nShards: {} ({} .. {}). All shards share this structure.\n\n",
        schema.table_pattern, schema.shard_count, schema.first_shard, schema.last_shard
    ));

    out.push_str("| Field | Type | Mode | Description |\n|---|---|---|---|\n");
    for field in schema.fields.iter().filter(|f| f.depth() == 0) {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            field.path,
            field.display_type(),
            field.mode(),
            field_description(&field.path)
        ));
    }

    let records: Vec<&SchemaField> = schema
        .fields
        .iter()
        .filter(|f| f.depth() == 0 && f.display_type() == "RECORD")
        .collect();
    if !records.is_empty() {
        out.push_str("\n### Nested fields\n");
    }
    for record in records {
        let prefix = format!("{}.", record.path);
        let children: Vec<&SchemaField> = schema
            .fields
            .iter()
            .filter(|f| f.path.starts_with(&prefix) && f.depth() == record.depth() + 1)
            .collect();
        if children.is_empty() {
            continue;
        }
        out.push_str(&format!("\n#### {}\n| Subfield | Type | Mode |\n|---|---|---|\n", record.path));
        for child in children {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                &child.path[prefix.len()..],
                child.display_type(),
                child.mode()
            ));
        }
    }

    out.push_str(&format!(
        "\n## Query notes\n\n\
         1. Query all shards with {} and always restrict `{}`.\n\
         2. Default analysis window: `{}`.\n\
         3. REPEATED fields are arrays; use UNNEST to filter on their contents.\n",
        config.full_table_reference(),
        config.schema.table_suffix_field,
        config.date_filter(false)
    ));
    out
}

// ============================================================================
// Data exploration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationQuery {
    pub key: &'static str,
    pub title: &'static str,
    pub sql: String,
}

pub fn exploration_queries(config: &AnalysisConfig) -> Vec<ExplorationQuery> {
    let table = config.full_table_reference();
    let date = config.date_filter(false);
    let s = &config.schema;
    vec![
        ExplorationQuery {
            key: "data_summary",
            title: "Data volume",
            sql: format!(
                "SELECT MIN(event_date) AS min_date, MAX(event_date) AS max_date, \
                 COUNT(*) AS total_events, COUNT(DISTINCT {user}) AS total_users \
                 FROM {table} WHERE {date}",
                user = s.user_id_field
            ),
        },
        ExplorationQuery {
            key: "available_events",
            title: "Event names (top 20)",
            sql: format!(
                "SELECT {event} AS event_name, COUNT(*) AS event_count, \
                 COUNT(DISTINCT {user}) AS unique_users FROM {table} WHERE {date} \
                 GROUP BY 1 ORDER BY event_count DESC LIMIT 20",
                event = s.event_name_field,
                user = s.user_id_field
            ),
        },
        ExplorationQuery {
            key: "device_categories",
            title: "Device categories",
            sql: format!(
                "SELECT {device} AS device_category, COUNT(*) AS event_count, \
                 COUNT(DISTINCT {user}) AS unique_users FROM {table} WHERE {date} \
                 AND {device} IS NOT NULL GROUP BY 1 ORDER BY event_count DESC",
                device = s.device_category_field,
                user = s.user_id_field
            ),
        },
        ExplorationQuery {
            key: "traffic_sources",
            title: "Traffic sources (top 15)",
            sql: format!(
                "SELECT {source} AS source, {medium} AS medium, COUNT(*) AS event_count \
                 FROM {table} WHERE {date} AND {source} IS NOT NULL \
                 GROUP BY 1, 2 ORDER BY event_count DESC LIMIT 15",
                source = s.traffic_source_field,
                medium = s.traffic_medium_field
            ),
        },
        ExplorationQuery {
            key: "common_event_params",
            title: "Event parameter keys (top 20)",
            sql: format!(
                "SELECT param.key AS param_key, COUNT(*) AS usage_count \
                 FROM {table}, UNNEST(event_params) AS param WHERE {date} \
                 GROUP BY 1 ORDER BY usage_count DESC LIMIT 20"
            ),
        },
        ExplorationQuery {
            key: "top_countries",
            title: "Countries (top 10)",
            sql: format!(
                "SELECT {geo} AS country, COUNT(*) AS event_count FROM {table} \
                 WHERE {date} AND {geo} IS NOT NULL GROUP BY 1 ORDER BY event_count DESC LIMIT 10",
                geo = s.geo_country_field
            ),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct ExplorationSection {
    pub key: &'static str,
    pub title: &'static str,
    pub result: ResultSet,
}

#[derive(Debug, Clone, Default)]
pub struct DataExploration {
    pub sections: Vec<ExplorationSection>,
    /// `(key, error)` for queries that failed and were left out.
    pub skipped: Vec<(&'static str, String)>,
}

impl DataExploration {
    pub fn section(&self, key: &str) -> Option<&ExplorationSection> {
        self.sections.iter().find(|s| s.key == key)
    }

    /// Markdown exploration document.
    pub fn render(&self, config: &AnalysisConfig, at: &DateTime<Local>) -> String {
        let mut out = format!(
            "# Data Exploration\nGenerated on: {}\nDataset: {}\n",
            at.format("%Y-%m-%d %H:%M:%S"),
            config.table.dataset_id
        );
        for section in &self.sections {
            out.push_str(&format!("\n## {}\n\n", section.title));
            out.push_str(&section.result.to_text_table(25));
        }

        out.push_str("\n## SQL guidelines\n\n");
        if let Some(devices) = self.section("device_categories") {
            let values: Vec<String> = (0..devices.result.row_count())
                .filter_map(|r| devices.result.cell(r, "device_category").map(|c| c.to_string()))
                .collect();
            if !values.is_empty() {
                out.push_str(&format!("- Device categories: {}\n", values.join(", ")));
            }
        }
        out.push_str(&format!(
            "- Table: {}\n- Required filter: `WHERE {}`\n- Pick event names from the list above.\n",
            config.full_table_reference(),
            config.date_filter(false)
        ));
        out
    }
}

/// Run every exploration query. A failing query is logged and omitted.
pub async fn explore(warehouse: &dyn Warehouse, config: &AnalysisConfig) -> DataExploration {
    let mut exploration = DataExploration::default();
    for query in exploration_queries(config) {
        match warehouse.query(&query.sql).await {
            Ok(result) => {
                tracing::info!(section = query.key, rows = result.row_count(), "exploration query");
                exploration.sections.push(ExplorationSection {
                    key: query.key,
                    title: query.title,
                    result,
                });
            }
            Err(err) => {
                tracing::warn!(section = query.key, error = %err, "exploration query failed");
                exploration.skipped.push((query.key, err.to_string()));
            }
        }
    }
    exploration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cell;
    use async_trait::async_trait;

    struct ScriptedWarehouse;

    #[async_trait]
    impl Warehouse for ScriptedWarehouse {
        async fn query(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
            if sql.contains("INFORMATION_SCHEMA.TABLES") {
                return Ok(ResultSet::from_rows(
                    &["shard_count", "first_shard", "last_shard"],
                    vec![vec![92i64.into(), "events_20201101".into(), "events_20210131".into()]],
                ));
            }
            if sql.contains("COLUMN_FIELD_PATHS") {
                assert!(sql.contains("table_name = 'events_20201101'"));
                let rows = [
                    ("device", "STRUCT<category STRING, os STRING>"),
                    ("device.category", "STRING"),
                    ("device.os", "STRING"),
                    ("event_name", "STRING"),
                    ("event_params", "ARRAY<STRUCT<key STRING, value STRUCT<string_value STRING>>>"),
                    ("event_params.key", "STRING"),
                    ("event_params.value", "STRUCT<string_value STRING>"),
                    ("event_params.value.string_value", "STRING"),
                ];
                return Ok(ResultSet::from_rows(
                    &["field_path", "data_type"],
                    rows.iter().map(|(p, t)| vec![Cell::from(*p), Cell::from(*t)]).collect(),
                ));
            }
            if sql.contains("UNNEST(event_params)") {
                return Err(WarehouseError::Query("access denied".to_string()));
            }
            if sql.contains("device_category") {
                return Ok(ResultSet::from_rows(
                    &["device_category", "event_count", "unique_users"],
                    vec![
                        vec!["desktop".into(), 10i64.into(), 4i64.into()],
                        vec!["mobile".into(), 6i64.into(), 3i64.into()],
                    ],
                ));
            }
            Ok(ResultSet::from_rows(&["n"], vec![vec![1i64.into()]]))
        }
    }

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.table.project_id = "billing".to_string();
        config
    }

    #[tokio::test]
    async fn extracts_first_shard_schema() {
        let schema = extract_schema(&ScriptedWarehouse, &config()).await.unwrap();
        assert_eq!(schema.shard_count, 92);
        assert_eq!(schema.fields.len(), 8);

        let text = render_schema(&schema, &config(), &Local::now());
        assert!(text.contains("| device | RECORD | NULLABLE |"));
        assert!(text.contains("| event_params | RECORD | REPEATED |"));
        assert!(text.contains("#### event_params\n"));
        assert!(text.contains("| key | STRING | NULLABLE |"));
        assert!(!text.contains("| value.string_value |"));
        assert!(text.contains("_TABLE_SUFFIX BETWEEN '20201101' AND '20210131'"));
    }

    #[tokio::test]
    async fn exploration_skips_failed_sections() {
        let exploration = explore(&ScriptedWarehouse, &config()).await;
        assert_eq!(exploration.sections.len(), 5);
        assert_eq!(exploration.skipped.len(), 1);
        assert_eq!(exploration.skipped[0].0, "common_event_params");

        let text = exploration.render(&config(), &Local::now());
        assert!(text.contains("## Device categories"));
        assert!(!text.contains("Event parameter keys"));
        assert!(text.contains("- Device categories: desktop, mobile"));
    }

    #[test]
    fn queries_use_configured_fields() {
        let mut config = config();
        config.schema.geo_country_field = "geo.region".to_string();
        let queries = exploration_queries(&config);
        let geo = queries.iter().find(|q| q.key == "top_countries").unwrap();
        assert!(geo.sql.contains("geo.region AS country"));
        assert!(queries.iter().all(|q| q.sql.contains(&config.date_filter(false))));
    }
}
