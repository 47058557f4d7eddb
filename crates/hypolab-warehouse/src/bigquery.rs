//! BigQuery REST client.
//!
//! Runs statements through `jobs.query` and polls `jobs.getQueryResults`
//! until the job completes, following page tokens up to a row cap.

use crate::{Cell, Column, ResultSet, Warehouse, WarehouseError};
use async_trait::async_trait;
use hypolab_config::AnalysisConfig;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const BIGQUERY_BASE_URL_ENV: &str = "BIGQUERY_BASE_URL";

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com";
const DEFAULT_MAX_ROWS: usize = 10_000;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// Project that owns (and is billed for) the query jobs.
    pub project_id: String,
    pub base_url: String,
    pub location: Option<String>,
    pub timeout_secs: u64,
    pub poll_interval: Duration,
    pub max_rows: usize,
}

impl BigQueryConfig {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            location: None,
            timeout_secs: 60,
            poll_interval: Duration::from_millis(500),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    /// Billing project and timeout from the run configuration; the API base
    /// URL may be redirected with `BIGQUERY_BASE_URL`.
    pub fn from_analysis(config: &AnalysisConfig) -> Result<Self, WarehouseError> {
        let project = config.require_project()?;
        let mut bq = Self::new(project).with_timeout_secs(config.processing.request_timeout_secs);
        if let Some(url) = std::env::var(BIGQUERY_BASE_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            bq = bq.with_base_url(&url);
        }
        Ok(bq)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }
}

/// Where the OAuth bearer token comes from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    /// `gcloud auth print-access-token`
    Gcloud,
}

impl TokenSource {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup(ACCESS_TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            Some(token) => Self::Static(token.trim().to_string()),
            None => Self::Gcloud,
        }
    }

    async fn fetch(&self) -> Result<String, WarehouseError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Gcloud => {
                let output = tokio::process::Command::new("gcloud")
                    .args(["auth", "print-access-token"])
                    .output()
                    .await
                    .map_err(|e| {
                        WarehouseError::Auth(format!(
                            "could not run gcloud ({e}); set {ACCESS_TOKEN_ENV} instead"
                        ))
                    })?;
                if !output.status.success() {
                    return Err(WarehouseError::Auth(format!(
                        "gcloud auth print-access-token failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if token.is_empty() {
                    return Err(WarehouseError::Auth("gcloud returned an empty token".to_string()));
                }
                Ok(token)
            }
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<SchemaJson>,
    #[serde(default)]
    rows: Vec<RowJson>,
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaJson {
    #[serde(default)]
    fields: Vec<FieldJson>,
}

#[derive(Debug, Deserialize)]
struct FieldJson {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    mode: Option<String>,
}

impl FieldJson {
    fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }

    fn column(&self) -> Column {
        let data_type = if self.is_repeated() {
            format!("ARRAY<{}>", self.field_type)
        } else {
            self.field_type.clone()
        };
        Column {
            name: self.name.clone(),
            data_type,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RowJson {
    #[serde(default)]
    f: Vec<CellJson>,
}

#[derive(Debug, Deserialize)]
struct CellJson {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// BigQuery returns scalars as strings; type them by the schema.
fn decode_cell(field: &FieldJson, value: &serde_json::Value) -> Cell {
    if value.is_null() {
        return Cell::Null;
    }
    let Some(raw) = value.as_str() else {
        return Cell::Json(value.clone());
    };
    if field.is_repeated() {
        return Cell::Json(value.clone());
    }
    match field.field_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" => raw
            .parse()
            .map(Cell::Int)
            .unwrap_or_else(|_| Cell::Text(raw.to_string())),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => raw
            .parse()
            .map(Cell::Float)
            .unwrap_or_else(|_| Cell::Text(raw.to_string())),
        "BOOLEAN" | "BOOL" => match raw {
            "true" => Cell::Bool(true),
            "false" => Cell::Bool(false),
            other => Cell::Text(other.to_string()),
        },
        _ => Cell::Text(raw.to_string()),
    }
}

fn decode_rows(fields: &[FieldJson], rows: Vec<RowJson>) -> Vec<Vec<Cell>> {
    rows.into_iter()
        .map(|row| {
            fields
                .iter()
                .enumerate()
                .map(|(idx, field)| {
                    row.f
                        .get(idx)
                        .map(|c| decode_cell(field, &c.v))
                        .unwrap_or(Cell::Null)
                })
                .collect()
        })
        .collect()
}

// ============================================================================
// Client
// ============================================================================

pub struct BigQueryClient {
    http: Client,
    config: BigQueryConfig,
    token_source: TokenSource,
    token: OnceCell<String>,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig, token_source: TokenSource) -> Result<Self, WarehouseError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs + 10))
            .build()
            .map_err(|e| WarehouseError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            token_source,
            token: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    async fn bearer(&self) -> Result<&str, WarehouseError> {
        self.token
            .get_or_try_init(|| self.token_source.fetch())
            .await
            .map(String::as_str)
    }

    fn queries_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.config.base_url, self.config.project_id
        )
    }

    async fn read_response(&self, response: Response) -> Result<QueryResponse, WarehouseError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| WarehouseError::InvalidResponse(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&text)
            .map(|e| e.error.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(text);
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                WarehouseError::Auth(format!("{status}: {message}"))
            }
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => WarehouseError::Query(message),
            _ => WarehouseError::Api(format!("{status}: {message}")),
        })
    }

    fn send_error(&self, err: reqwest::Error) -> WarehouseError {
        if err.is_timeout() {
            WarehouseError::Timeout(self.config.timeout_secs)
        } else {
            WarehouseError::Network(err.to_string())
        }
    }

    async fn start_query(&self, sql: &str) -> Result<QueryResponse, WarehouseError> {
        let mut body = serde_json::json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": self.config.timeout_secs * 1000,
        });
        if let Some(location) = &self.config.location {
            body["location"] = serde_json::json!(location);
        }

        let token = self.bearer().await?;
        let response = self
            .http
            .post(self.queries_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.read_response(response).await
    }

    async fn get_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let url = format!("{}/{}", self.queries_url(), job.job_id);
        let mut params: Vec<(&str, String)> = vec![("timeoutMs", "10000".to_string())];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let token = self.bearer().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&params)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.read_response(response).await
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn query(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        tracing::debug!(project = %self.config.project_id, sql_chars = sql.len(), "bigquery query");

        let mut page = self.start_query(sql).await?;
        let job = page.job_reference.clone();

        while !page.job_complete {
            let Some(job) = &job else {
                return Err(WarehouseError::InvalidResponse(
                    "incomplete job without a job reference".to_string(),
                ));
            };
            if Instant::now() >= deadline {
                return Err(WarehouseError::Timeout(self.config.timeout_secs));
            }
            tokio::time::sleep(self.config.poll_interval).await;
            page = self.get_results(job, None).await?;
        }

        if !page.errors.is_empty() && page.schema.is_none() {
            let messages: Vec<&str> = page.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(WarehouseError::Query(messages.join("; ")));
        }
        let schema = page.schema.take().ok_or_else(|| {
            WarehouseError::InvalidResponse("completed job has no schema".to_string())
        })?;

        let columns = schema.fields.iter().map(FieldJson::column).collect();
        let mut rows = decode_rows(&schema.fields, std::mem::take(&mut page.rows));
        let mut next_token = page.page_token.take();

        while let (Some(token), Some(job)) = (next_token.as_deref(), job.as_ref()) {
            if rows.len() >= self.config.max_rows {
                tracing::warn!(max_rows = self.config.max_rows, "truncating query result");
                break;
            }
            let mut next = self.get_results(job, Some(token)).await?;
            rows.extend(decode_rows(&schema.fields, std::mem::take(&mut next.rows)));
            next_token = next.page_token.take();
        }
        rows.truncate(self.config.max_rows);

        tracing::debug!(rows = rows.len(), "bigquery query complete");
        Ok(ResultSet::new(columns, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, ty: &str, mode: Option<&str>) -> FieldJson {
        FieldJson {
            name: name.to_string(),
            field_type: ty.to_string(),
            mode: mode.map(str::to_string),
        }
    }

    #[test]
    fn decodes_scalars_by_type() {
        assert_eq!(decode_cell(&field("n", "INTEGER", None), &json!("42")), Cell::Int(42));
        assert_eq!(decode_cell(&field("r", "FLOAT", None), &json!("0.5")), Cell::Float(0.5));
        assert_eq!(decode_cell(&field("b", "BOOLEAN", None), &json!("true")), Cell::Bool(true));
        assert_eq!(decode_cell(&field("s", "STRING", None), &json!("x")), Cell::Text("x".into()));
        assert_eq!(decode_cell(&field("s", "STRING", None), &json!(null)), Cell::Null);
    }

    #[test]
    fn repeated_and_records_stay_json() {
        let value = json!([{"v": "a"}]);
        assert_eq!(
            decode_cell(&field("tags", "STRING", Some("REPEATED")), &value),
            Cell::Json(value.clone())
        );
        assert_eq!(field("tags", "STRING", Some("REPEATED")).column().data_type, "ARRAY<STRING>");
    }

    #[test]
    fn token_source_prefers_env() {
        let source = TokenSource::from_lookup(|name| {
            (name == ACCESS_TOKEN_ENV).then(|| " ya29.token ".to_string())
        });
        assert!(matches!(source, TokenSource::Static(ref t) if t == "ya29.token"));
        assert!(matches!(TokenSource::from_lookup(|_| None), TokenSource::Gcloud));
    }
}
