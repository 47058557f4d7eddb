//! SQL synthesis with a bounded corrective retry loop.
//!
//! Each attempt asks the model for a query, strips fencing, preflights it,
//! runs it and checks the result shape. Any failure, a truncated answer
//! included, becomes the corrective context of the next attempt. The loop
//! is sequential, never exceeds `processing.sql_retry_limit` attempts and
//! stops at the first success.

use crate::hypothesis::Hypothesis;
use crate::plan::AnalysisStep;
use crate::prompts::{self, Correction};
use chrono::{DateTime, Utc};
use hypolab_config::AnalysisConfig;
use hypolab_llm::{strip_code_fence, CompletionRequest, LLMProvider};
use hypolab_warehouse::{preflight, ResultSet, Warehouse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { row_count: usize },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAttempt {
    pub hypothesis_id: String,
    /// Set when the attempt belongs to a step of an analysis plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Empty when the model call itself failed.
    pub sql: String,
    /// 1-based.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub created_at: DateTime<Utc>,
}

impl QueryAttempt {
    fn new(
        hypothesis_id: &str,
        step: Option<&AnalysisStep>,
        sql: String,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            hypothesis_id: hypothesis_id.to_string(),
            step_id: step.map(|s| s.step_id.clone()),
            sql,
            attempt,
            outcome,
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            AttemptOutcome::Error { message } => Some(message),
            AttemptOutcome::Success { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("model returned an empty response on attempt {attempt}")]
    EmptyResponse { attempt: u32 },
    #[error("no query succeeded after {attempts} attempts; last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone)]
pub enum SynthesisOutcome {
    Success {
        attempts: Vec<QueryAttempt>,
        result: ResultSet,
    },
    Failed {
        attempts: Vec<QueryAttempt>,
        error: SynthesisError,
    },
}

impl SynthesisOutcome {
    pub fn attempts(&self) -> &[QueryAttempt] {
        match self {
            Self::Success { attempts, .. } | Self::Failed { attempts, .. } => attempts,
        }
    }

    /// The attempt that is persisted: the success, or the last failure.
    pub fn final_attempt(&self) -> Option<&QueryAttempt> {
        self.attempts().last()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Shape checks applied to a query result.
pub fn check_result(result: &ResultSet, config: &AnalysisConfig) -> Result<(), String> {
    let min_rows = config.processing.min_required_rows;
    if result.row_count() < min_rows {
        return Err(if result.is_empty() {
            "query returned no rows".to_string()
        } else {
            format!(
                "query returned {} rows, at least {min_rows} required",
                result.row_count()
            )
        });
    }
    let missing: Vec<&str> = config
        .processing
        .required_columns
        .iter()
        .map(String::as_str)
        .filter(|c| !result.has_column(c))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required columns: {}", missing.join(", ")));
    }
    Ok(())
}

pub struct SqlSynthesizer<'a> {
    llm: &'a dyn LLMProvider,
    warehouse: &'a dyn Warehouse,
    config: &'a AnalysisConfig,
    schema_text: &'a str,
    exploration: Option<&'a str>,
}

impl<'a> SqlSynthesizer<'a> {
    pub fn new(
        llm: &'a dyn LLMProvider,
        warehouse: &'a dyn Warehouse,
        config: &'a AnalysisConfig,
        schema_text: &'a str,
        exploration: Option<&'a str>,
    ) -> Self {
        Self {
            llm,
            warehouse,
            config,
            schema_text,
            exploration,
        }
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        let mut request = CompletionRequest::user(prompt)
            .with_system(prompts::SQL_SYSTEM)
            .with_temperature(self.config.llm.temperature);
        if self.config.llm.max_tokens > 0 {
            request = request.with_max_tokens(self.config.llm.max_tokens);
        }
        request
    }

    /// Run one attempt after the model has answered. `Err` is the message
    /// fed back to the next attempt.
    async fn execute(&self, sql: &str) -> Result<ResultSet, String> {
        preflight(sql, self.config.processing.sql_preflight_parse).map_err(|e| e.to_string())?;
        let result = self
            .warehouse
            .query(sql)
            .await
            .map_err(|e| e.to_string())?;
        check_result(&result, self.config)?;
        Ok(result)
    }

    /// One query for the whole hypothesis.
    pub async fn synthesize(&self, hypothesis: &Hypothesis) -> SynthesisOutcome {
        self.run(hypothesis, None).await
    }

    /// One query for a single step of an analysis plan, with its own
    /// retry ceiling.
    pub async fn synthesize_step(&self, hypothesis: &Hypothesis, step: &AnalysisStep) -> SynthesisOutcome {
        self.run(hypothesis, Some(step)).await
    }

    async fn run(&self, hypothesis: &Hypothesis, step: Option<&AnalysisStep>) -> SynthesisOutcome {
        let limit = self.config.processing.sql_retry_limit.max(1);
        let id = hypothesis.id.as_str();
        let step_id = step.map_or("", |s| s.step_id.as_str());
        let mut attempts: Vec<QueryAttempt> = Vec::new();
        let mut correction: Option<Correction> = None;

        for attempt in 1..=limit {
            tracing::info!(hypothesis = id, step = step_id, attempt, limit, "generating SQL");
            let prompt = prompts::sql_prompt(
                self.config,
                self.schema_text,
                self.exploration,
                hypothesis,
                step,
                correction.as_ref(),
            );

            let response = match self.llm.complete(self.request(prompt)).await {
                Ok(response) => response,
                Err(err) => {
                    let message = format!("SQL generation failed: {err}");
                    tracing::warn!(hypothesis = id, attempt, error = %err, "LLM call failed");
                    attempts.push(QueryAttempt::new(
                        id,
                        step,
                        String::new(),
                        attempt,
                        AttemptOutcome::Error {
                            message: message.clone(),
                        },
                    ));
                    correction = Some(Correction {
                        sql: None,
                        error: message,
                    });
                    continue;
                }
            };

            if response.content.trim().is_empty() {
                tracing::error!(hypothesis = id, attempt, "model returned an empty response");
                return SynthesisOutcome::Failed {
                    attempts,
                    error: SynthesisError::EmptyResponse { attempt },
                };
            }

            let sql = strip_code_fence(&response.content);
            if let Some(reason) = response.incomplete_reason() {
                let message = format!("{reason}; the query was not run. Return a shorter, complete query");
                tracing::warn!(hypothesis = id, attempt, reason, "incomplete SQL answer");
                attempts.push(QueryAttempt::new(
                    id,
                    step,
                    sql.clone(),
                    attempt,
                    AttemptOutcome::Error {
                        message: message.clone(),
                    },
                ));
                correction = Some(Correction {
                    sql: Some(sql),
                    error: message,
                });
                continue;
            }
            match self.execute(&sql).await {
                Ok(result) => {
                    tracing::info!(hypothesis = id, attempt, rows = result.row_count(), "query succeeded");
                    attempts.push(QueryAttempt::new(
                        id,
                        step,
                        sql,
                        attempt,
                        AttemptOutcome::Success {
                            row_count: result.row_count(),
                        },
                    ));
                    return SynthesisOutcome::Success { attempts, result };
                }
                Err(message) => {
                    tracing::warn!(hypothesis = id, attempt, error = %message, "query attempt failed");
                    attempts.push(QueryAttempt::new(
                        id,
                        step,
                        sql.clone(),
                        attempt,
                        AttemptOutcome::Error {
                            message: message.clone(),
                        },
                    ));
                    correction = Some(Correction {
                        sql: Some(sql),
                        error: message,
                    });
                }
            }
        }

        let last_error = attempts
            .last()
            .and_then(QueryAttempt::error)
            .unwrap_or_default()
            .to_string();
        tracing::error!(hypothesis = id, attempts = attempts.len(), "retry ceiling reached");
        SynthesisOutcome::Failed {
            error: SynthesisError::Exhausted {
                attempts: attempts.len() as u32,
                last_error,
            },
            attempts,
        }
    }
}
