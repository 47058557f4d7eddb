//! Fake LLM and warehouse for pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hypolab_llm::{CompletionRequest, CompletionResponse, FinishReason, LLMError, LLMProvider, ModelInfo, Role};
use hypolab_pipeline::prompts;
use hypolab_warehouse::{Cell, ResultSet, Warehouse, WarehouseError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, LLMError> + Send + Sync>;

/// LLM double driven by a script or a rule, recording every request.
pub struct FakeLlm {
    responder: Responder,
    requests: Mutex<Vec<CompletionRequest>>,
    supports_json_mode: bool,
}

impl FakeLlm {
    /// Answers in order; errors once the script runs out.
    pub fn scripted(responses: Vec<Result<String, LLMError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::from_fn(move |_| {
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LLMError::Api("script exhausted".to_string())))
        })
    }

    pub fn from_fn(f: impl Fn(&CompletionRequest) -> Result<String, LLMError> + Send + Sync + 'static) -> Self {
        Self::from_response_fn(move |request| f(request).map(|content| CompletionResponse::text(content, "fake-model")))
    }

    /// Full responses in order, for finish reasons other than `Stop`.
    pub fn scripted_responses(responses: Vec<Result<CompletionResponse, LLMError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::from_response_fn(move |_| {
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LLMError::Api("script exhausted".to_string())))
        })
    }

    pub fn from_response_fn(
        f: impl Fn(&CompletionRequest) -> Result<CompletionResponse, LLMError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(f),
            requests: Mutex::new(Vec::new()),
            supports_json_mode: false,
        }
    }

    pub fn with_json_mode(mut self) -> Self {
        self.supports_json_mode = true;
        self
    }

    /// `json_mode` flag of every request so far.
    pub fn json_modes(&self) -> Vec<bool> {
        self.requests.lock().iter().map(|r| r.json_mode).collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn user_prompts(&self) -> Vec<String> {
        self.requests.lock().iter().map(CompletionRequest::user_text).collect()
    }
}

#[async_trait]
impl LLMProvider for FakeLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let answer = (self.responder)(&request);
        self.requests.lock().push(request);
        answer
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "fake-model".to_string(),
            max_tokens: 4096,
            supports_json_mode: self.supports_json_mode,
        }
    }
}

pub fn is_sql_request(request: &CompletionRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.role == Role::System && m.content == prompts::SQL_SYSTEM)
}

pub fn is_plan_request(request: &CompletionRequest) -> bool {
    request.user_text().contains("\"analysis_steps\"")
}

pub fn ok(text: &str) -> Result<String, LLMError> {
    Ok(text.to_string())
}

/// An answer cut off at the token limit.
pub fn truncated(text: &str) -> Result<CompletionResponse, LLMError> {
    Ok(CompletionResponse::text(text, "fake-model").with_finish_reason(FinishReason::Length))
}

pub fn complete(text: &str) -> Result<CompletionResponse, LLMError> {
    Ok(CompletionResponse::text(text, "fake-model"))
}

/// Passes preflight; the fake warehouse accepts it.
pub fn good_sql(tag: &str) -> String {
    format!("SELECT group_type, sample_size, conversion_rate FROM t -- {tag}")
}

/// Passes preflight; the fake warehouse rejects it with a syntax error.
pub fn broken_sql(tag: &str) -> String {
    format!("SELECT broken_column FROM t WHERE -- {tag}")
}

pub fn good_report(id: &str) -> String {
    format!(
        "## Hypothesis\n{id}: mobile converts 20% better than desktop.\n\n\
         ## Result\nThe treatment rate was 3.6% against 3.0% for control over 10000 users each."
    )
}

pub fn comparison_rows() -> ResultSet {
    ResultSet::from_rows(
        &["group_type", "sample_size", "conversion_rate"],
        vec![
            vec![Cell::from("control"), Cell::Int(10_000), Cell::Float(0.030)],
            vec![Cell::from("treatment"), Cell::Int(10_000), Cell::Float(0.036)],
        ],
    )
}

/// Rejects SQL mentioning `broken_column`, answers everything else with a
/// two-group comparison. Tracks peak concurrency.
pub struct FakeWarehouse {
    queries: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn query(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        self.queries.lock().push(sql.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if sql.contains("broken_column") {
            Err(WarehouseError::Query(
                "Syntax error: Unrecognized name: broken_column at [1:8]".to_string(),
            ))
        } else {
            Ok(comparison_rows())
        }
    }
}
