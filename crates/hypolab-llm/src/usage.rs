//! Token usage and cost accounting.

use crate::{CompletionRequest, CompletionResponse, LLMError, LLMProvider, ModelInfo, Usage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// USD per 1K tokens (input, output), matched by substring in order.
const PRICING_PER_1K: &[(&[&str], f64, f64)] = &[
    (&["gpt-4o-mini"], 0.000_15, 0.000_6),
    (&["gpt-4o"], 0.005, 0.015),
    (&["gpt-4-turbo", "gpt-4.1"], 0.01, 0.03),
    (&["gpt-4"], 0.03, 0.06),
];

/// Rate applied to models missing from the table (gpt-4o-mini).
const FALLBACK_PER_1K: (f64, f64) = (0.000_15, 0.000_6);

fn rates(model: &str) -> Option<(f64, f64)> {
    let model = model.to_ascii_lowercase();
    PRICING_PER_1K
        .iter()
        .find(|(keys, _, _)| keys.iter().any(|key| model.contains(key)))
        .map(|&(_, input, output)| (input, output))
}

/// Whether `model` has its own entry in the price table.
pub fn is_priced(model: &str) -> bool {
    rates(model).is_some()
}

/// Estimated cost in USD. Unknown models are priced as gpt-4o-mini.
pub fn estimate_cost_usd(model: &str, usage: Usage) -> f64 {
    let (input, output) = rates(model).unwrap_or(FALLBACK_PER_1K);
    (usage.prompt_tokens as f64 / 1000.0) * input + (usage.completion_tokens as f64 / 1000.0) * output
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub failed_requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

/// Append-only usage accumulator shared across concurrent tasks.
#[derive(Debug, Default)]
pub struct UsageMeter {
    by_model: Mutex<BTreeMap<String, ModelUsage>>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, usage: Usage) {
        let cost = estimate_cost_usd(model, usage);
        let mut by_model = self.by_model.lock();
        if !by_model.contains_key(model) && !is_priced(model) {
            tracing::warn!(model, "unknown model, using gpt-4o-mini pricing");
        }
        let entry = by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.prompt_tokens += usage.prompt_tokens as u64;
        entry.completion_tokens += usage.completion_tokens as u64;
        entry.estimated_cost_usd += cost;
    }

    pub fn record_failure(&self, model: &str) {
        let mut by_model = self.by_model.lock();
        let entry = by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.failed_requests += 1;
    }

    pub fn report(&self) -> UsageReport {
        let by_model = self.by_model.lock().clone();
        let mut report = UsageReport {
            by_model,
            ..Default::default()
        };
        for usage in report.by_model.values() {
            report.total_requests += usage.requests;
            report.failed_requests += usage.failed_requests;
            report.total_tokens += usage.prompt_tokens + usage.completion_tokens;
            report.estimated_cost_usd += usage.estimated_cost_usd;
        }
        report
    }
}

/// Provider wrapper that records every completion in a [`UsageMeter`].
pub struct MeteredProvider {
    inner: Arc<dyn LLMProvider>,
    meter: Arc<UsageMeter>,
}

impl MeteredProvider {
    pub fn new(inner: Arc<dyn LLMProvider>, meter: Arc<UsageMeter>) -> Self {
        Self { inner, meter }
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }
}

#[async_trait]
impl LLMProvider for MeteredProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        match self.inner.complete(request).await {
            Ok(response) => {
                self.meter.record(&response.model, response.usage);
                tracing::debug!(
                    model = %response.model,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    "llm completion"
                );
                Ok(response)
            }
            Err(err) => {
                self.meter.record_failure(&self.inner.model_info().name);
                Err(err)
            }
        }
    }

    fn model_info(&self) -> ModelInfo {
        self.inner.model_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn prices_most_specific_model_first() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
        };
        assert_relative_eq!(estimate_cost_usd("gpt-4o-mini-2024-07-18", usage), 0.000_75);
        assert_relative_eq!(estimate_cost_usd("gpt-4o", usage), 0.02);
        assert_relative_eq!(estimate_cost_usd("GPT-4", usage), 0.09);
    }

    #[test]
    fn gpt_4_1_uses_turbo_rate() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
        };
        assert_relative_eq!(estimate_cost_usd("gpt-4.1-2025-04-14", usage), 0.04);
        assert_relative_eq!(estimate_cost_usd("gpt-4-turbo-preview", usage), 0.04);
        assert!(is_priced("gpt-4.1-mini"));
    }

    #[test]
    fn unknown_models_fall_back_to_mini_rate() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
        };
        assert!(!is_priced("llama3"));
        assert_relative_eq!(
            estimate_cost_usd("llama3", usage),
            estimate_cost_usd("gpt-4o-mini", usage)
        );
    }

    #[test]
    fn meter_aggregates_per_model() {
        let meter = UsageMeter::new();
        let usage = Usage {
            prompt_tokens: 200,
            completion_tokens: 50,
        };
        meter.record("gpt-4o-mini", usage);
        meter.record("gpt-4o-mini", usage);
        meter.record_failure("gpt-4o-mini");
        meter.record("local", usage);

        let report = meter.report();
        assert_eq!(report.total_requests, 4);
        assert_eq!(report.failed_requests, 1);
        assert_eq!(report.total_tokens, 750);
        assert_eq!(report.by_model["gpt-4o-mini"].requests, 3);
        assert!(report.estimated_cost_usd > 0.0);
    }
}
