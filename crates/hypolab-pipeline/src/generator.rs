//! Hypothesis generation with critique/refine rounds.

use crate::hypothesis::{parse_hypotheses, Hypothesis};
use crate::prompts;
use crate::PipelineError;
use chrono::Utc;
use hypolab_config::AnalysisConfig;
use hypolab_llm::{CompletionRequest, LLMProvider};

pub struct HypothesisGenerator<'a> {
    llm: &'a dyn LLMProvider,
    config: &'a AnalysisConfig,
}

impl<'a> HypothesisGenerator<'a> {
    pub fn new(llm: &'a dyn LLMProvider, config: &'a AnalysisConfig) -> Self {
        Self { llm, config }
    }

    /// `json` asks for JSON mode when the model supports it; the critique
    /// is prose and does not.
    async fn ask(&self, prompt: String, json: bool) -> Result<String, PipelineError> {
        let mut request = CompletionRequest::user(prompt)
            .with_system(prompts::ANALYST_SYSTEM)
            .with_temperature(self.config.llm.temperature)
            .with_json_mode(json && self.llm.model_info().supports_json_mode);
        if self.config.llm.max_tokens > 0 {
            request = request.with_max_tokens(self.config.llm.max_tokens);
        }
        let response = self.llm.complete(request).await?;
        if let Some(reason) = response.incomplete_reason() {
            tracing::warn!(reason, "hypothesis answer incomplete");
        }
        Ok(response.content)
    }

    fn truncate(&self, mut hypotheses: Vec<Hypothesis>) -> Vec<Hypothesis> {
        let count = self.config.processing.hypothesis_count.max(1);
        if hypotheses.len() > count {
            tracing::debug!(got = hypotheses.len(), keep = count, "truncating hypotheses");
            hypotheses.truncate(count);
        }
        hypotheses
    }

    /// Propose hypotheses, then run `processing.refinement_rounds` rounds of
    /// critique and refinement. The initial proposal must parse; a round
    /// whose critique or refinement fails keeps the previous list.
    pub async fn generate(
        &self,
        schema_text: &str,
        exploration: Option<&str>,
        focus: &str,
    ) -> Result<Vec<Hypothesis>, PipelineError> {
        let prompt = prompts::generation_prompt(self.config, schema_text, exploration, focus);
        let text = self.ask(prompt, true).await?;
        let mut hypotheses = self.truncate(parse_hypotheses(&text, Utc::now())?);
        tracing::info!(count = hypotheses.len(), "generated hypotheses");

        let count = self.config.processing.hypothesis_count.max(1);
        for round in 1..=self.config.processing.refinement_rounds {
            let current = prompt_list(&hypotheses);
            let critique = match self.ask(prompts::critique_prompt(&current), false).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => {
                    tracing::warn!(round, "empty critique; keeping current hypotheses");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(round, error = %err, "critique failed; keeping current hypotheses");
                    continue;
                }
            };

            let refined = match self
                .ask(prompts::refine_prompt(&current, &critique, count), true)
                .await
            {
                Ok(text) => parse_hypotheses(&text, Utc::now()),
                Err(err) => Err(err),
            };
            match refined {
                Ok(refined) => {
                    hypotheses = self.truncate(refined);
                    tracing::info!(round, count = hypotheses.len(), "refined hypotheses");
                }
                Err(err) => {
                    tracing::warn!(round, error = %err, "refinement unusable; keeping current hypotheses");
                }
            }
        }

        Ok(hypotheses)
    }
}

fn prompt_list(hypotheses: &[Hypothesis]) -> String {
    let items: Vec<String> = hypotheses.iter().map(Hypothesis::prompt_json).collect();
    format!("[\n{}\n]", items.join(",\n"))
}
