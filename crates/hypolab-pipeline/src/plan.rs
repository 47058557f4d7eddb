//! Multi-step analysis plans.
//!
//! With `processing.analysis_plan` on, each hypothesis is first broken into
//! a few analysis steps (baseline, comparison, segment drill-down, ...).
//! Every step gets its own SQL retry loop and the step results feed one
//! combined report.

use crate::hypothesis::Hypothesis;
use crate::prompts;
use crate::synthesis::QueryAttempt;
use crate::PipelineError;
use hypolab_config::AnalysisConfig;
use hypolab_llm::{extract_json, CompletionRequest, LLMProvider};
use hypolab_warehouse::ResultSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStep {
    pub step_id: String,
    pub title: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub sql_requirements: Vec<String>,
}

impl AnalysisStep {
    /// Single-step plan used when planning fails.
    pub fn basic() -> Self {
        Self {
            step_id: "step1".to_string(),
            title: "Basic analysis".to_string(),
            purpose: "Test the hypothesis directly".to_string(),
            sql_requirements: vec![
                "Compare the hypothesis groups on the metric the hypothesis names".to_string(),
            ],
        }
    }

    pub fn file_stem(&self) -> String {
        self.step_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    pub fn prompt_block(&self) -> String {
        let mut block = format!(
            "- **Step**: {}\n- **Title**: {}\n- **Purpose**: {}\n",
            self.step_id, self.title, self.purpose
        );
        if !self.sql_requirements.is_empty() {
            block.push_str(&format!("- **Requirements**: {}\n", self.sql_requirements.join("; ")));
        }
        block
    }
}

/// Outcome of one planned step.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub step: AnalysisStep,
    pub attempts: Vec<QueryAttempt>,
    /// `Some` when a query succeeded.
    pub result: Option<ResultSet>,
    pub error: Option<String>,
}

impl StepRun {
    pub fn succeeded(&self) -> bool {
        self.result.is_some()
    }

    pub fn status_label(&self) -> &'static str {
        if self.succeeded() {
            "success"
        } else {
            "failed"
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    step_id: Option<serde_json::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    sql_requirements: Option<serde_json::Value>,
}

fn requirements(value: Option<serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => vec![s],
        _ => Vec::new(),
    }
}

/// Parse `{"analysis_steps": [...]}` (or a bare array) into steps.
///
/// Steps need a title or a purpose. Missing and duplicate step ids become
/// `step{n}` by position.
pub fn parse_plan(text: &str) -> Result<Vec<AnalysisStep>, PipelineError> {
    let items = match extract_json(text)? {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("analysis_steps") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(PipelineError::NoAnalysisSteps),
        },
        _ => return Err(PipelineError::NoAnalysisSteps),
    };

    let mut used = BTreeSet::new();
    let mut steps = Vec::new();
    for item in items {
        let raw = match serde_json::from_value::<RawStep>(item) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed analysis step");
                continue;
            }
        };
        let title = raw.title.unwrap_or_default().trim().to_string();
        let purpose = raw.purpose.unwrap_or_default().trim().to_string();
        if title.is_empty() && purpose.is_empty() {
            tracing::warn!("dropping analysis step without title or purpose");
            continue;
        }

        let mut step_id = match raw.step_id {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => format!("step{n}"),
            _ => String::new(),
        };
        if step_id.is_empty() || used.contains(&step_id) {
            step_id = format!("step{}", steps.len() + 1);
            while used.contains(&step_id) {
                step_id.push('b');
            }
        }
        used.insert(step_id.clone());

        steps.push(AnalysisStep {
            step_id,
            title: if title.is_empty() { purpose.clone() } else { title },
            purpose,
            sql_requirements: requirements(raw.sql_requirements),
        });
    }

    if steps.is_empty() {
        return Err(PipelineError::NoAnalysisSteps);
    }
    Ok(steps)
}

pub struct AnalysisPlanner<'a> {
    llm: &'a dyn LLMProvider,
    config: &'a AnalysisConfig,
}

impl<'a> AnalysisPlanner<'a> {
    pub fn new(llm: &'a dyn LLMProvider, config: &'a AnalysisConfig) -> Self {
        Self { llm, config }
    }

    /// Ask for a plan of at most `processing.max_analysis_steps` steps.
    /// Never fails: an unusable answer yields the single basic step.
    pub async fn plan(
        &self,
        hypothesis: &Hypothesis,
        schema_text: &str,
        exploration: Option<&str>,
    ) -> Vec<AnalysisStep> {
        let max_steps = self.config.processing.max_analysis_steps.max(1);
        let prompt = prompts::plan_prompt(self.config, schema_text, exploration, hypothesis, max_steps);
        let mut request = CompletionRequest::user(prompt)
            .with_system(prompts::ANALYST_SYSTEM)
            .with_temperature(self.config.llm.temperature)
            .with_json_mode(self.llm.model_info().supports_json_mode);
        if self.config.llm.max_tokens > 0 {
            request = request.with_max_tokens(self.config.llm.max_tokens);
        }

        let parsed = match self.llm.complete(request).await {
            Ok(response) => {
                if let Some(reason) = response.incomplete_reason() {
                    tracing::warn!(hypothesis = %hypothesis.id, reason, "analysis plan answer incomplete");
                }
                parse_plan(&response.content)
            }
            Err(err) => Err(PipelineError::Llm(err)),
        };

        match parsed {
            Ok(mut steps) => {
                if steps.len() > max_steps {
                    tracing::debug!(hypothesis = %hypothesis.id, got = steps.len(), keep = max_steps, "truncating analysis plan");
                    steps.truncate(max_steps);
                }
                tracing::info!(hypothesis = %hypothesis.id, steps = steps.len(), "planned analysis");
                steps
            }
            Err(err) => {
                tracing::warn!(hypothesis = %hypothesis.id, error = %err, "analysis plan unusable; using basic step");
                vec![AnalysisStep::basic()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_plan_object() {
        let text = r#"```json
{"analysis_steps": [
  {"step_id": "step1", "title": "Baseline", "purpose": "Overall rate", "sql_requirements": ["rate per device"]},
  {"step_id": "step2", "title": "Comparison", "purpose": "Mobile vs desktop", "sql_requirements": "one row per group"}
]}
```"#;
        let steps = parse_plan(text).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].sql_requirements, vec!["rate per device"]);
        assert_eq!(steps[1].sql_requirements, vec!["one row per group"]);
    }

    #[test]
    fn renames_missing_and_duplicate_step_ids() {
        let text = r#"[
          {"title": "A"},
          {"step_id": "step1", "title": "B"},
          {"step_id": 7, "purpose": "C only"},
          {"step_id": "x"}
        ]"#;
        let steps = parse_plan(text).unwrap();
        let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["step1", "step2", "step7"]);
        assert_eq!(steps[2].title, "C only");
    }

    #[test]
    fn object_without_steps_is_rejected() {
        assert!(matches!(
            parse_plan(r#"{"plan": "look at the data"}"#),
            Err(PipelineError::NoAnalysisSteps)
        ));
        assert!(matches!(parse_plan("[]"), Err(PipelineError::NoAnalysisSteps)));
    }

    #[test]
    fn step_file_stem_is_filesystem_safe() {
        let step = AnalysisStep {
            step_id: "step 2/b".to_string(),
            ..AnalysisStep::basic()
        };
        assert_eq!(step.file_stem(), "step_2_b");
    }
}
