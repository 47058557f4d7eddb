//! Report rendering with a bounded quality loop, plus deterministic
//! fallback and integrated reports, and free-form reports over finished
//! runs (run comparisons, answers to custom questions).

use crate::hypothesis::Hypothesis;
use crate::plan::StepRun;
use crate::prompts;
use crate::runner::{HypothesisRun, RunSummary};
use crate::stats::ExperimentSummary;
use crate::PipelineError;
use chrono::{DateTime, Local};
use hypolab_config::AnalysisConfig;
use hypolab_llm::{CompletionRequest, LLMProvider};
use hypolab_warehouse::ResultSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const RESULT_TABLE_ROWS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedReport {
    pub text: String,
    /// True only when the report passed every quality check.
    pub validated: bool,
    pub attempts: u32,
    /// Problems found in the kept report; empty when validated.
    pub problems: Vec<String>,
    /// The text is the deterministic fallback, not model output.
    pub fallback: bool,
}

/// Quality problems of a rendered report. Empty means it passes.
pub fn check_report(text: &str, row_count: usize, config: &AnalysisConfig) -> Vec<String> {
    let mut problems = Vec::new();
    let min_chars = config.processing.min_report_chars;
    let chars = text.chars().count();
    if chars < min_chars {
        problems.push(format!("report is too short ({chars} chars, need {min_chars})"));
    }
    let lower = text.to_lowercase();
    for section in &config.report.required_sections {
        if !lower.contains(&section.to_lowercase()) {
            problems.push(format!("report does not mention \"{section}\""));
        }
    }
    if !text.chars().any(|c| c.is_ascii_digit()) {
        problems.push("report contains no numeric evidence".to_string());
    }
    if row_count < config.processing.min_required_rows {
        problems.push(format!(
            "result has {row_count} rows, at least {} required",
            config.processing.min_required_rows
        ));
    }
    problems
}

/// Deterministic report used when the model produced nothing usable.
pub fn fallback_report(hypothesis: &Hypothesis, summary: &ExperimentSummary) -> String {
    format!(
        "# {id} validation result\n\n\
         ## Hypothesis\n{summary_text}\n\n\
         ## Result\n\
         The query completed and returned {rows} rows, but a detailed report could not be \
         generated. Manual review is recommended.\n\n\
         ## Statistics\n```\n{stats}```\n",
        id = hypothesis.id,
        summary_text = hypothesis.summary,
        rows = summary.row_count,
        stats = summary.describe(),
    )
}

/// Result tables of every step of an analysis plan, in plan order.
pub fn step_results_text(steps: &[StepRun]) -> String {
    let mut out = String::new();
    for run in steps {
        out.push_str(&format!("### {}: {}\n", run.step.step_id, run.step.title));
        if !run.step.purpose.is_empty() && run.step.purpose != run.step.title {
            out.push_str(&format!("{}\n", run.step.purpose));
        }
        match (&run.result, &run.error) {
            (Some(result), _) => out.push_str(&result.to_text_table(RESULT_TABLE_ROWS)),
            (None, Some(error)) => out.push_str(&format!("No result: {error}")),
            (None, None) => out.push_str("No result."),
        }
        out.push_str("\n\n");
    }
    out
}

/// What a comparison of runs concentrates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonFocus {
    #[default]
    Performance,
    HypothesisQuality,
    TimeEfficiency,
    BusinessImpact,
}

impl ComparisonFocus {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::HypothesisQuality => "hypothesis_quality",
            Self::TimeEfficiency => "time_efficiency",
            Self::BusinessImpact => "business_impact",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Performance => "validation performance (success rates and SQL attempts)",
            Self::HypothesisQuality => "hypothesis quality (significance and effect sizes)",
            Self::TimeEfficiency => "time efficiency (run duration and retries)",
            Self::BusinessImpact => "business impact (actionable findings)",
        }
    }
}

impl fmt::Display for ComparisonFocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ComparisonFocus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "performance" => Ok(Self::Performance),
            "hypothesis_quality" | "quality" => Ok(Self::HypothesisQuality),
            "time_efficiency" | "time" => Ok(Self::TimeEfficiency),
            "business_impact" | "business" => Ok(Self::BusinessImpact),
            other => Err(format!(
                "unknown comparison focus '{other}' (expected performance, hypothesis_quality, \
                 time_efficiency or business_impact)"
            )),
        }
    }
}

fn metadata_header(
    title: &str,
    report_type: &str,
    config: &AnalysisConfig,
    sources: &[String],
    at: &DateTime<Local>,
) -> String {
    let mut out = format!(
        "# {title}\n\n\
         - **Generated**: {}\n\
         - **Report type**: {report_type}\n\
         - **Language**: {:?}\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        config.report.language,
    );
    if !sources.is_empty() {
        out.push_str(&format!("- **Sources**: {}\n", sources.join(", ")));
    }
    out.push_str("\n---\n\n");
    out
}

pub struct ReportGenerator<'a> {
    llm: &'a dyn LLMProvider,
    config: &'a AnalysisConfig,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(llm: &'a dyn LLMProvider, config: &'a AnalysisConfig) -> Self {
        Self { llm, config }
    }

    /// Render and check a report, regenerating with the problems fed back
    /// up to `processing.analysis_retry_limit` times. If no attempt passes,
    /// the report with the fewest problems is kept unvalidated (later
    /// attempts win ties); if the model produced nothing, the fallback is.
    pub async fn render(
        &self,
        hypothesis: &Hypothesis,
        result: &ResultSet,
        summary: &ExperimentSummary,
    ) -> ValidatedReport {
        let table = result.to_text_table(RESULT_TABLE_ROWS);
        self.render_table(hypothesis, &table, result.row_count(), summary)
            .await
    }

    /// Same quality loop over the combined results of an analysis plan.
    /// `summary` is the statistics of the step chosen as the headline.
    pub async fn render_steps(
        &self,
        hypothesis: &Hypothesis,
        steps: &[StepRun],
        summary: &ExperimentSummary,
    ) -> ValidatedReport {
        let table = step_results_text(steps);
        let rows = steps
            .iter()
            .filter_map(|s| s.result.as_ref())
            .map(ResultSet::row_count)
            .max()
            .unwrap_or(0);
        self.render_table(hypothesis, &table, rows, summary).await
    }

    async fn render_table(
        &self,
        hypothesis: &Hypothesis,
        table: &str,
        row_count: usize,
        summary: &ExperimentSummary,
    ) -> ValidatedReport {
        let limit = self.config.processing.analysis_retry_limit.max(1);
        let statistics = summary.describe();
        let mut feedback: Vec<String> = Vec::new();
        let mut best: Option<(String, Vec<String>)> = None;

        for attempt in 1..=limit {
            let prompt =
                prompts::report_prompt(self.config, hypothesis, table, &statistics, &feedback);
            let mut request = CompletionRequest::user(prompt)
                .with_system(prompts::ANALYST_SYSTEM)
                .with_temperature(self.config.llm.temperature);
            if self.config.llm.max_tokens > 0 {
                request = request.with_max_tokens(self.config.llm.max_tokens);
            }

            let (text, incomplete) = match self.llm.complete(request).await {
                Ok(response) if !response.content.trim().is_empty() => {
                    (response.content.trim().to_string(), response.incomplete_reason())
                }
                Ok(_) => {
                    tracing::warn!(hypothesis = %hypothesis.id, attempt, "empty report");
                    feedback = vec!["the previous response was empty".to_string()];
                    continue;
                }
                Err(err) => {
                    tracing::warn!(hypothesis = %hypothesis.id, attempt, error = %err, "report generation failed");
                    feedback = vec![format!("report generation failed: {err}")];
                    continue;
                }
            };

            let mut problems = check_report(&text, row_count, self.config);
            if let Some(reason) = incomplete {
                problems.push(reason.to_string());
            }
            if problems.is_empty() {
                tracing::info!(hypothesis = %hypothesis.id, attempt, chars = text.len(), "report validated");
                return ValidatedReport {
                    text,
                    validated: true,
                    attempts: attempt,
                    problems,
                    fallback: false,
                };
            }

            tracing::warn!(hypothesis = %hypothesis.id, attempt, problems = ?problems, "report failed quality checks");
            if best.as_ref().map_or(true, |(_, p)| problems.len() <= p.len()) {
                best = Some((text, problems.clone()));
            }
            feedback = problems;
        }

        match best {
            Some((text, problems)) => ValidatedReport {
                text,
                validated: false,
                attempts: limit,
                problems,
                fallback: false,
            },
            None => {
                tracing::warn!(hypothesis = %hypothesis.id, "using fallback report");
                ValidatedReport {
                    text: fallback_report(hypothesis, summary),
                    validated: false,
                    attempts: limit,
                    problems: feedback,
                    fallback: true,
                }
            }
        }
    }
}

impl ReportGenerator<'_> {
    async fn free_form(&self, prompt: String, what: &'static str) -> Result<String, PipelineError> {
        let mut request = CompletionRequest::user(prompt)
            .with_system(prompts::ANALYST_SYSTEM)
            .with_temperature(self.config.llm.temperature);
        if self.config.llm.max_tokens > 0 {
            request = request.with_max_tokens(self.config.llm.max_tokens);
        }
        let response = self.llm.complete(request).await?;
        if response.content.trim().is_empty() {
            return Err(PipelineError::EmptyAnswer { what });
        }
        if let Some(reason) = response.incomplete_reason() {
            tracing::warn!(report = what, reason, "report answer incomplete");
        }
        Ok(response.content.trim().to_string())
    }

    /// Compare finished runs, each given with the name of the file it was
    /// read from.
    pub async fn compare_runs(
        &self,
        runs: &[(String, RunSummary)],
        focus: ComparisonFocus,
        at: &DateTime<Local>,
    ) -> Result<String, PipelineError> {
        if runs.is_empty() {
            return Err(PipelineError::NothingToCompare);
        }
        let payload = runs
            .iter()
            .map(|(source, summary)| {
                Ok(serde_json::json!({ "source": source, "run": serde_json::to_value(summary)? }))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        let runs_json = serde_json::to_string_pretty(&payload)?;
        tracing::info!(runs = runs.len(), %focus, "comparing runs");
        let prompt = prompts::comparison_prompt(self.config, &runs_json, focus.description());
        let body = self.free_form(prompt, "comparison report").await?;
        let sources: Vec<String> = runs.iter().map(|(source, _)| source.clone()).collect();
        let title = format!("Run comparison: {}", focus.slug());
        Ok(metadata_header(&title, "comparison_report", self.config, &sources, at) + &body + "\n")
    }

    /// Answer caller-supplied questions about one run.
    pub async fn answer_questions(
        &self,
        source: &str,
        summary: &RunSummary,
        questions: &[String],
        at: &DateTime<Local>,
    ) -> Result<String, PipelineError> {
        let questions: Vec<String> = questions
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if questions.is_empty() {
            return Err(PipelineError::NoQuestions);
        }
        let results_json = serde_json::to_string_pretty(summary)?;
        tracing::info!(questions = questions.len(), "answering custom questions");
        let prompt = prompts::questions_prompt(self.config, &results_json, &questions);
        let body = self.free_form(prompt, "custom analysis").await?;
        let mut out = metadata_header("Custom analysis", "custom_analysis", self.config, &[source.to_string()], at);
        out.push_str("## Questions\n\n");
        for (i, q) in questions.iter().enumerate() {
            out.push_str(&format!("{}. {q}\n", i + 1));
        }
        out.push_str("\n## Answers\n\n");
        out.push_str(&body);
        out.push('\n');
        Ok(out)
    }
}

fn format_effect(effect: Option<f64>) -> String {
    effect.map_or_else(|| "n/a".to_string(), |e| format!("{:+.1}%", e * 100.0))
}

fn format_p(p: Option<f64>) -> String {
    p.map_or_else(|| "n/a".to_string(), |p| format!("{p:.4}"))
}

/// Integrated quantitative report over every hypothesis of a run.
pub fn render_integrated_report(
    runs: &[HypothesisRun],
    config: &AnalysisConfig,
    at: &DateTime<Local>,
) -> String {
    let count = |label: &str| {
        runs.iter()
            .filter(|r| r.status_label() == label)
            .count()
    };
    let mut out = format!(
        "# Hypothesis Validation Report\n\n\
         **Generated**: {}\n\
         **Data range**: {} .. {}\n\
         **Report style**: {}\n\n\
         ## Summary\n\n\
         - Validated: {} / {}\n\
         - Unvalidated: {}\n\
         - Failed: {}\n\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        config.date_range.start_date,
        config.date_range.end_date,
        config.report.style.slug(),
        count("validated"),
        runs.len(),
        count("unvalidated"),
        count("failed"),
    );

    out.push_str("| Hypothesis | Status | SQL attempts | Rows | Effect | p-value | Significant |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for run in runs {
        let (rows, effect, p, significant) = match &run.result {
            Some(result) => {
                let cmp = result.summary.comparison.as_ref();
                (
                    result.summary.row_count.to_string(),
                    format_effect(cmp.and_then(|c| c.relative_effect)),
                    format_p(cmp.and_then(|c| c.p_value)),
                    if result.significant { "yes" } else { "no" }.to_string(),
                )
            }
            None => ("-".into(), "-".into(), "-".into(), "-".into()),
        };
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} |\n",
            run.hypothesis.id,
            run.status_label(),
            run.attempts.len(),
            rows,
            effect,
            p,
            significant
        ));
    }

    for run in runs {
        out.push_str(&format!("\n## {}: {}\n\n", run.hypothesis.id, run.hypothesis.summary));
        if !run.steps.is_empty() {
            for step in &run.steps {
                out.push_str(&format!(
                    "- {} {}: {} ({} SQL attempts)\n",
                    step.step.step_id,
                    step.step.title,
                    step.status_label(),
                    step.attempts.len()
                ));
            }
            out.push('\n');
        }
        match (&run.result, &run.hypothesis.validation) {
            (Some(result), _) => {
                out.push_str(&format!("```\n{}```\n", result.summary.describe()));
                if let Some(report) = &result.report {
                    if !report.validated {
                        out.push_str(&format!(
                            "\n> Unvalidated report: {}\n",
                            report.problems.join("; ")
                        ));
                    }
                    out.push('\n');
                    out.push_str(report.text.trim());
                    out.push('\n');
                }
            }
            (None, Some(outcome)) => {
                let reason = match outcome {
                    crate::ValidationOutcome::Failed { reason, .. }
                    | crate::ValidationOutcome::Unvalidated { reason } => reason.as_str(),
                    crate::ValidationOutcome::Validated => "",
                };
                out.push_str(&format!("Validation failed: {reason}\n"));
            }
            (None, None) => out.push_str("Not processed.\n"),
        }
    }

    out.push_str("\n---\n*Generated automatically by hypolab.*\n");
    out
}
