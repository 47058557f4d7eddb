//! Pipeline drivers: per-hypothesis processing (one query, or one query
//! per planned analysis step), sequential and bounded-concurrent
//! execution, and run aggregation.

use crate::artifacts::ArtifactStore;
use crate::hypothesis::{Hypothesis, ValidationOutcome};
use crate::plan::{AnalysisPlanner, StepRun};
use crate::report::{self, ReportGenerator, ValidatedReport};
use crate::stats::ExperimentSummary;
use crate::synthesis::{QueryAttempt, SqlSynthesizer, SynthesisOutcome};
use crate::PipelineError;
use chrono::{DateTime, Local, Utc};
use hypolab_config::{AnalysisConfig, Profile};
use hypolab_llm::{LLMProvider, UsageMeter, UsageReport};
use hypolab_warehouse::Warehouse;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

// ============================================================================
// Run data
// ============================================================================

/// Text inputs shared by every hypothesis of a run.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub schema_text: String,
    pub exploration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub hypothesis_id: String,
    pub summary: ExperimentSummary,
    pub significant: bool,
    /// `None` when LLM rendering is disabled.
    pub report: Option<ValidatedReport>,
}

/// Everything produced for one hypothesis.
#[derive(Debug, Clone)]
pub struct HypothesisRun {
    /// Carries the final validation outcome.
    pub hypothesis: Hypothesis,
    /// Every SQL attempt, across all steps in plan mode.
    pub attempts: Vec<QueryAttempt>,
    pub result: Option<ExperimentResult>,
    /// Empty unless the hypothesis ran as an analysis plan.
    pub steps: Vec<StepRun>,
}

impl HypothesisRun {
    pub fn status_label(&self) -> &'static str {
        self.hypothesis
            .validation
            .as_ref()
            .map_or("pending", ValidationOutcome::label)
    }

    fn failed(hypothesis: Hypothesis, reason: String, attempts: Vec<QueryAttempt>) -> Self {
        let outcome = ValidationOutcome::Failed {
            reason,
            attempts: attempts.len() as u32,
        };
        Self {
            hypothesis: hypothesis.with_validation(outcome),
            attempts,
            result: None,
            steps: Vec::new(),
        }
    }

    fn status(&self) -> HypothesisStatus {
        let comparison = self
            .result
            .as_ref()
            .and_then(|r| r.summary.comparison.as_ref());
        HypothesisStatus {
            id: self.hypothesis.id.clone(),
            summary: self.hypothesis.summary.clone(),
            status: self.status_label().to_string(),
            sql_attempts: self.attempts.len(),
            significant: self.result.as_ref().map(|r| r.significant),
            relative_effect: comparison.and_then(|c| c.relative_effect),
            p_value: comparison.and_then(|c| c.p_value),
            reason: match &self.hypothesis.validation {
                Some(ValidationOutcome::Failed { reason, .. })
                | Some(ValidationOutcome::Unvalidated { reason }) => Some(reason.clone()),
                _ => None,
            },
            steps: self
                .steps
                .iter()
                .map(|s| StepStatus {
                    step_id: s.step.step_id.clone(),
                    title: s.step.title.clone(),
                    status: s.status_label().to_string(),
                    sql_attempts: s.attempts.len(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_id: String,
    pub title: String,
    pub status: String,
    pub sql_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisStatus {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    pub status: String,
    pub sql_attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub significant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_effect: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepStatus>,
}

/// Written to `run_summary.json` at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub profile: Profile,
    pub total: usize,
    pub validated: usize,
    pub unvalidated: usize,
    pub failed: usize,
    pub hypotheses: Vec<HypothesisStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
    pub integrated_report: PathBuf,
}

#[derive(Debug)]
pub struct RunOutput {
    pub runs: Vec<HypothesisRun>,
    pub summary: RunSummary,
    pub summary_path: PathBuf,
    /// Timestamped copy of the summary.
    pub archive_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// Hypotheses run as tokio tasks bounded by
    /// `processing.max_concurrent_requests`.
    Concurrent,
}

// ============================================================================
// Per-hypothesis processing
// ============================================================================

async fn process_hypothesis(
    llm: &dyn LLMProvider,
    warehouse: &dyn Warehouse,
    config: &AnalysisConfig,
    inputs: &RunInputs,
    hypothesis: Hypothesis,
) -> HypothesisRun {
    if config.processing.analysis_plan {
        return process_planned(llm, warehouse, config, inputs, hypothesis).await;
    }

    let synthesizer = SqlSynthesizer::new(
        llm,
        warehouse,
        config,
        &inputs.schema_text,
        inputs.exploration.as_deref(),
    );
    let (attempts, result) = match synthesizer.synthesize(&hypothesis).await {
        SynthesisOutcome::Success { attempts, result } => (attempts, result),
        SynthesisOutcome::Failed { attempts, error } => {
            tracing::warn!(hypothesis = %hypothesis.id, error = %error, "hypothesis failed");
            return HypothesisRun::failed(hypothesis, error.to_string(), attempts);
        }
    };

    let summary = ExperimentSummary::from_result(&result, config);
    tracing::info!(hypothesis = %hypothesis.id, rows = summary.row_count, "query result summarised");

    let report = if config.report.render_with_llm {
        Some(
            ReportGenerator::new(llm, config)
                .render(&hypothesis, &result, &summary)
                .await,
        )
    } else {
        None
    };
    conclude(config, hypothesis, attempts, Vec::new(), summary, report)
}

/// Plan the analysis, run the SQL loop per step, then report over every
/// step that produced rows. Fails only when no step did.
async fn process_planned(
    llm: &dyn LLMProvider,
    warehouse: &dyn Warehouse,
    config: &AnalysisConfig,
    inputs: &RunInputs,
    hypothesis: Hypothesis,
) -> HypothesisRun {
    let exploration = inputs.exploration.as_deref();
    let plan = AnalysisPlanner::new(llm, config)
        .plan(&hypothesis, &inputs.schema_text, exploration)
        .await;
    let synthesizer = SqlSynthesizer::new(llm, warehouse, config, &inputs.schema_text, exploration);

    let mut steps = Vec::with_capacity(plan.len());
    for step in plan {
        let run = match synthesizer.synthesize_step(&hypothesis, &step).await {
            SynthesisOutcome::Success { attempts, result } => StepRun {
                step,
                attempts,
                result: Some(result),
                error: None,
            },
            SynthesisOutcome::Failed { attempts, error } => {
                tracing::warn!(hypothesis = %hypothesis.id, step = %step.step_id, error = %error, "analysis step failed");
                StepRun {
                    step,
                    attempts,
                    result: None,
                    error: Some(error.to_string()),
                }
            }
        };
        steps.push(run);
    }
    let attempts: Vec<QueryAttempt> = steps.iter().flat_map(|s| s.attempts.iter().cloned()).collect();

    // Headline statistics: the first step with a two-group comparison,
    // else the first step with rows.
    let summaries: Vec<ExperimentSummary> = steps
        .iter()
        .filter_map(|s| s.result.as_ref())
        .map(|result| ExperimentSummary::from_result(result, config))
        .collect();
    let headline = summaries
        .iter()
        .position(|s| s.comparison.is_some())
        .unwrap_or(0);
    let Some(summary) = summaries.into_iter().nth(headline) else {
        let last_error = steps
            .iter()
            .rev()
            .find_map(|s| s.error.clone())
            .unwrap_or_default();
        let reason = format!("all {} analysis steps failed; last error: {last_error}", steps.len());
        tracing::warn!(hypothesis = %hypothesis.id, "every analysis step failed");
        let mut run = HypothesisRun::failed(hypothesis, reason, attempts);
        run.steps = steps;
        return run;
    };
    tracing::info!(
        hypothesis = %hypothesis.id,
        succeeded = steps.iter().filter(|s| s.succeeded()).count(),
        steps = steps.len(),
        "analysis steps finished"
    );

    let report = if config.report.render_with_llm {
        Some(
            ReportGenerator::new(llm, config)
                .render_steps(&hypothesis, &steps, &summary)
                .await,
        )
    } else {
        None
    };
    conclude(config, hypothesis, attempts, steps, summary, report)
}

fn conclude(
    config: &AnalysisConfig,
    hypothesis: Hypothesis,
    attempts: Vec<QueryAttempt>,
    steps: Vec<StepRun>,
    summary: ExperimentSummary,
    report: Option<ValidatedReport>,
) -> HypothesisRun {
    let significant = summary.is_significant(config);
    let outcome = match &report {
        Some(r) if !r.validated => ValidationOutcome::Unvalidated {
            reason: if r.fallback {
                "report generation produced no output".to_string()
            } else {
                r.problems.join("; ")
            },
        },
        _ => ValidationOutcome::Validated,
    };
    tracing::info!(hypothesis = %hypothesis.id, significant, status = outcome.label(), "hypothesis concluded");

    HypothesisRun {
        result: Some(ExperimentResult {
            hypothesis_id: hypothesis.id.clone(),
            summary,
            significant,
            report,
        }),
        hypothesis: hypothesis.with_validation(outcome),
        attempts,
        steps,
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct PipelineRunner {
    llm: Arc<dyn LLMProvider>,
    warehouse: Arc<dyn Warehouse>,
    config: Arc<AnalysisConfig>,
    store: ArtifactStore,
    meter: Option<Arc<UsageMeter>>,
}

impl PipelineRunner {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        warehouse: Arc<dyn Warehouse>,
        config: Arc<AnalysisConfig>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            llm,
            warehouse,
            config,
            store,
            meter: None,
        }
    }

    /// Include this meter's totals in the run summary.
    pub fn with_usage_meter(mut self, meter: Arc<UsageMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    async fn run_sequential(&self, hypotheses: Vec<Hypothesis>, inputs: &RunInputs) -> Vec<HypothesisRun> {
        let mut runs = Vec::with_capacity(hypotheses.len());
        for hypothesis in hypotheses {
            runs.push(
                process_hypothesis(
                    self.llm.as_ref(),
                    self.warehouse.as_ref(),
                    &self.config,
                    inputs,
                    hypothesis,
                )
                .await,
            );
        }
        runs
    }

    async fn run_concurrent(&self, hypotheses: Vec<Hypothesis>, inputs: &RunInputs) -> Vec<HypothesisRun> {
        let permits = Arc::new(Semaphore::new(self.config.processing.max_concurrent_requests.max(1)));
        let inputs = Arc::new(inputs.clone());

        let mut handles = Vec::with_capacity(hypotheses.len());
        for hypothesis in hypotheses {
            let llm = Arc::clone(&self.llm);
            let warehouse = Arc::clone(&self.warehouse);
            let config = Arc::clone(&self.config);
            let inputs = Arc::clone(&inputs);
            let permits = Arc::clone(&permits);
            let fallback = hypothesis.clone();
            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                process_hypothesis(llm.as_ref(), warehouse.as_ref(), &config, &inputs, hypothesis).await
            });
            handles.push((fallback, handle));
        }

        let mut runs = Vec::with_capacity(handles.len());
        for (hypothesis, handle) in handles {
            match handle.await {
                Ok(run) => runs.push(run),
                Err(err) => {
                    tracing::error!(hypothesis = %hypothesis.id, error = %err, "hypothesis task aborted");
                    runs.push(HypothesisRun::failed(
                        hypothesis,
                        format!("hypothesis task aborted: {err}"),
                        Vec::new(),
                    ));
                }
            }
        }
        runs
    }

    fn persist(&self, run: &HypothesisRun) -> Result<(), PipelineError> {
        if run.steps.is_empty() {
            if let Some(attempt) = run.attempts.last() {
                self.store.save_final_attempt(&run.hypothesis, attempt)?;
            }
        }
        for step in &run.steps {
            if let Some(attempt) = step.attempts.last() {
                self.store.save_step_attempt(&run.hypothesis, &step.step, attempt)?;
            }
        }
        if let Some(result) = &run.result {
            let text = match &result.report {
                Some(report) => report.text.clone(),
                None if run.steps.is_empty() => report::fallback_report(&run.hypothesis, &result.summary),
                None => format!(
                    "{}\n## Analysis steps\n\n{}",
                    report::fallback_report(&run.hypothesis, &result.summary),
                    report::step_results_text(&run.steps)
                ),
            };
            self.store.save_hypothesis_report(&run.hypothesis, &text)?;
        }
        Ok(())
    }

    /// Process every hypothesis, then write per-hypothesis artifacts, the
    /// integrated report and the run summary. Per-hypothesis failures are
    /// recorded, not returned; only artifact I/O aborts the run.
    pub async fn run(
        &self,
        hypotheses: Vec<Hypothesis>,
        inputs: RunInputs,
        mode: ExecutionMode,
    ) -> Result<RunOutput, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(
            %run_id,
            count = hypotheses.len(),
            ?mode,
            model = %self.llm.model_info().name,
            analysis_plan = self.config.processing.analysis_plan,
            "starting validation run"
        );
        self.store.ensure_dirs()?;

        let runs = match mode {
            ExecutionMode::Sequential => self.run_sequential(hypotheses, &inputs).await,
            ExecutionMode::Concurrent => self.run_concurrent(hypotheses, &inputs).await,
        };

        for run in &runs {
            self.persist(run)?;
        }

        let at = Local::now();
        let integrated = report::render_integrated_report(&runs, &self.config, &at);
        let integrated_report = self.store.save_integrated_report(&integrated, &at)?;

        let count = |label: &str| runs.iter().filter(|r| r.status_label() == label).count();
        let usage = self.meter.as_ref().map(|m| m.report());
        if let Some(usage) = &usage {
            tracing::info!(
                requests = usage.total_requests,
                failed = usage.failed_requests,
                tokens = usage.total_tokens,
                cost_usd = usage.estimated_cost_usd,
                "LLM usage"
            );
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            profile: self.config.profile,
            total: runs.len(),
            validated: count("validated"),
            unvalidated: count("unvalidated"),
            failed: count("failed"),
            hypotheses: runs.iter().map(HypothesisRun::status).collect(),
            usage,
            integrated_report,
        };
        let summary_path = self.store.save_run_summary(&summary)?;
        let archive_path = self.store.archive_run_summary(&summary, &at)?;
        tracing::info!(
            %run_id,
            validated = summary.validated,
            unvalidated = summary.unvalidated,
            failed = summary.failed,
            "validation run finished"
        );

        Ok(RunOutput {
            runs,
            summary,
            summary_path,
            archive_path,
        })
    }
}
