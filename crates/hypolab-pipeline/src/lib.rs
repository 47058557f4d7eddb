//! Hypolab pipeline: hypotheses in, validated experiment reports out.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                    HYPOTHESIS VALIDATION PIPELINE                      │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                                                                       │
//! │  schema.txt ──┐                                                       │
//! │               ├──► Generator ──► hypotheses.json                      │
//! │  exploration ─┘    (+ critique/refine rounds)                         │
//! │                                        │                              │
//! │                          per hypothesis▼                              │
//! │  ┌──────────────┐  SQL   ┌───────────┐  rows  ┌──────────────┐        │
//! │  │     LLM      │───────►│ Warehouse │───────►│  Statistics  │        │
//! │  └──────▲───────┘        └─────┬─────┘        └──────┬───────┘        │
//! │         │   previous SQL + error │                   │                │
//! │         └────────────────────────┘                   ▼                │
//! │          (bounded corrective retries)        Report + quality loop    │
//! │                                                      │                │
//! │                                                      ▼                │
//! │                              {id}_report.md, integrated report,       │
//! │                              run_summary.json                         │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each hypothesis is processed independently. A hypothesis that exhausts
//! its retry ceiling is marked failed and the run moves on. With
//! `processing.analysis_plan` on, the SQL loop runs once per planned step
//! (see [`plan`]) and the step results share one report.

pub mod artifacts;
pub mod generator;
pub mod hypothesis;
pub mod plan;
pub mod prompts;
pub mod report;
pub mod runner;
pub mod stats;
pub mod synthesis;

pub use artifacts::ArtifactStore;
pub use generator::HypothesisGenerator;
pub use hypothesis::{assign_unique_ids, parse_hypotheses, Hypothesis, ValidationOutcome};
pub use plan::{parse_plan, AnalysisPlanner, AnalysisStep, StepRun};
pub use report::{check_report, ComparisonFocus, ReportGenerator, ValidatedReport};
pub use runner::{
    ExecutionMode, ExperimentResult, HypothesisRun, HypothesisStatus, PipelineRunner, RunInputs,
    RunOutput, RunSummary, StepStatus,
};
pub use stats::{Comparison, ExperimentSummary};
pub use synthesis::{AttemptOutcome, QueryAttempt, SqlSynthesizer, SynthesisError, SynthesisOutcome};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] hypolab_config::ConfigError),
    #[error("LLM request failed: {0}")]
    Llm(#[from] hypolab_llm::LLMError),
    #[error("could not parse model output: {0}")]
    Parse(#[from] hypolab_llm::ParseError),
    #[error(transparent)]
    Warehouse(#[from] hypolab_warehouse::WarehouseError),
    #[error("model output contained no usable hypotheses")]
    NoHypotheses,
    #[error("model output contained no usable analysis steps")]
    NoAnalysisSteps,
    #[error("model returned an empty {what}")]
    EmptyAnswer { what: &'static str },
    #[error("no run summaries to compare")]
    NothingToCompare,
    #[error("no questions given")]
    NoQuestions,
    #[error("could not encode run data: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("required input {path} is missing; run the earlier stage first")]
    MissingInput { path: PathBuf },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
