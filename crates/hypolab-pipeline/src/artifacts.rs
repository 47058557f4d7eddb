//! File artifacts exchanged between pipeline stages.

use crate::hypothesis::{assign_unique_ids, Hypothesis};
use crate::plan::AnalysisStep;
use crate::runner::RunSummary;
use crate::synthesis::QueryAttempt;
use crate::PipelineError;
use chrono::{DateTime, Local};
use hypolab_config::OutputConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output: OutputConfig,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Serialize)]
struct StoredAttempt<'a> {
    hypothesis_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<&'a str>,
    sql: &'a str,
    attempt: u32,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    timestamp: String,
}

impl ArtifactStore {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    pub fn ensure_dirs(&self) -> Result<(), PipelineError> {
        for dir in self.output.directories() {
            std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(())
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::write(path, contents).map_err(io_err(path))?;
        tracing::debug!(path = %path.display(), bytes = contents.len(), "wrote artifact");
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), PipelineError> {
        let text = serde_json::to_string_pretty(value).map_err(|source| PipelineError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        self.write(path, &text)
    }

    pub fn write_schema(&self, text: &str) -> Result<PathBuf, PipelineError> {
        let path = self.output.schema_file();
        self.write(&path, text)?;
        Ok(path)
    }

    /// The schema text is a required input of every later stage.
    pub fn read_schema(&self) -> Result<String, PipelineError> {
        let path = self.output.schema_file();
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::MissingInput { path })
            }
            Err(source) => Err(PipelineError::Io { path, source }),
        }
    }

    pub fn write_exploration(&self, text: &str) -> Result<PathBuf, PipelineError> {
        let path = self.output.exploration_file();
        self.write(&path, text)?;
        Ok(path)
    }

    /// Exploration notes are optional; a missing file yields `None`.
    pub fn read_exploration(&self) -> Result<Option<String>, PipelineError> {
        let path = self.output.exploration_file();
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PipelineError::Io { path, source }),
        }
    }

    pub fn save_hypotheses(&self, hypotheses: &[Hypothesis]) -> Result<PathBuf, PipelineError> {
        let path = self.output.hypotheses_file();
        self.write_json(&path, hypotheses)?;
        Ok(path)
    }

    pub fn load_hypotheses(&self) -> Result<Vec<Hypothesis>, PipelineError> {
        let path = self.output.hypotheses_file();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::MissingInput { path })
            }
            Err(source) => return Err(PipelineError::Io { path, source }),
        };
        let mut hypotheses: Vec<Hypothesis> =
            serde_json::from_str(&text).map_err(|source| PipelineError::Json { path, source })?;
        assign_unique_ids(&mut hypotheses);
        Ok(hypotheses)
    }

    /// Persist the attempt that decided a hypothesis: the success, or the
    /// last failure.
    pub fn save_final_attempt(&self, hypothesis: &Hypothesis, attempt: &QueryAttempt) -> Result<PathBuf, PipelineError> {
        let path = self
            .output
            .llm_responses_dir()
            .join(format!("{}.json", hypothesis.file_stem()));
        self.save_attempt(&path, attempt)?;
        Ok(path)
    }

    /// Same as [`Self::save_final_attempt`] for one step of an analysis plan.
    pub fn save_step_attempt(
        &self,
        hypothesis: &Hypothesis,
        step: &AnalysisStep,
        attempt: &QueryAttempt,
    ) -> Result<PathBuf, PipelineError> {
        let path = self
            .output
            .llm_responses_dir()
            .join(format!("{}_{}.json", hypothesis.file_stem(), step.file_stem()));
        self.save_attempt(&path, attempt)?;
        Ok(path)
    }

    fn save_attempt(&self, path: &Path, attempt: &QueryAttempt) -> Result<(), PipelineError> {
        let stored = StoredAttempt {
            hypothesis_id: &attempt.hypothesis_id,
            step_id: attempt.step_id.as_deref(),
            sql: &attempt.sql,
            attempt: attempt.attempt,
            status: if attempt.is_success() { "success" } else { "error" },
            error: attempt.error(),
            timestamp: attempt.created_at.to_rfc3339(),
        };
        self.write_json(path, &stored)
    }

    pub fn save_hypothesis_report(&self, hypothesis: &Hypothesis, text: &str) -> Result<PathBuf, PipelineError> {
        let path = self
            .output
            .hypothesis_reports_dir()
            .join(format!("{}_report.md", hypothesis.file_stem()));
        self.write(&path, text)?;
        Ok(path)
    }

    pub fn save_integrated_report(&self, text: &str, at: &DateTime<Local>) -> Result<PathBuf, PipelineError> {
        let path = self.output.report_path("quantitative_report", at);
        self.write(&path, text)?;
        Ok(path)
    }

    pub fn save_run_summary(&self, summary: &RunSummary) -> Result<PathBuf, PipelineError> {
        let path = self.output.run_summary_file();
        self.write_json(&path, summary)?;
        Ok(path)
    }

    /// Timestamped copy of a run summary that later runs do not overwrite;
    /// these are the inputs of run comparisons.
    pub fn archive_run_summary(&self, summary: &RunSummary, at: &DateTime<Local>) -> Result<PathBuf, PipelineError> {
        let path = self.output.output_path("run_summary.json", at);
        self.write_json(&path, summary)?;
        Ok(path)
    }

    pub fn load_run_summary(&self, path: &Path) -> Result<RunSummary, PipelineError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::MissingInput {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(PipelineError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| PipelineError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_comparison_report(&self, text: &str, at: &DateTime<Local>) -> Result<PathBuf, PipelineError> {
        let path = self.output.report_path("comparison_report", at);
        self.write(&path, text)?;
        Ok(path)
    }

    pub fn save_custom_report(&self, text: &str, at: &DateTime<Local>) -> Result<PathBuf, PipelineError> {
        let path = self.output.report_path("custom_analysis", at);
        self.write(&path, text)?;
        Ok(path)
    }
}
