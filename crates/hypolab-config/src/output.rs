//! Output path layout.
//!
//! Everything lives under two roots: `data_dir` for pipeline inputs
//! (schema text, exploration notes, the hypothesis list) and `base_dir` for
//! results (SQL attempts, reports, run log, run summary).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub filename_prefix: String,
    pub timestamp_format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("results"),
            data_dir: PathBuf::from("data"),
            filename_prefix: "analysis_results".to_string(),
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
        }
    }
}

impl OutputConfig {
    pub fn schema_file(&self) -> PathBuf {
        self.data_dir.join("schemas").join("schema.txt")
    }

    pub fn exploration_file(&self) -> PathBuf {
        self.data_dir.join("schemas").join("data_exploration.txt")
    }

    pub fn hypotheses_file(&self) -> PathBuf {
        self.data_dir.join("hypotheses").join("hypotheses.json")
    }

    pub fn llm_responses_dir(&self) -> PathBuf {
        self.base_dir.join("llm_responses")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.base_dir.join("reports")
    }

    pub fn hypothesis_reports_dir(&self) -> PathBuf {
        self.reports_dir().join("hypothesis_reports")
    }

    pub fn log_file(&self) -> PathBuf {
        self.base_dir.join("hypolab.log")
    }

    pub fn run_summary_file(&self) -> PathBuf {
        self.base_dir.join("run_summary.json")
    }

    pub fn timestamp(&self, at: &DateTime<Local>) -> String {
        at.format(&self.timestamp_format).to_string()
    }

    /// `base_dir/{prefix}_{timestamp}_{filename}`.
    pub fn output_path(&self, filename: &str, at: &DateTime<Local>) -> PathBuf {
        self.base_dir.join(format!(
            "{}_{}_{}",
            self.filename_prefix,
            self.timestamp(at),
            filename
        ))
    }

    /// `reports_dir/{report_type}_{timestamp}.md`.
    pub fn report_path(&self, report_type: &str, at: &DateTime<Local>) -> PathBuf {
        self.reports_dir()
            .join(format!("{report_type}_{}.md", self.timestamp(at)))
    }

    /// Directories the pipeline writes into.
    pub fn directories(&self) -> Vec<PathBuf> {
        let parent = |p: PathBuf| p.parent().map(Path::to_path_buf).unwrap_or_default();
        vec![
            parent(self.schema_file()),
            parent(self.hypotheses_file()),
            self.llm_responses_dir(),
            self.hypothesis_reports_dir(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamped_paths() {
        let output = OutputConfig::default();
        let at = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(
            output.report_path("quantitative_report", &at),
            PathBuf::from("results/reports/quantitative_report_20240305_140709.md")
        );
        assert_eq!(
            output.output_path("results.json", &at),
            PathBuf::from("results/analysis_results_20240305_140709_results.json")
        );
    }

    #[test]
    fn directories_follow_roots() {
        let output = OutputConfig {
            base_dir: PathBuf::from("/tmp/out"),
            data_dir: PathBuf::from("/tmp/in"),
            ..Default::default()
        };
        let dirs = output.directories();
        assert!(dirs.contains(&PathBuf::from("/tmp/in/schemas")));
        assert!(dirs.contains(&PathBuf::from("/tmp/out/reports/hypothesis_reports")));
    }
}
