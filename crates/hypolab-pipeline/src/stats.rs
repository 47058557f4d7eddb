//! Descriptive statistics and control-vs-treatment comparison of a result.

use crate::prompts::{GROUP_COLUMN, RATE_COLUMN, SAMPLE_COLUMN};
use hypolab_config::AnalysisConfig;
use hypolab_warehouse::{Cell, ResultSet};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

const SAMPLE_ALIASES: &[&str] = &[SAMPLE_COLUMN, "users", "step3_users", "base_users"];
const RATE_ALIASES: &[&str] = &[RATE_COLUMN, "transition_rate", "rate"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl ColumnStats {
    fn from_values(name: &str, values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            name: name.to_string(),
            count: values.len(),
            mean: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub control_label: String,
    pub treatment_label: String,
    pub control_n: u64,
    pub treatment_n: u64,
    pub control_rate: f64,
    pub treatment_rate: f64,
    /// `(treatment - control) / control`; `None` when the control rate is 0.
    pub relative_effect: Option<f64>,
    /// Two-sided two-proportion z-test.
    pub p_value: Option<f64>,
    /// Normal-approximation interval for the treatment rate.
    pub treatment_interval: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub row_count: usize,
    pub columns: Vec<ColumnStats>,
    pub comparison: Option<Comparison>,
}

impl ExperimentSummary {
    pub fn from_result(result: &ResultSet, config: &AnalysisConfig) -> Self {
        let columns = result
            .numeric_column_names()
            .into_iter()
            .filter_map(|name| ColumnStats::from_values(name, &result.numeric_column(name)))
            .collect();
        Self {
            row_count: result.row_count(),
            columns,
            comparison: compare_groups(result, config),
        }
    }

    /// Significance needs a comparison, enough samples in both groups and a
    /// large enough effect; a p-value, when computable, must also clear alpha.
    pub fn is_significant(&self, config: &AnalysisConfig) -> bool {
        let Some(cmp) = &self.comparison else {
            return false;
        };
        let Some(effect) = cmp.relative_effect else {
            return false;
        };
        config.has_min_sample(cmp.control_n.min(cmp.treatment_n))
            && config.is_significant_effect(effect)
            && cmp.p_value.map_or(true, |p| config.is_significant_p(p))
    }

    /// Plain-text rendering for prompts and reports.
    pub fn describe(&self) -> String {
        let mut out = format!("rows: {}\n", self.row_count);
        for c in &self.columns {
            out.push_str(&format!(
                "{}: count={} mean={:.4} min={:.4} max={:.4}\n",
                c.name, c.count, c.mean, c.min, c.max
            ));
        }
        if let Some(cmp) = &self.comparison {
            out.push_str(&format!(
                "{} (control): n={} rate={:.4}\n{} (treatment): n={} rate={:.4}\n",
                cmp.control_label,
                cmp.control_n,
                cmp.control_rate,
                cmp.treatment_label,
                cmp.treatment_n,
                cmp.treatment_rate
            ));
            if let Some(effect) = cmp.relative_effect {
                out.push_str(&format!("relative effect: {:+.2}%\n", effect * 100.0));
            }
            if let Some(p) = cmp.p_value {
                out.push_str(&format!("p-value: {p:.4}\n"));
            }
        }
        out
    }
}

fn find_column(result: &ResultSet, names: &[&str]) -> Option<usize> {
    names.iter().find_map(|n| result.column_index(n))
}

fn label_matches(cell: &Cell, labels: &[&str]) -> bool {
    cell.as_str()
        .is_some_and(|s| labels.iter().any(|l| s.trim().eq_ignore_ascii_case(l)))
}

fn find_row<'r>(result: &'r ResultSet, col: usize, labels: &[&str]) -> Option<&'r [Cell]> {
    result
        .rows
        .iter()
        .find(|row| row.get(col).is_some_and(|c| label_matches(c, labels)))
        .map(Vec::as_slice)
}

fn number(row: &[Cell], idx: usize) -> Option<f64> {
    row.get(idx).and_then(Cell::as_f64)
}

/// Locate the control and treatment rows. The group column is
/// `group_type` when present, otherwise the first text column holding both
/// device labels.
fn compare_groups(result: &ResultSet, config: &AnalysisConfig) -> Option<Comparison> {
    let sample_idx = find_column(result, SAMPLE_ALIASES)?;
    let rate_idx = find_column(result, RATE_ALIASES)?;

    let control_labels = ["control", config.device.default_control.as_str()];
    let treatment_labels = ["treatment", config.device.default_treatment.as_str()];

    let candidate_columns: Vec<usize> = match result.column_index(GROUP_COLUMN) {
        Some(idx) => vec![idx],
        None => (0..result.columns.len()).collect(),
    };
    let (control_row, treatment_row) = candidate_columns.into_iter().find_map(|col| {
        Some((
            find_row(result, col, &control_labels)?,
            find_row(result, col, &treatment_labels)?,
        ))
    })?;

    let control_n = number(control_row, sample_idx)?.max(0.0) as u64;
    let treatment_n = number(treatment_row, sample_idx)?.max(0.0) as u64;
    let control_rate = number(control_row, rate_idx)?;
    let treatment_rate = number(treatment_row, rate_idx)?;

    let relative_effect =
        (control_rate > 0.0).then(|| (treatment_rate - control_rate) / control_rate);

    Some(Comparison {
        control_label: config.device.default_control.clone(),
        treatment_label: config.device.default_treatment.clone(),
        control_n,
        treatment_n,
        control_rate,
        treatment_rate,
        relative_effect,
        p_value: two_proportion_p_value(control_rate, control_n, treatment_rate, treatment_n),
        treatment_interval: rate_interval(
            treatment_rate,
            treatment_n,
            config.statistical.confidence_level,
        ),
    })
}

/// Two-sided p-value of the pooled two-proportion z-test. `None` when either
/// group is empty, a rate is outside [0, 1], or the pooled variance is zero.
pub fn two_proportion_p_value(p1: f64, n1: u64, p2: f64, n2: u64) -> Option<f64> {
    if n1 == 0 || n2 == 0 || !(0.0..=1.0).contains(&p1) || !(0.0..=1.0).contains(&p2) {
        return None;
    }
    let (n1, n2) = (n1 as f64, n2 as f64);
    let pooled = (p1 * n1 + p2 * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se <= 0.0 || !se.is_finite() {
        return None;
    }
    let z = (p2 - p1) / se;
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some((2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0))
}

/// Normal-approximation confidence interval for a proportion.
pub fn rate_interval(rate: f64, n: u64, confidence: f64) -> Option<(f64, f64)> {
    if n == 0 || !(0.0..=1.0).contains(&rate) || !(0.0..1.0).contains(&confidence) {
        return None;
    }
    let normal = Normal::new(0.0, 1.0).ok()?;
    let z = normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0);
    let margin = z * (rate * (1.0 - rate) / n as f64).sqrt();
    Some(((rate - margin).max(0.0), (rate + margin).min(1.0)))
}
