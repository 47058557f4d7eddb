//! Stage implementations behind the subcommands.

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use hypolab_config::AnalysisConfig;
use hypolab_llm::{LLMConfig, LLMProvider, MeteredProvider, PacedProvider, UnifiedClient, UsageMeter};
use hypolab_pipeline::prompts::DEFAULT_FOCUS;
use hypolab_pipeline::{
    ArtifactStore, ComparisonFocus, ExecutionMode, HypothesisGenerator, PipelineRunner, ReportGenerator,
    RunInputs, RunSummary,
};
use hypolab_warehouse::schema::render_schema;
use hypolab_warehouse::{BigQueryClient, BigQueryConfig, TokenSource, Warehouse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Session {
    pub config: Arc<AnalysisConfig>,
    pub store: ArtifactStore,
    pub meter: Arc<UsageMeter>,
}

impl Session {
    pub fn new(config: AnalysisConfig) -> Self {
        let store = ArtifactStore::new(config.output.clone());
        Self {
            config: Arc::new(config),
            store,
            meter: Arc::new(UsageMeter::new()),
        }
    }

    fn llm(&self) -> Result<Arc<dyn LLMProvider>> {
        let mut llm_config = LLMConfig::from_env()
            .context("no LLM configured; set OPENAI_API_KEY, ANTHROPIC_API_KEY or LOCAL_LLM_URL")?;
        if !self.config.llm.model.trim().is_empty() {
            llm_config = llm_config.with_model(&self.config.llm.model);
        }
        llm_config = llm_config.with_timeout_secs(self.config.processing.request_timeout_secs);
        tracing::info!(provider = ?llm_config.provider, model = %llm_config.model, "LLM client ready");

        let client: Arc<dyn LLMProvider> = Arc::new(UnifiedClient::from_config(llm_config)?);
        let interval = Duration::from_millis(self.config.processing.min_request_interval_ms);
        let paced = Arc::new(PacedProvider::new(client, interval));
        Ok(Arc::new(MeteredProvider::new(paced, Arc::clone(&self.meter))))
    }

    fn warehouse(&self) -> Result<Arc<dyn Warehouse>> {
        let bq = BigQueryConfig::from_analysis(&self.config)
            .context("warehouse queries need a billing project (GCP_PROJECT_ID or --project)")?;
        Ok(Arc::new(BigQueryClient::new(bq, TokenSource::from_env())?))
    }
}

fn wrote(what: &str, path: &Path) {
    eprintln!("{} {} {}", "wrote".green().bold(), what, path.display().to_string().bold());
}

pub async fn extract_schema(session: &Session, skip_exploration: bool) -> Result<()> {
    let config = &session.config;
    let warehouse = session.warehouse()?;
    session.store.ensure_dirs()?;

    eprintln!("{} {}", "Extracting schema".green().bold(), config.full_table_reference());
    let schema = hypolab_warehouse::extract_schema(warehouse.as_ref(), config)
        .await
        .context("extracting table schema")?;
    let at = Local::now();
    let path = session.store.write_schema(&render_schema(&schema, config, &at))?;
    wrote("schema", &path);
    eprintln!("  {} {} fields, {} shards", "→".yellow(), schema.fields.len(), schema.shard_count);

    if skip_exploration {
        return Ok(());
    }
    let exploration = hypolab_warehouse::explore(warehouse.as_ref(), config).await;
    for (key, error) in &exploration.skipped {
        eprintln!("  {} exploration query {key} skipped: {error}", "warn:".yellow().bold());
    }
    if exploration.sections.is_empty() {
        tracing::warn!("no exploration query succeeded; exploration file not written");
        return Ok(());
    }
    let path = session
        .store
        .write_exploration(&exploration.render(config, &at))?;
    wrote("exploration", &path);
    Ok(())
}

pub async fn generate(session: &Session, focus: Option<&str>) -> Result<()> {
    let config = &session.config;
    let schema = session.store.read_schema()?;
    let exploration = session.store.read_exploration()?;
    let llm = session.llm()?;

    let focus = focus.unwrap_or(DEFAULT_FOCUS);
    eprintln!("{} {} hypotheses", "Generating".green().bold(), config.processing.hypothesis_count);
    let hypotheses = HypothesisGenerator::new(llm.as_ref(), config)
        .generate(&schema, exploration.as_deref(), focus)
        .await
        .context("generating hypotheses")?;

    for h in &hypotheses {
        eprintln!("  {} {} {}", "→".yellow(), h.id.bold(), h.summary);
    }
    let path = session.store.save_hypotheses(&hypotheses)?;
    wrote("hypotheses", &path);
    Ok(())
}

pub async fn validate(session: &Session, parallel: bool) -> Result<()> {
    let hypotheses = session.store.load_hypotheses()?;
    let inputs = RunInputs {
        schema_text: session.store.read_schema()?,
        exploration: session.store.read_exploration()?,
    };
    let mode = if parallel {
        ExecutionMode::Concurrent
    } else {
        ExecutionMode::Sequential
    };

    let plan = if session.config.processing.analysis_plan {
        format!(", up to {} analysis steps each", session.config.processing.max_analysis_steps)
    } else {
        String::new()
    };
    eprintln!("{} {} hypotheses{plan}", "Validating".green().bold(), hypotheses.len());
    let runner = PipelineRunner::new(
        session.llm()?,
        session.warehouse()?,
        Arc::clone(&session.config),
        session.store.clone(),
    )
    .with_usage_meter(Arc::clone(&session.meter));
    let output = runner.run(hypotheses, inputs, mode).await?;

    print_summary(&output.summary);
    wrote("run summary", &output.summary_path);
    wrote("archived run summary", &output.archive_path);
    Ok(())
}

fn last_run(session: &Session) -> Result<(PathBuf, RunSummary)> {
    let path = session.config.output.run_summary_file();
    let summary = session
        .store
        .load_run_summary(&path)
        .with_context(|| format!("reading {}; run `hypolab validate` first", path.display()))?;
    Ok((path, summary))
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Without options, print the last run. `compare` writes a comparison
/// report over archived summaries; `questions` writes answers about the
/// last run.
pub async fn report(
    session: &Session,
    compare: &[PathBuf],
    focus: ComparisonFocus,
    questions: &[String],
) -> Result<()> {
    if !compare.is_empty() {
        let mut runs = Vec::with_capacity(compare.len());
        for path in compare {
            let summary = session
                .store
                .load_run_summary(path)
                .with_context(|| format!("reading run summary {}", path.display()))?;
            runs.push((source_name(path), summary));
        }
        eprintln!("{} {} runs ({focus})", "Comparing".green().bold(), runs.len());
        let llm = session.llm()?;
        let at = Local::now();
        let text = ReportGenerator::new(llm.as_ref(), &session.config)
            .compare_runs(&runs, focus, &at)
            .await
            .context("writing comparison report")?;
        let path = session.store.save_comparison_report(&text, &at)?;
        wrote("comparison report", &path);
        return Ok(());
    }

    let (path, summary) = last_run(session)?;
    if questions.is_empty() {
        print_summary(&summary);
        return Ok(());
    }

    eprintln!("{} {} questions", "Answering".green().bold(), questions.len());
    let llm = session.llm()?;
    let at = Local::now();
    let text = ReportGenerator::new(llm.as_ref(), &session.config)
        .answer_questions(&source_name(&path), &summary, questions, &at)
        .await
        .context("answering questions")?;
    let path = session.store.save_custom_report(&text, &at)?;
    wrote("custom analysis", &path);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} run {} ({:?} profile)",
        "Summary".green().bold(),
        summary.run_id,
        summary.profile
    );
    for h in &summary.hypotheses {
        let status = match h.status.as_str() {
            "validated" => h.status.green().bold(),
            "unvalidated" => h.status.yellow().bold(),
            _ => h.status.red().bold(),
        };
        let significance = match h.significant {
            Some(true) => " significant",
            Some(false) => " not significant",
            None => "",
        };
        println!("  {} {:<12} {} SQL attempts{}", h.id.bold(), status, h.sql_attempts, significance);
        for step in &h.steps {
            println!("      {} {} {}", step.step_id, step.title, step.status.dimmed());
        }
        if let Some(reason) = &h.reason {
            println!("      {}", reason.dimmed());
        }
    }
    println!(
        "  {} validated, {} unvalidated, {} failed of {}",
        summary.validated, summary.unvalidated, summary.failed, summary.total
    );
    if let Some(usage) = &summary.usage {
        println!(
            "  LLM: {} requests ({} failed), {} tokens, ~${:.4}",
            usage.total_requests, usage.failed_requests, usage.total_tokens, usage.estimated_cost_usd
        );
    }
    println!("  report: {}", summary.integrated_report.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypolab_config::OutputConfig;

    fn session_in(dir: &Path) -> Session {
        let mut config = AnalysisConfig::default();
        config.output = OutputConfig {
            base_dir: dir.join("results"),
            data_dir: dir.join("data"),
            ..Default::default()
        };
        Session::new(config)
    }

    #[tokio::test]
    async fn report_without_a_run_points_at_validate() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let err = report(&session, &[], ComparisonFocus::default(), &[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("run `hypolab validate` first"));
    }

    #[tokio::test]
    async fn comparison_of_a_missing_file_fails_before_any_llm_call() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let missing = dir.path().join("gone_run_summary.json");
        let err = report(&session, &[missing], ComparisonFocus::Performance, &[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("gone_run_summary.json"));
    }

    #[test]
    fn source_names_are_file_names() {
        assert_eq!(source_name(Path::new("results/a_run_summary.json")), "a_run_summary.json");
    }
}
