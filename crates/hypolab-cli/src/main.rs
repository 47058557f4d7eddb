//! Hypolab CLI
//!
//! Stage-by-stage entry points for the hypothesis pipeline:
//! - `extract-schema`: table metadata and data exploration to text
//! - `generate`: hypotheses from the schema text
//! - `validate`: SQL synthesis, execution and reports per hypothesis
//! - `report`: last run summary, run comparisons and custom questions
//! - `run`: all of the above in one go

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hypolab_config::{
    AnalysisConfig, ConfigOverrides, DateRangeOverrides, EnvSource, ProcessEnv, ProcessingOverrides, Profile,
    ReportOverrides, TableOverrides,
};
use hypolab_pipeline::ComparisonFocus;
use std::path::PathBuf;

mod commands;
mod logging;

use commands::Session;

#[derive(Parser)]
#[command(name = "hypolab")]
#[command(author, version, about = "Hypolab: LLM-generated business hypotheses, validated in BigQuery")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Configuration profile: development, production, testing or demo.
    #[arg(long, global = true)]
    profile: Option<Profile>,

    /// JSON file of configuration overrides (highest precedence).
    #[arg(long, global = true, value_name = "FILE")]
    overrides: Option<PathBuf>,

    /// Billing project for warehouse queries.
    #[arg(long, global = true)]
    project: Option<String>,

    /// First table shard date (YYYYMMDD).
    #[arg(long, global = true)]
    start_date: Option<String>,

    /// Last table shard date (YYYYMMDD).
    #[arg(long, global = true)]
    end_date: Option<String>,

    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone, Copy)]
struct ValidateArgs {
    /// Process hypotheses concurrently, bounded by processing.max_concurrent_requests.
    #[arg(long)]
    parallel: bool,

    /// Skip LLM report rendering; write only the quantitative summaries.
    #[arg(long)]
    no_llm_report: bool,

    /// Plan several analysis steps per hypothesis, each with its own query.
    #[arg(long)]
    multi_step: bool,
}

#[derive(Args)]
struct ReportArgs {
    /// Compare archived run summaries with the LLM instead of printing the last run.
    #[arg(long, value_name = "FILE", num_args = 1.., conflicts_with = "questions")]
    compare: Vec<PathBuf>,

    /// What the comparison concentrates on: performance, hypothesis_quality,
    /// time_efficiency or business_impact.
    #[arg(long, default_value = "performance")]
    focus: ComparisonFocus,

    /// Question about the last run, answered by the LLM. Repeatable.
    #[arg(long = "question", value_name = "TEXT")]
    questions: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the table schema (and exploration notes) into the data directory.
    ExtractSchema {
        /// Skip the data exploration queries.
        #[arg(long)]
        skip_exploration: bool,
    },

    /// Generate hypotheses from the extracted schema.
    Generate {
        /// What the hypotheses should be about.
        #[arg(long)]
        focus: Option<String>,
    },

    /// Validate saved hypotheses against the warehouse.
    Validate(ValidateArgs),

    /// Print the summary of the last validation run, compare archived runs,
    /// or ask questions about the last run.
    Report(ReportArgs),

    /// Extract, generate and validate in one go.
    Run {
        #[arg(long)]
        focus: Option<String>,

        /// Reuse an existing schema file instead of extracting it again.
        #[arg(long)]
        reuse_schema: bool,

        #[command(flatten)]
        validate: ValidateArgs,
    },

    /// Configuration commands.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration as JSON.
    Show,
}

fn load_config(global: &GlobalArgs, validate: Option<&ValidateArgs>) -> Result<AnalysisConfig> {
    load_config_from(&ProcessEnv, global, validate)
}

/// Command-line flags over the overrides file over the environment.
fn load_config_from(
    env: &dyn EnvSource,
    global: &GlobalArgs,
    validate: Option<&ValidateArgs>,
) -> Result<AnalysisConfig> {
    let file = match &global.overrides {
        Some(path) => ConfigOverrides::from_json_file(path)?,
        None => ConfigOverrides::default(),
    };
    let flags = ConfigOverrides {
        profile: global.profile,
        date_range: DateRangeOverrides {
            start_date: global.start_date.clone(),
            end_date: global.end_date.clone(),
            ..Default::default()
        },
        table: TableOverrides {
            project_id: global.project.clone(),
            ..Default::default()
        },
        processing: ProcessingOverrides {
            analysis_plan: validate.and_then(|v| v.multi_step.then_some(true)),
            ..Default::default()
        },
        report: ReportOverrides {
            render_with_llm: validate.and_then(|v| v.no_llm_report.then_some(false)),
            ..Default::default()
        },
        ..Default::default()
    };
    AnalysisConfig::resolve(env, &file.layered(flags)).context("resolving configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let validate = match &cli.command {
        Commands::Validate(args) | Commands::Run { validate: args, .. } => Some(args),
        _ => None,
    };
    let config = load_config(&cli.global, validate)?;

    if let Commands::Config {
        command: ConfigCommands::Show,
    } = &cli.command
    {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init(Some(&config.output.log_file()), cli.global.verbose)?;
    let session = Session::new(config);

    match cli.command {
        Commands::ExtractSchema { skip_exploration } => {
            commands::extract_schema(&session, skip_exploration).await?;
        }
        Commands::Generate { focus } => {
            commands::generate(&session, focus.as_deref()).await?;
        }
        Commands::Validate(args) => {
            commands::validate(&session, args.parallel).await?;
        }
        Commands::Report(args) => {
            commands::report(&session, &args.compare, args.focus, &args.questions).await?;
        }
        Commands::Run {
            focus,
            reuse_schema,
            validate,
        } => {
            if reuse_schema && session.config.output.schema_file().exists() {
                tracing::info!("reusing existing schema file");
            } else {
                commands::extract_schema(&session, false).await?;
            }
            commands::generate(&session, focus.as_deref()).await?;
            commands::validate(&session, validate.parallel).await?;
        }
        Commands::Config { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(vars: &[(&str, &str)]) -> BTreeMap<String, String> {
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn validate_args(cli: &Cli) -> Option<&ValidateArgs> {
        match &cli.command {
            Commands::Validate(args) | Commands::Run { validate: args, .. } => Some(args),
            _ => None,
        }
    }

    #[test]
    fn flags_beat_overrides_file_beats_environment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("overrides.json");
        std::fs::write(
            &file,
            r#"{"table": {"project_id": "from-file", "dataset_id": "file_ds"}, "date_range": {"start_date": "20210105"}}"#,
        )
        .unwrap();
        let env = env(&[
            ("GCP_PROJECT_ID", "from-env"),
            ("GCP_DATASET_ID", "env_ds"),
            ("HYPOLAB_START_DATE", "20210102"),
            ("HYPOLAB_END_DATE", "20210120"),
        ]);
        let cli = Cli::try_parse_from([
            "hypolab",
            "--overrides",
            file.to_str().unwrap(),
            "--project",
            "from-flag",
            "validate",
            "--multi-step",
            "--no-llm-report",
        ])
        .unwrap();

        let config = load_config_from(&env, &cli.global, validate_args(&cli)).unwrap();
        assert_eq!(config.table.project_id, "from-flag");
        assert_eq!(config.table.dataset_id, "file_ds");
        assert_eq!(config.date_range.start_date, "20210105");
        assert_eq!(config.date_range.end_date, "20210120");
        assert!(config.processing.analysis_plan);
        assert!(!config.report.render_with_llm);
    }

    #[test]
    fn validate_flags_only_apply_when_given() {
        let env = env(&[("HYPOLAB_ANALYSIS_PLAN", "true")]);
        let cli = Cli::try_parse_from(["hypolab", "report"]).unwrap();
        let config = load_config_from(&env, &cli.global, validate_args(&cli)).unwrap();
        assert!(config.processing.analysis_plan);
        assert!(config.report.render_with_llm);
    }

    #[test]
    fn invalid_overrides_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("overrides.json");
        std::fs::write(&file, r#"{"table": {"no_such_field": 1}}"#).unwrap();
        let cli = Cli::try_parse_from(["hypolab", "--overrides", file.to_str().unwrap(), "config", "show"]).unwrap();
        assert!(load_config_from(&env(&[]), &cli.global, None).is_err());
    }

    #[test]
    fn report_parses_comparison_and_questions() {
        let cli = Cli::try_parse_from(["hypolab", "report", "--compare", "a.json", "b.json", "--focus", "business"]).unwrap();
        let Commands::Report(args) = cli.command else {
            panic!("expected report");
        };
        assert_eq!(args.compare, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
        assert_eq!(args.focus, ComparisonFocus::BusinessImpact);

        let cli = Cli::try_parse_from(["hypolab", "report", "--question", "Why?", "--question", "What next?"]).unwrap();
        let Commands::Report(args) = cli.command else {
            panic!("expected report");
        };
        assert_eq!(args.questions, vec!["Why?", "What next?"]);

        assert!(Cli::try_parse_from(["hypolab", "report", "--compare", "a.json", "--question", "Why?"]).is_err());
        assert!(Cli::try_parse_from(["hypolab", "report", "--focus", "speed"]).is_err());
    }
}
