//! Prompt construction. Pure functions of config and inputs.

use crate::hypothesis::Hypothesis;
use crate::plan::AnalysisStep;
use hypolab_config::{AnalysisConfig, ReportLanguage, ReportStyle};

pub const DEFAULT_FOCUS: &str = "drop-off causes and improvement levers along the e-commerce \
     purchase funnel (item view, add to cart, checkout, purchase)";

pub const SQL_SYSTEM: &str = "You are a BigQuery Standard SQL expert. Reply with one SQL query and nothing else.";
pub const ANALYST_SYSTEM: &str = "You are a senior marketing data analyst.";

/// Columns the statistics stage recognises for group comparisons.
pub const GROUP_COLUMN: &str = "group_type";
pub const SAMPLE_COLUMN: &str = "sample_size";
pub const RATE_COLUMN: &str = "conversion_rate";

const HYPOTHESIS_FORMAT: &str = r#"{
  "hypotheses": [
    {
      "id": "H001",
      "summary": "one-sentence hypothesis",
      "conditions": {"event_name": "...", "device": "...", "other": "..."},
      "expected_outcome": "what the data should show if the hypothesis holds"
    }
  ]
}"#;

const PLAN_FORMAT: &str = r#"{
  "analysis_steps": [
    {
      "step_id": "step1",
      "title": "short title",
      "purpose": "what this step establishes",
      "sql_requirements": ["requirement 1", "requirement 2"]
    }
  ]
}"#;

fn exploration_block(exploration: Option<&str>) -> String {
    match exploration {
        Some(text) if !text.trim().is_empty() => {
            format!("## Observed data (event names and values that exist)\n{}\n\n", text.trim())
        }
        _ => String::new(),
    }
}

pub fn generation_prompt(
    config: &AnalysisConfig,
    schema_text: &str,
    exploration: Option<&str>,
    focus: &str,
) -> String {
    let count = config.processing.hypothesis_count;
    format!(
        "Using the event-log schema and observed data below, propose {count} testable \
         hypotheses about: {focus}.\n\n\
         ## Schema\n{schema}\n\n\
         {explore}\
         Only reference event names and field values that appear above \
         (for example {events}).\n\n\
         Return a JSON object holding exactly {count} hypotheses in this format:\n{HYPOTHESIS_FORMAT}\n",
        schema = schema_text.trim(),
        explore = exploration_block(exploration),
        events = config.events.all_events().join(", "),
    )
}

pub fn critique_prompt(hypotheses_json: &str) -> String {
    format!(
        "Critically review these hypotheses.\n\n{hypotheses_json}\n\n\
         For each one assess: whether it can be measured in BigQuery, whether the comparison \
         baseline is explicit, its business value, statistical validity (sample size, bias), \
         and feasibility. List concrete weaknesses and improvement suggestions per id.\n"
    )
}

pub fn refine_prompt(hypotheses_json: &str, critique: &str, count: usize) -> String {
    format!(
        "Improve the hypotheses using the review.\n\n## Hypotheses\n{hypotheses_json}\n\n\
         ## Review\n{critique}\n\n\
         Fix the weaknesses, make every comparison baseline explicit and keep the ids. \
         Return a JSON object holding {count} hypotheses in this format:\n{HYPOTHESIS_FORMAT}\n"
    )
}

/// Previous failed attempt fed back into the next SQL prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correction {
    pub sql: Option<String>,
    pub error: String,
}

pub fn plan_prompt(
    config: &AnalysisConfig,
    schema_text: &str,
    exploration: Option<&str>,
    hypothesis: &Hypothesis,
    max_steps: usize,
) -> String {
    format!(
        "Plan how to test the hypothesis below with at most {max_steps} BigQuery queries.\n\n\
         ## Schema\n```\n{schema}\n```\n\n\
         {explore}\
         ## Hypothesis\n```json\n{hypothesis}\n```\n\n\
         Each step answers one question. Make the comparison baseline of every step explicit \
         (for example {control} vs {treatment}) and look at the hypothesis from more than one \
         angle.\n\n\
         Return a JSON object in this format and nothing else:\n{PLAN_FORMAT}\n",
        schema = schema_text.trim(),
        explore = exploration_block(exploration),
        hypothesis = hypothesis.prompt_json(),
        control = config.device.default_control,
        treatment = config.device.default_treatment,
    )
}

/// SQL prompt for one step of an analysis plan, or for the whole
/// hypothesis when `step` is `None`.
pub fn sql_prompt(
    config: &AnalysisConfig,
    schema_text: &str,
    exploration: Option<&str>,
    hypothesis: &Hypothesis,
    step: Option<&AnalysisStep>,
    correction: Option<&Correction>,
) -> String {
    let target = if step.is_some() {
        "the analysis step below"
    } else {
        "the hypothesis below"
    };
    let mut prompt = format!(
        "Write a BigQuery Standard SQL query that tests {target}.\n\n\
         ## Schema\n```\n{schema}\n```\n\n\
         {explore}\
         ## Hypothesis\n```json\n{hypothesis}\n```\n\n",
        schema = schema_text.trim(),
        explore = exploration_block(exploration),
        hypothesis = hypothesis.prompt_json(),
    );
    if let Some(step) = step {
        prompt.push_str(&format!("## Analysis step\n{}\n", step.prompt_block()));
    }
    prompt.push_str(&format!(
        "## Requirements\n\
         1. Read from {table}{public}.\n\
         2. Include `WHERE {date}`.\n\
         3. Use only event names and values that exist in the data; a purchase is `{purchase}`.\n\
         4. Segment according to the hypothesis conditions (device category, traffic source, ...).\n\
         5. When the hypothesis compares two groups (for example {control} vs {treatment}), return \
         one row per group with the columns `{GROUP_COLUMN}` ('control' or 'treatment'), \
         `{SAMPLE_COLUMN}` (distinct users) and `{RATE_COLUMN}` (between 0 and 1).\n",
        table = config.full_table_reference(),
        public = if config.table.is_public_dataset() {
            " (a read-only public dataset; do not create or modify tables)"
        } else {
            ""
        },
        date = config.date_filter(false),
        purchase = config.schema.purchase_event_condition(),
        control = config.device.default_control,
        treatment = config.device.default_treatment,
    ));
    if !config.processing.required_columns.is_empty() {
        prompt.push_str(&format!(
            "6. The result must contain the columns: {}.\n",
            config.processing.required_columns.join(", ")
        ));
    }

    if let Some(correction) = correction {
        prompt.push_str("\n## The previous attempt failed\n");
        if let Some(sql) = correction.sql.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!("Query:\n```sql\n{sql}\n```\n"));
        }
        prompt.push_str(&format!(
            "Error:\n```\n{}\n```\nFix the problem and return a corrected query.\n",
            correction.error
        ));
    }

    prompt.push_str("\nReturn only the SQL, without explanation.\n");
    prompt
}

pub fn style_instruction(style: &ReportStyle) -> String {
    match style {
        ReportStyle::ExecutiveSummary => {
            "an executive summary for leadership, focused on business value".to_string()
        }
        ReportStyle::TechnicalDetail => {
            "a detailed technical analysis for analysts, including statistical method".to_string()
        }
        ReportStyle::ActionItems => "a prioritised list of actionable next steps".to_string(),
        ReportStyle::VisualInsights => {
            "an insight report that describes the charts a reader should look at".to_string()
        }
        ReportStyle::StakeholderUpdate => "a progress update for stakeholders".to_string(),
        ReportStyle::Custom(text) if !text.trim().is_empty() => text.trim().to_string(),
        ReportStyle::Custom(_) => "a standard analysis report".to_string(),
    }
}

pub fn language_instruction(language: ReportLanguage) -> &'static str {
    match language {
        ReportLanguage::English => "Write in professional English with a clear structure.",
        ReportLanguage::Japanese => "日本語で、ビジネス文書として適切な形式で書いてください。",
        ReportLanguage::Chinese => "请用专业的中文撰写。",
        ReportLanguage::Mixed => {
            "Write mainly in Japanese and give key technical terms in English alongside."
        }
    }
}

pub fn report_prompt(
    config: &AnalysisConfig,
    hypothesis: &Hypothesis,
    result_table: &str,
    statistics: &str,
    problems: &[String],
) -> String {
    let sections = config
        .report
        .required_sections
        .iter()
        .map(|s| format!("`{s}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut prompt = format!(
        "Analyse the result of testing this hypothesis and write {style} in markdown.\n\
         {language}\n\n\
         ## Hypothesis\n```json\n{hypothesis}\n```\n\n\
         ## Query result\n{result_table}\n\n\
         ## Statistics\n{statistics}\n\n\
         ## Report requirements\n\
         1. State clearly whether the hypothesis is supported.\n\
         2. Quote the numbers that support the conclusion.\n\
         3. Include business implications and improvement proposals.\n\
         4. Use section headings that contain the words {sections} verbatim.\n",
        style = style_instruction(&config.report.style),
        language = language_instruction(config.report.language),
        hypothesis = hypothesis.prompt_json(),
    );
    if !problems.is_empty() {
        prompt.push_str("\n## Problems with the previous report\n");
        for problem in problems {
            prompt.push_str(&format!("- {problem}\n"));
        }
        prompt.push_str("Address every problem in the new report.\n");
    }
    prompt
}

/// Compare several archived runs. `runs_json` holds the run summaries keyed
/// by file name.
pub fn comparison_prompt(config: &AnalysisConfig, runs_json: &str, focus: &str) -> String {
    format!(
        "Compare the analysis runs below and write a {focus} report in markdown.\n\
         {language}\n\n\
         ## Runs\n```json\n{runs_json}\n```\n\n\
         ## Report requirements\n\
         1. Compare the key figures of each run in a table.\n\
         2. Point out what improved and what got worse.\n\
         3. Describe trends across the runs.\n\
         4. Identify the most effective approach.\n\
         5. Suggest improvements for the next run.\n",
        language = language_instruction(config.report.language),
    )
}

/// Answer caller-supplied questions about one run.
pub fn questions_prompt(config: &AnalysisConfig, results_json: &str, questions: &[String]) -> String {
    let numbered = questions
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {}", i + 1, q.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Answer the questions below about this analysis run, in markdown.\n\
         {language}\n\n\
         ## Run results\n```json\n{results_json}\n```\n\n\
         ## Questions\n{numbered}\n\n\
         For each question give a clear answer, the evidence from the data behind it, and a \
         practical implication.\n",
        language = language_instruction(config.report.language),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.table.project_id = "billing".to_string();
        config
    }

    #[test]
    fn sql_prompt_carries_date_filter_and_table() {
        let h = Hypothesis::new("H001", "Mobile users convert less");
        let prompt = sql_prompt(&config(), "schema", None, &h, None, None);
        assert!(prompt.contains("_TABLE_SUFFIX BETWEEN '20201101' AND '20210131'"));
        assert!(prompt.contains(&config().full_table_reference()));
        assert!(!prompt.contains("previous attempt failed"));
    }

    #[test]
    fn sql_prompt_feeds_back_previous_error() {
        let h = Hypothesis::new("H001", "x");
        let correction = Correction {
            sql: Some("SELECT devise FROM t".to_string()),
            error: "Unrecognized name: devise".to_string(),
        };
        let prompt = sql_prompt(&config(), "schema", Some("events"), &h, None, Some(&correction));
        assert!(prompt.contains("SELECT devise FROM t"));
        assert!(prompt.contains("Unrecognized name: devise"));
        assert!(prompt.contains("## Observed data"));
    }

    #[test]
    fn sql_prompt_lists_required_columns() {
        let mut config = config();
        config.processing.required_columns = vec!["step3_users".to_string(), "step4_users".to_string()];
        let prompt = sql_prompt(&config, "s", None, &Hypothesis::new("H1", "x"), None, None);
        assert!(prompt.contains("step3_users, step4_users"));
    }

    #[test]
    fn report_prompt_lists_problems_and_sections() {
        let prompt = report_prompt(
            &config(),
            &Hypothesis::new("H001", "x"),
            "| a |",
            "rows: 1",
            &["report is too short".to_string()],
        );
        assert!(prompt.contains("`Hypothesis`"));
        assert!(prompt.contains("- report is too short"));
        assert!(prompt.contains("executive summary"));
    }

    #[test]
    fn step_prompt_names_the_step_and_purchase_event() {
        let step = AnalysisStep {
            step_id: "step2".to_string(),
            title: "Device comparison".to_string(),
            purpose: "Mobile against desktop".to_string(),
            sql_requirements: vec!["one row per group".to_string()],
        };
        let h = Hypothesis::new("H001", "Mobile converts less");
        let prompt = sql_prompt(&config(), "schema", None, &h, Some(&step), None);
        assert!(prompt.contains("tests the analysis step below"));
        assert!(prompt.contains("- **Title**: Device comparison"));
        assert!(prompt.contains("one row per group"));
        assert!(prompt.contains("a purchase is `event_name = 'purchase'`"));
        assert!(prompt.contains("read-only public dataset"));
    }

    #[test]
    fn own_dataset_is_not_called_public() {
        let mut config = config();
        config.table.public_dataset_project = None;
        let prompt = sql_prompt(&config, "s", None, &Hypothesis::new("H1", "x"), None, None);
        assert!(!prompt.contains("public dataset"));
        assert!(prompt.contains("`billing.ga4_obfuscated_sample_ecommerce.events_*`"));
    }

    #[test]
    fn plan_prompt_caps_steps_and_asks_for_object() {
        let prompt = plan_prompt(&config(), "schema", Some("events"), &Hypothesis::new("H1", "x"), 3);
        assert!(prompt.contains("at most 3 BigQuery queries"));
        assert!(prompt.contains("\"analysis_steps\""));
        assert!(prompt.contains("desktop vs mobile"));
    }

    #[test]
    fn generation_prompt_asks_for_hypotheses_object() {
        let prompt = generation_prompt(&config(), "schema", None, DEFAULT_FOCUS);
        assert!(prompt.contains("\"hypotheses\": ["));
        assert!(prompt.contains("exactly 5 hypotheses"));
    }

    #[test]
    fn questions_are_numbered() {
        let questions = vec!["Why is mobile lower?".to_string(), " What first? ".to_string()];
        let prompt = questions_prompt(&config(), "{}", &questions);
        assert!(prompt.contains("1. Why is mobile lower?\n2. What first?"));
    }

    #[test]
    fn custom_style_uses_its_text() {
        let style = ReportStyle::Custom("a one-paragraph memo".to_string());
        assert_eq!(style_instruction(&style), "a one-paragraph memo");
    }
}
