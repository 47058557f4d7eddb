//! Hypotheses and their validation status.

use crate::PipelineError;
use chrono::{DateTime, Utc};
use hypolab_llm::extract_json;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A testable business claim proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub summary: String,
    /// Segmenting conditions (event names, device, source, ...).
    #[serde(default)]
    pub conditions: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
}

impl Hypothesis {
    pub fn new(id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            summary: summary.into(),
            conditions: BTreeMap::new(),
            expected_outcome: String::new(),
            generated_at: Utc::now(),
            validation: None,
        }
    }

    pub fn with_validation(mut self, outcome: ValidationOutcome) -> Self {
        self.validation = Some(outcome);
        self
    }

    /// JSON shown to the model; validation state is not part of the claim.
    pub fn prompt_json(&self) -> String {
        let value = serde_json::json!({
            "id": self.id,
            "summary": self.summary,
            "conditions": self.conditions,
            "expected_outcome": self.expected_outcome,
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    }

    /// Identifier safe to use as a file stem.
    pub fn file_stem(&self) -> String {
        file_stem(&self.id)
    }
}

fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Give every hypothesis an id whose file stem no earlier hypothesis uses.
/// Empty and colliding ids become the next free `H001`-style id.
pub fn assign_unique_ids(hypotheses: &mut [Hypothesis]) {
    let mut used_stems = BTreeSet::new();
    let mut next = 1usize;
    for h in hypotheses.iter_mut() {
        let id = h.id.trim();
        if id.is_empty() || used_stems.contains(&file_stem(id)) {
            let replacement = loop {
                let candidate = format!("H{next:03}");
                next += 1;
                if !used_stems.contains(&candidate) {
                    break candidate;
                }
            };
            if !id.is_empty() {
                tracing::warn!(id, replacement = %replacement, "hypothesis id collides with an earlier one");
            }
            h.id = replacement;
        } else {
            h.id = id.to_string();
        }
        used_stems.insert(h.file_stem());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Query succeeded and the report passed every quality check.
    Validated,
    /// Query succeeded but the report never passed the quality checks.
    Unvalidated { reason: String },
    /// No query succeeded within the retry ceiling.
    Failed { reason: String, attempts: u32 },
}

impl ValidationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::Unvalidated { .. } => "unvalidated",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Lenient shape of one hypothesis as models actually emit it. Synonym
/// keys are separate fields so an entry carrying several of them still
/// parses.
#[derive(Debug, Deserialize)]
struct RawHypothesis {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    refined_hypothesis: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    hypothesis: Option<String>,
    #[serde(default)]
    statement: Option<String>,
    #[serde(default)]
    conditions: Option<serde_json::Value>,
    #[serde(default)]
    expected_outcome: Option<serde_json::Value>,
    #[serde(default)]
    expected_result: Option<serde_json::Value>,
    #[serde(default)]
    expected: Option<serde_json::Value>,
}

impl RawHypothesis {
    /// First non-empty text among the summary keys, refined text first.
    fn summary_text(&self) -> Option<&str> {
        [
            &self.refined_hypothesis,
            &self.summary,
            &self.hypothesis,
            &self.statement,
        ]
        .into_iter()
        .filter_map(|text| text.as_deref().map(str::trim))
        .find(|text| !text.is_empty())
    }

    fn expected_text(&mut self) -> String {
        [
            self.expected_outcome.take(),
            self.expected_result.take(),
            self.expected.take(),
        ]
        .into_iter()
        .flatten()
        .map(value_text)
        .find(|text| !text.trim().is_empty())
        .unwrap_or_default()
    }
}

fn value_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn conditions_map(value: Option<serde_json::Value>) -> BTreeMap<String, serde_json::Value> {
    match value {
        Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
        Some(serde_json::Value::Null) | None => BTreeMap::new(),
        Some(other) => BTreeMap::from([("description".to_string(), other)]),
    }
}

/// Parse model output into hypotheses.
///
/// Accepts a JSON array or an object holding a `hypotheses` array. Entries
/// without a summary are dropped. Missing ids, and ids whose file stem is
/// already taken, are replaced with the next free `H001`-style id.
pub fn parse_hypotheses(text: &str, generated_at: DateTime<Utc>) -> Result<Vec<Hypothesis>, PipelineError> {
    let value = extract_json(text)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("hypotheses") {
            Some(serde_json::Value::Array(items)) => items,
            _ => vec![serde_json::Value::Object(map)],
        },
        _ => return Err(PipelineError::NoHypotheses),
    };

    let mut hypotheses = Vec::new();
    for item in items {
        match serde_json::from_value::<RawHypothesis>(item) {
            Ok(mut h) => match h.summary_text().map(str::to_string) {
                Some(summary) => hypotheses.push(Hypothesis {
                    id: h.id.take().map(value_text).unwrap_or_default(),
                    summary,
                    expected_outcome: h.expected_text(),
                    conditions: conditions_map(h.conditions.take()),
                    generated_at,
                    validation: None,
                }),
                None => tracing::warn!("dropping hypothesis without a summary"),
            },
            Err(err) => tracing::warn!(error = %err, "dropping malformed hypothesis"),
        }
    }
    if hypotheses.is_empty() {
        return Err(PipelineError::NoHypotheses);
    }
    assign_unique_ids(&mut hypotheses);
    Ok(hypotheses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_array_with_aliases() {
        let text = r#"Here you go:
```json
[
  {"id": "H001", "summary": "Mobile converts worse", "conditions": {"device": "mobile"}, "expected_outcome": "lower rate"},
  {"hypothesis": "Organic traffic adds to cart more", "expected_result": {"delta": 0.1}}
]
```"#;
        let hs = parse_hypotheses(text, Utc::now()).unwrap();
        assert_eq!(hs.len(), 2);
        assert_eq!(hs[0].conditions["device"], "mobile");
        assert_eq!(hs[1].id, "H002");
        assert_eq!(hs[1].summary, "Organic traffic adds to cart more");
        assert_eq!(hs[1].expected_outcome, r#"{"delta":0.1}"#);
    }

    #[test]
    fn assigns_ids_without_collisions() {
        let text = r#"[{"summary": "a"}, {"id": "H001", "summary": "b"}, {"id": "H001", "summary": "c"}]"#;
        let ids: Vec<String> = parse_hypotheses(text, Utc::now())
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(ids, vec!["H001", "H002", "H003"]);
    }

    #[test]
    fn accepts_wrapped_object_and_numeric_ids() {
        let text = r#"{"hypotheses": [{"id": 7, "statement": "x", "conditions": "desktop only"}]}"#;
        let hs = parse_hypotheses(text, Utc::now()).unwrap();
        assert_eq!(hs[0].id, "7");
        assert_eq!(hs[0].conditions["description"], "desktop only");
    }

    #[test]
    fn rejects_output_without_hypotheses() {
        assert!(matches!(
            parse_hypotheses(r#"[{"id": "H001"}]"#, Utc::now()),
            Err(PipelineError::NoHypotheses)
        ));
        assert!(matches!(
            parse_hypotheses("I cannot help with that.", Utc::now()),
            Err(PipelineError::Parse(_))
        ));
    }

    #[test]
    fn saved_form_round_trips_with_validation() {
        let h = Hypothesis::new("H001", "s").with_validation(ValidationOutcome::Failed {
            reason: "syntax".to_string(),
            attempts: 2,
        });
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains(r#""status":"failed""#));
        let back: Hypothesis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn several_summary_keys_pick_one() {
        let text = r#"[
          {"id": "H001", "summary": "short", "hypothesis": "long form"},
          {"id": "H002", "summary": " ", "statement": "from statement", "expected": "up"},
          {"id": "H003", "hypothesis": "original", "refined_hypothesis": "refined"}
        ]"#;
        let hs = parse_hypotheses(text, Utc::now()).unwrap();
        let summaries: Vec<&str> = hs.iter().map(|h| h.summary.as_str()).collect();
        assert_eq!(summaries, vec!["short", "from statement", "refined"]);
        assert_eq!(hs[1].expected_outcome, "up");
    }

    #[test]
    fn ids_sharing_a_file_stem_are_renamed() {
        let text = r#"[{"id": "H1/a", "summary": "a"}, {"id": "H1_a", "summary": "b"}]"#;
        let hs = parse_hypotheses(text, Utc::now()).unwrap();
        assert_eq!(hs[0].id, "H1/a");
        assert_eq!(hs[1].id, "H001");
        assert_ne!(hs[0].file_stem(), hs[1].file_stem());
    }

    #[test]
    fn assigned_ids_skip_taken_stems() {
        let mut hs = vec![
            Hypothesis::new("H001", "a"),
            Hypothesis::new("", "b"),
            Hypothesis::new("H001", "c"),
        ];
        assign_unique_ids(&mut hs);
        let ids: Vec<&str> = hs.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["H001", "H002", "H003"]);
    }

    #[test]
    fn file_stem_is_filesystem_safe() {
        assert_eq!(Hypothesis::new("H001/refined v2", "s").file_stem(), "H001_refined_v2");
    }
}
