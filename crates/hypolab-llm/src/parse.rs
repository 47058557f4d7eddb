//! Boundary parsing for model output.
//!
//! Models are asked for bare SQL or bare JSON and frequently wrap it in
//! markdown fences or prose anyway. Everything that turns raw completion text
//! into something typed goes through this module.

use serde::de::DeserializeOwned;

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("model returned an empty response")]
    Empty,
    #[error("model did not return JSON (no '{{' or '[' found)")]
    NoJson,
    #[error("model returned invalid JSON: {0}")]
    InvalidJson(String),
}

/// Remove markdown code fencing around generated text.
///
/// Returns the contents of the first fenced block (dropping a language tag
/// such as `sql` or `json`), trimmed. Text without any fence is returned
/// unchanged, so stripping is idempotent.
pub fn strip_code_fence(text: &str) -> String {
    let Some(open) = text.find(FENCE) else {
        return text.to_string();
    };
    let after_open = &text[open + FENCE.len()..];

    // Inline fence: ```SELECT 1```
    let first_newline = after_open.find('\n');
    if let Some(close) = after_open.find(FENCE) {
        if first_newline.map_or(true, |nl| close < nl) {
            return after_open[..close].trim().to_string();
        }
    }

    let body = match first_newline {
        Some(nl) if is_language_tag(&after_open[..nl]) => &after_open[nl + 1..],
        Some(_) => after_open,
        None => after_open.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };

    let inner = match body.find(FENCE) {
        Some(close) => &body[..close],
        None => body,
    };
    inner.trim().to_string()
}

fn is_language_tag(line: &str) -> bool {
    let tag = line.trim();
    let is_keyword = matches!(tag.to_ascii_uppercase().as_str(), "SELECT" | "WITH");
    !is_keyword
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
}

/// Extract the first complete JSON value (object or array) from model text.
pub fn extract_json(text: &str) -> Result<serde_json::Value, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Ok(v);
    }

    let unfenced = strip_code_fence(trimmed);
    if unfenced != trimmed {
        if let Ok(v) = serde_json::from_str(&unfenced) {
            return Ok(v);
        }
    }

    // Best-effort: balance brackets outside strings from the first opener.
    let Some(start) = unfenced.find(|c| c == '{' || c == '[') else {
        return Err(ParseError::NoJson);
    };

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut end: Option<usize> = None;

    for (idx, ch) in unfenced.char_indices().skip_while(|(i, _)| *i < start) {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }

    let Some(end) = end else {
        return Err(ParseError::InvalidJson(
            "unbalanced brackets in model output".to_string(),
        ));
    };
    serde_json::from_str(&unfenced[start..=end]).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

/// [`extract_json`] followed by typed deserialization.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let value = extract_json(text)?;
    serde_json::from_value(value).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_sql_fence() {
        let text = "```sql\nSELECT 1\nFROM t\n```";
        assert_eq!(strip_code_fence(text), "SELECT 1\nFROM t");
    }

    #[test]
    fn strips_fence_without_tag() {
        assert_eq!(strip_code_fence("```\nSELECT 1\n```\n"), "SELECT 1");
    }

    #[test]
    fn strips_inline_fence() {
        assert_eq!(strip_code_fence("```SELECT 1```"), "SELECT 1");
    }

    #[test]
    fn strips_fence_surrounded_by_prose() {
        let text = "Here is the query:\n```sql\nSELECT 2\n```\nIt counts users.";
        assert_eq!(strip_code_fence(text), "SELECT 2");
    }

    #[test]
    fn keeps_first_line_when_not_a_tag() {
        assert_eq!(strip_code_fence("```SELECT *\nFROM t\n```"), "SELECT *\nFROM t");
    }

    #[test]
    fn keyword_first_line_is_not_a_tag() {
        assert_eq!(strip_code_fence("```\nWITH a AS (SELECT 1)\nSELECT * FROM a\n```"), "WITH a AS (SELECT 1)\nSELECT * FROM a");
        assert_eq!(strip_code_fence("```SELECT\n*\nFROM t\n```"), "SELECT\n*\nFROM t");
    }

    #[test]
    fn handles_missing_closing_fence() {
        assert_eq!(strip_code_fence("```sql\nSELECT 3\n"), "SELECT 3");
    }

    #[test]
    fn unfenced_text_is_unchanged() {
        let sql = "SELECT event_name FROM t WHERE x = 1";
        assert_eq!(strip_code_fence(sql), sql);
    }

    #[test]
    fn extracts_array_from_fenced_json() {
        let text = "Sure!\n```json\n[{\"id\": \"H001\"}, {\"id\": \"H002\"}]\n```";
        let value = extract_json(text).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn extracts_object_from_prose() {
        let text = "Result: {\"a\": {\"b\": \"}\"}} trailing words";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"]["b"], "}");
    }

    #[test]
    fn reports_empty_and_missing_json() {
        assert_eq!(extract_json("   "), Err(ParseError::Empty));
        assert_eq!(extract_json("no json here"), Err(ParseError::NoJson));
        assert!(matches!(extract_json("[1, 2"), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn parse_json_types_the_value() {
        #[derive(serde::Deserialize)]
        struct Row {
            id: String,
        }
        let rows: Vec<Row> = parse_json("```json\n[{\"id\": \"H9\"}]\n```").unwrap();
        assert_eq!(rows[0].id, "H9");
    }

    proptest! {
        #[test]
        fn stripping_is_idempotent(body in "[a-zA-Z0-9_ ,.*=<>()'\n]{0,80}", tag in "(sql|json|)", fenced in any::<bool>()) {
            let text = if fenced { format!("```{tag}\n{body}\n```") } else { body.clone() };
            let once = strip_code_fence(&text);
            prop_assert_eq!(strip_code_fence(&once), once.clone());
            if !fenced {
                prop_assert_eq!(once, body);
            }
        }
    }
}
