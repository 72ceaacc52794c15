//! Workflow Output Extraction
//!
//! The engine prints the workflow outputs as one JSON object right before
//! it exits. The object starts with a line holding only `{` and ends with a
//! line holding only `}`; an empty result is printed as `{}`.

use log::warn;
use serde_json::Value;

use crate::run::JsonMap;

/// Extracts the outputs object from the end of an engine log.
///
/// Returns `None` if no object could be found or parsed. An empty object is
/// returned as `Some` with an empty map.
///
/// ```
/// use wesrunner::execution::outputs::parse_outputs;
///
/// let log = vec!["INFO Final process status is success".to_string(), "{}".to_string()];
/// assert_eq!(parse_outputs(&log).map(|o| o.len()), Some(0));
/// ```
pub fn parse_outputs(log: &[String]) -> Option<JsonMap> {
    let mut end = None;
    for (index, line) in log.iter().enumerate().rev() {
        match line.trim_end() {
            "{}" => return Some(JsonMap::new()),
            "}" => {
                end = Some(index);
                break;
            }
            _ => {}
        }
    }

    let end = end.filter(|&end| end > 0)?;
    let start = log[..end].iter().rposition(|line| line.trim_end() == "{")?;

    let block = log[start..=end].join("\n");
    match serde_json::from_str::<Value>(&block) {
        Ok(Value::Object(outputs)) => Some(outputs),
        Ok(other) => {
            warn!("Workflow outputs are not a JSON object: {}", other);
            None
        }
        Err(e) => {
            warn!("Could not parse workflow outputs '{}': {}", block, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_empty_object() {
        let log = lines("INFO starting\n[job main] completed success\n{}");
        assert_eq!(parse_outputs(&log), Some(JsonMap::new()));
    }

    #[test]
    fn test_nested_outputs_block() {
        let log = lines(
            "[step main] produced output {\n    \"x\": 1\n}\n\
             INFO Final process status is success\n\
             {\n    \"result\": {\n        \"class\": \"File\",\n        \"size\": 12\n    }\n}\n",
        );
        let outputs = parse_outputs(&log).unwrap();
        assert_eq!(outputs["result"]["size"], json!(12));
        assert!(outputs.get("x").is_none());
    }

    #[test]
    fn test_missing_closing_brace() {
        let log = lines("INFO starting\n{\n    \"result\": 1\n");
        assert_eq!(parse_outputs(&log), None);
    }

    #[test]
    fn test_brace_on_first_line_only() {
        assert_eq!(parse_outputs(&lines("}")), None);
        assert_eq!(parse_outputs(&[]), None);
    }

    #[test]
    fn test_unparsable_block() {
        let log = lines("{\n    not json\n}");
        assert_eq!(parse_outputs(&log), None);
    }

    #[test]
    fn test_trailing_whitespace_tolerated() {
        let log = lines("{  \n    \"a\": true\n}   ");
        assert_eq!(parse_outputs(&log).unwrap()["a"], json!(true));
    }
}
