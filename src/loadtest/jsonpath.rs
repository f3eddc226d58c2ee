//! Thin wrapper over `serde_json_path` shared by extraction and validation.

use serde_json::Value;
use serde_json_path::JsonPath;

/// Parses a JSONPath expression, adding the leading `$` when it is missing.
///
/// `token`, `.token` and `$.token` all select the same node.
pub fn parse(expression: &str) -> Result<JsonPath, String> {
    let trimmed = expression.trim();
    let normalized = if trimmed.starts_with('$') {
        trimmed.to_string()
    } else if trimmed.starts_with('.') || trimmed.starts_with('[') {
        format!("${trimmed}")
    } else {
        format!("$.{trimmed}")
    };
    JsonPath::parse(&normalized).map_err(|e| format!("invalid JSONPath '{expression}': {e}"))
}

/// Returns the first node selected by `path`, if any.
pub fn first_match<'a>(path: &JsonPath, document: &'a Value) -> Option<&'a Value> {
    path.query(document).first()
}

/// Renders a JSON value for use as a variable or comparison string.
///
/// Strings are returned without quotes; everything else uses compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_adds_missing_root() {
        let doc = json!({"token": "abc123"});
        for expr in ["$.token", ".token", "token"] {
            let path = parse(expr).unwrap();
            assert_eq!(first_match(&path, &doc), Some(&json!("abc123")), "{expr}");
        }
    }

    #[test]
    fn test_nested_and_indexed() {
        let doc = json!({"data": {"items": [{"id": 7}, {"id": 8}]}});
        let path = parse("$.data.items[1].id").unwrap();
        assert_eq!(first_match(&path, &doc), Some(&json!(8)));
    }

    #[test]
    fn test_no_match_returns_none() {
        let doc = json!({"a": 1});
        let path = parse("$.b").unwrap();
        assert!(first_match(&path, &doc).is_none());
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        assert!(parse("$[").is_err());
    }

    #[test]
    fn test_value_to_string_unquotes_strings() {
        assert_eq!(value_to_string(&json!("x")), "x");
        assert_eq!(value_to_string(&json!(42)), "42");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "null");
    }
}
