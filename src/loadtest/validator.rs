//! Response assertions.
//!
//! [`ValidationRules`] is the serializable form found in `[validation]` and in
//! per-step `validate` blocks. [`Validator`] is the compiled form: regexes and
//! JSONPath expressions are parsed once when the plan or workflow is loaded.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json_path::JsonPath;

use crate::loadtest::error::LoadTestError;
use crate::loadtest::jsonpath;
use crate::loadtest::metrics::RequestResult;

/// Assertions applied to every response. All configured rules must pass.
///
/// With no rules configured, any response that arrived passes, whatever its
/// status code.
///
/// # Example TOML
///
/// ```toml
/// [validation]
/// status = 200
/// contains = "\"ok\":true"
/// regex = "id\":\\s*\\d+"
/// json_path = "$.data.state"
/// json_value = "ready"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Exact expected status code.
    #[serde(alias = "status_code", skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Substring that must appear in the body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Pattern that must match somewhere in the body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// JSONPath that must select a node in the body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Expected value at `json_path`, compared as strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_value: Option<serde_json::Value>,
}

impl ValidationRules {
    /// `true` when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.contains.is_none()
            && self.regex.is_none()
            && self.json_path.is_none()
    }
}

/// Outcome of validating one result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    /// One entry per failed rule.
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reasons: Vec::new(),
        }
    }

    fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            passed: reasons.is_empty(),
            reasons,
        }
    }
}

/// Compiled [`ValidationRules`].
#[derive(Debug, Clone, Default)]
pub struct Validator {
    status: Option<u16>,
    contains: Option<String>,
    regex: Option<Regex>,
    json_path: Option<(String, JsonPath)>,
    json_value: Option<String>,
}

impl Validator {
    /// Compiles the rules, rejecting invalid regex and JSONPath expressions.
    pub fn new(rules: &ValidationRules) -> Result<Self, LoadTestError> {
        let regex = rules
            .regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| LoadTestError::validation(format!("invalid validation regex: {e}")))?;

        let json_path = match rules.json_path.as_deref() {
            Some(expr) => Some((
                expr.to_string(),
                jsonpath::parse(expr).map_err(LoadTestError::validation)?,
            )),
            None => None,
        };

        if rules.json_value.is_some() && json_path.is_none() {
            return Err(LoadTestError::validation(
                "validation json_value requires json_path",
            ));
        }

        Ok(Self {
            status: rules.status,
            contains: rules.contains.clone(),
            regex,
            json_path,
            json_value: rules.json_value.as_ref().map(jsonpath::value_to_string),
        })
    }

    /// `true` when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.contains.is_none()
            && self.regex.is_none()
            && self.json_path.is_none()
    }

    /// Evaluates every configured rule against `result`.
    pub fn validate(&self, result: &RequestResult) -> Verdict {
        if let Some(ref err) = result.error {
            return Verdict::from_reasons(vec![format!("no response: {err}")]);
        }
        if self.is_empty() {
            return Verdict::pass();
        }

        let mut reasons = Vec::new();
        let body = result.body();

        if let Some(expected) = self.status {
            match result.status {
                Some(actual) if actual == expected => {},
                Some(actual) => reasons.push(format!("expected status {expected}, got {actual}")),
                None => reasons.push(format!("expected status {expected}, got none")),
            }
        }

        if let Some(ref needle) = self.contains {
            if !body.contains(needle.as_str()) {
                reasons.push(format!("body does not contain '{needle}'"));
            }
        }

        if let Some(ref regex) = self.regex {
            if !regex.is_match(body) {
                reasons.push(format!("body does not match /{}/", regex.as_str()));
            }
        }

        if let Some((ref expr, ref path)) = self.json_path {
            match serde_json::from_str::<serde_json::Value>(body) {
                Err(_) => reasons.push(format!("body is not JSON, cannot evaluate '{expr}'")),
                Ok(document) => match jsonpath::first_match(path, &document) {
                    None => reasons.push(format!("'{expr}' matched nothing")),
                    Some(found) => {
                        if let Some(ref expected) = self.json_value {
                            let actual = jsonpath::value_to_string(found);
                            if &actual != expected {
                                reasons.push(format!(
                                    "'{expr}' is '{actual}', expected '{expected}'"
                                ));
                            }
                        }
                    },
                },
            }
        }

        Verdict::from_reasons(reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::error::{ErrorKind, RequestError};
    use crate::loadtest::metrics::ResponseData;
    use std::time::{Duration, Instant};

    fn response(status: u16, body: &str) -> RequestResult {
        RequestResult::completed(
            Instant::now(),
            Duration::from_millis(1),
            status,
            ResponseData {
                headers: Vec::new(),
                body: body.to_string(),
            },
        )
    }

    #[test]
    fn test_no_rules_passes_any_status() {
        let validator = Validator::new(&ValidationRules::default()).unwrap();
        assert!(validator.validate(&response(500, "")).passed);
        assert!(validator.validate(&response(404, "nope")).passed);
    }

    #[test]
    fn test_transport_error_fails() {
        let validator = Validator::new(&ValidationRules::default()).unwrap();
        let result = RequestResult::failed(
            Instant::now(),
            Duration::from_secs(10),
            RequestError::new(ErrorKind::Timeout, "timed out"),
        );
        let verdict = validator.validate(&result);
        assert!(!verdict.passed);
        assert!(verdict.reasons[0].starts_with("no response"));
    }

    #[test]
    fn test_status_rule() {
        let rules = ValidationRules {
            status: Some(201),
            ..Default::default()
        };
        let validator = Validator::new(&rules).unwrap();
        assert!(validator.validate(&response(201, "")).passed);
        let verdict = validator.validate(&response(200, ""));
        assert!(!verdict.passed);
        assert_eq!(verdict.reasons, vec!["expected status 201, got 200"]);
    }

    #[test]
    fn test_all_rules_must_pass() {
        let rules = ValidationRules {
            status: Some(200),
            contains: Some("ready".to_string()),
            regex: Some(r#""id":\s*\d+"#.to_string()),
            ..Default::default()
        };
        let validator = Validator::new(&rules).unwrap();
        assert!(validator.validate(&response(200, r#"{"id": 5, "s": "ready"}"#)).passed);

        let verdict = validator.validate(&response(200, r#"{"id": "x"}"#));
        assert!(!verdict.passed);
        assert_eq!(verdict.reasons.len(), 2, "{:?}", verdict.reasons);
    }

    #[test]
    fn test_json_value_is_type_coerced() {
        let rules = ValidationRules {
            json_path: Some("$.count".to_string()),
            json_value: Some(serde_json::json!("3")),
            ..Default::default()
        };
        let validator = Validator::new(&rules).unwrap();
        assert!(validator.validate(&response(200, r#"{"count": 3}"#)).passed);
        assert!(!validator.validate(&response(200, r#"{"count": 4}"#)).passed);
    }

    #[test]
    fn test_json_path_existence_only() {
        let rules = ValidationRules {
            json_path: Some("data.id".to_string()),
            ..Default::default()
        };
        let validator = Validator::new(&rules).unwrap();
        assert!(validator.validate(&response(200, r#"{"data": {"id": 1}}"#)).passed);
        assert!(!validator.validate(&response(200, r#"{"data": {}}"#)).passed);
        assert!(!validator.validate(&response(200, "not json")).passed);
    }

    #[test]
    fn test_invalid_regex_rejected_at_compile() {
        let rules = ValidationRules {
            regex: Some("(unclosed".to_string()),
            ..Default::default()
        };
        let err = Validator::new(&rules).unwrap_err();
        assert!(err.to_string().contains("invalid validation regex"));
    }

    #[test]
    fn test_json_value_without_path_rejected() {
        let rules = ValidationRules {
            json_value: Some(serde_json::json!(1)),
            ..Default::default()
        };
        assert!(Validator::new(&rules).is_err());
    }

    #[test]
    fn test_status_code_alias_in_toml() {
        let rules: ValidationRules = toml::from_str("status_code = 204").unwrap();
        assert_eq!(rules.status, Some(204));
    }
}
