//! `${name}` template resolution against a per-user [`ScenarioContext`].
//!
//! A reference to a variable that is not set is an error: the caller fails the
//! step instead of sending a request that still contains the literal token.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::loadtest::error::RequestError;

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("variable pattern is valid")
});

/// Variables and cookies owned by a single virtual user.
///
/// Seeded with a base set when the user starts. Extraction writes into it after
/// each step; [`ScenarioContext::reset`] restores the base set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioContext {
    base: BTreeMap<String, String>,
    vars: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
}

impl ScenarioContext {
    /// Creates a context whose base set is `base`.
    pub fn new<I, K, V>(base: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let base: BTreeMap<String, String> = base
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            vars: base.clone(),
            base,
            cookies: BTreeMap::new(),
        }
    }

    /// The base set every virtual user starts with: `base_url` and `user_id`.
    pub fn seeded(base_url: &str, user_id: u32) -> Self {
        Self::new([
            ("base_url", base_url.to_string()),
            ("user_id", user_id.to_string()),
        ])
    }

    /// Returns the current value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Sets `name` to `value`, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Number of variables currently set, base set included.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Drops everything extracted so far, including cookies.
    pub fn reset(&mut self) {
        self.vars = self.base.clone();
        self.cookies.clear();
    }

    /// Cookies received from the server during this user's run.
    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    /// Stores every `Set-Cookie` pair from a response header list.
    pub fn absorb_set_cookies<'a, I>(&mut self, headers: I)
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("set-cookie") {
                if let Some((cookie, val)) = parse_set_cookie(value) {
                    self.cookies.insert(cookie.to_string(), val.to_string());
                }
            }
        }
    }
}

/// Splits the leading `name=value` pair off a `Set-Cookie` header value.
pub(crate) fn parse_set_cookie(header: &str) -> Option<(&str, &str)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Substitutes every `${name}` token in `template`.
///
/// Returns [`RequestError`] with kind `UnresolvedVariable` naming the first
/// variable that is not set.
pub fn resolve(template: &str, context: &ScenarioContext) -> Result<String, RequestError> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in VARIABLE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = context
            .get(name.as_str())
            .ok_or_else(|| RequestError::unresolved(name.as_str()))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Resolves every string leaf of a JSON value, keeping its shape.
pub fn resolve_json(
    value: &serde_json::Value,
    context: &ScenarioContext,
) -> Result<serde_json::Value, RequestError> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => Value::String(resolve(s, context)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_json(item, context))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(resolve(k, context)?, resolve_json(v, context)?);
            }
            Value::Object(resolved)
        },
        other => other.clone(),
    })
}

/// Names referenced by `template`, in order of appearance.
pub fn referenced_variables(template: &str) -> Vec<&str> {
    VARIABLE
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}
