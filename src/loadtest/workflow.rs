//! Workflow definitions, request resolution and variable extraction.
//!
//! A [`WorkflowDefinition`] is the serializable, user-facing form: an ordered
//! list of [`Step`]s loaded from JSON or synthesized from the single-URL
//! options of a [`TestPlan`]. [`Workflow::compile`] validates it once into a
//! shared, read-only [`Workflow`]. Each virtual user walks it with its own
//! [`WorkflowCursor`], resolving templates against its [`ScenarioContext`].
//!
//! # Workflow JSON
//!
//! Either a bare array of steps or an object with a `steps` array:
//!
//! ```json
//! {
//!   "name": "checkout",
//!   "steps": [
//!     {
//!       "name": "login",
//!       "url": "${base_url}/login",
//!       "method": "POST",
//!       "payload": {"user": "u${user_id}", "password": "secret"},
//!       "extract": {
//!         "token": "$.token",
//!         "session": {"type": "cookie", "name": "sid"}
//!       }
//!     },
//!     {
//!       "name": "profile",
//!       "url": "${base_url}/me",
//!       "headers": {"Authorization": "Bearer ${token}"}
//!     }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use rand::prelude::*;
use rand::rngs::StdRng;
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;

use crate::loadtest::auth::AuthSpec;
use crate::loadtest::config::TestPlan;
use crate::loadtest::error::{ErrorKind, LoadTestError, RequestError};
use crate::loadtest::executor::{Payload, PreparedRequest};
use crate::loadtest::jsonpath;
use crate::loadtest::metrics::RequestResult;
use crate::loadtest::template::{self, parse_set_cookie, ScenarioContext};
use crate::loadtest::validator::{ValidationRules, Validator};

fn default_step_url() -> String {
    "${base_url}".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

/// What a workflow does with a user's context when an iteration restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPolicy {
    /// Keep extracted variables and cookies across iterations.
    #[default]
    Retain,
    /// Restore the base set (`base_url`, `user_id`) before every iteration.
    Reset,
}

/// Where an extraction rule reads its value from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractSource {
    /// JSONPath against the parsed response body.
    #[default]
    Jsonpath,
    /// Regex against the raw body; first capture group, or the whole match.
    Regex,
    /// A response header, verbatim.
    Header,
    /// A cookie set by the response.
    Cookie,
    /// The response status code.
    Status,
}

/// One variable extraction rule.
///
/// A bare string is shorthand for a JSONPath rule. In the full form `path` is
/// also accepted as `pattern` (regex) or `name` (header, cookie).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "RawExtractRule")]
pub struct ExtractRule {
    #[serde(rename = "type")]
    pub source: ExtractSource,
    pub path: String,
    /// Regex capture group to use instead of the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

impl ExtractRule {
    pub fn jsonpath(path: impl Into<String>) -> Self {
        Self {
            source: ExtractSource::Jsonpath,
            path: path.into(),
            group: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExtractRule {
    Shorthand(String),
    Full {
        #[serde(rename = "type", default)]
        source: ExtractSource,
        #[serde(alias = "pattern", alias = "name", alias = "expression", default)]
        path: String,
        #[serde(default)]
        group: Option<usize>,
    },
}

impl From<RawExtractRule> for ExtractRule {
    fn from(raw: RawExtractRule) -> Self {
        match raw {
            RawExtractRule::Shorthand(path) => Self::jsonpath(path),
            RawExtractRule::Full {
                source,
                path,
                group,
            } => Self {
                source,
                path,
                group,
            },
        }
    }
}

/// One request in a workflow.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Step {
    /// Step name used for per-step metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// URL template.
    #[serde(default = "default_step_url")]
    pub url: String,
    /// Candidate URL templates. When non-empty, each request picks one
    /// uniformly at random and `url` is ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default = "default_method")]
    pub method: String,
    /// Body template: a JSON value whose string leaves are templates, or a
    /// single template string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Overrides the plan's content type for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extract: BTreeMap<String, ExtractRule>,
    /// Replaces the plan's validation rules for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<ValidationRules>,
}

impl Step {
    /// A `GET` step against a single URL template.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
            urls: Vec::new(),
            method: default_method(),
            payload: None,
            content_type: None,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            extract: BTreeMap::new(),
            validate: None,
        }
    }
}

/// Ordered sequence of steps, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "RawWorkflow")]
pub struct WorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<Step>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWorkflow {
    Bare(Vec<Step>),
    Named {
        #[serde(default)]
        name: Option<String>,
        steps: Vec<Step>,
    },
}

impl From<RawWorkflow> for WorkflowDefinition {
    fn from(raw: RawWorkflow) -> Self {
        match raw {
            RawWorkflow::Bare(steps) => Self { name: None, steps },
            RawWorkflow::Named { name, steps } => Self { name, steps },
        }
    }
}

impl WorkflowDefinition {
    /// Synthesizes the one-step workflow used when no workflow file is given.
    ///
    /// `paths` and `default` URL modes become a step whose URL is chosen at
    /// random on every request.
    pub fn single_url(plan: &TestPlan) -> Result<Self, LoadTestError> {
        let targets = plan.target_urls()?;
        let mut step = Step::get(plan.target.url.clone());
        step.method = plan.target.method.clone();
        step.payload = plan.target.payload.clone().map(Value::String);
        if targets.len() > 1 {
            step.urls = targets;
        } else if let Some(only) = targets.into_iter().next() {
            step.url = only;
        }
        Ok(Self {
            name: None,
            steps: vec![step],
        })
    }

    /// Parses workflow JSON. `origin` is only used in error messages.
    pub fn from_json(json: &str, origin: &str) -> Result<Self, LoadTestError> {
        serde_json::from_str(json).map_err(|source| LoadTestError::WorkflowParse {
            source,
            path: origin.to_string(),
        })
    }

    /// Reads and parses a workflow JSON file.
    pub fn load_json(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_json(&content, &path.display().to_string())
    }
}

/// Request settings every step inherits from the plan.
#[derive(Debug, Clone, Default)]
pub struct RequestDefaults {
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub auth: AuthSpec,
    pub content_type: String,
    pub user_agent: String,
}

impl RequestDefaults {
    pub fn from_plan(plan: &TestPlan) -> Self {
        Self {
            headers: plan.headers.clone(),
            cookies: plan.cookies.clone(),
            auth: plan.auth.clone(),
            content_type: plan.target.content_type.clone(),
            user_agent: plan.target.user_agent.clone(),
        }
    }
}

/// A compiled extraction rule.
#[derive(Debug, Clone)]
pub struct Extractor {
    name: String,
    expression: String,
    kind: ExtractorKind,
}

#[derive(Debug, Clone)]
enum ExtractorKind {
    JsonPath(JsonPath),
    Regex { regex: Regex, group: Option<usize> },
    Header,
    Cookie,
    Status,
}

impl Extractor {
    /// Compiles `rule`, storing its value under `name`.
    pub fn compile(name: &str, rule: &ExtractRule) -> Result<Self, LoadTestError> {
        let kind = match rule.source {
            ExtractSource::Jsonpath => ExtractorKind::JsonPath(
                jsonpath::parse(&rule.path).map_err(|message| LoadTestError::Workflow { message })?,
            ),
            ExtractSource::Regex => ExtractorKind::Regex {
                regex: Regex::new(&rule.path).map_err(|e| LoadTestError::Workflow {
                    message: format!("invalid extraction regex for '{name}': {e}"),
                })?,
                group: rule.group,
            },
            ExtractSource::Header => ExtractorKind::Header,
            ExtractSource::Cookie => ExtractorKind::Cookie,
            ExtractSource::Status => ExtractorKind::Status,
        };
        if rule.path.is_empty() && !matches!(kind, ExtractorKind::Status) {
            return Err(LoadTestError::Workflow {
                message: format!("extraction rule '{name}' has no path"),
            });
        }
        Ok(Self {
            name: name.to_string(),
            expression: rule.path.clone(),
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, result: &RequestResult, document: &mut Option<Option<Value>>) -> Option<String> {
        match &self.kind {
            ExtractorKind::JsonPath(path) => {
                let parsed = document
                    .get_or_insert_with(|| serde_json::from_str::<Value>(result.body()).ok());
                parsed
                    .as_ref()
                    .and_then(|doc| jsonpath::first_match(path, doc))
                    .map(jsonpath::value_to_string)
            },
            ExtractorKind::Regex { regex, group } => {
                let caps = regex.captures(result.body())?;
                let index = group.unwrap_or(if caps.len() > 1 { 1 } else { 0 });
                caps.get(index).map(|m| m.as_str().to_string())
            },
            ExtractorKind::Header => result.header(&self.expression).map(str::to_string),
            ExtractorKind::Cookie => result.response.as_ref().and_then(|response| {
                response
                    .headers
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
                    .filter_map(|(_, v)| parse_set_cookie(v))
                    .find(|(name, _)| *name == self.expression)
                    .map(|(_, value)| value.to_string())
            }),
            ExtractorKind::Status => result.status.map(|s| s.to_string()),
        }
    }
}

/// Runs every extractor against `result`, writing matches into `context`.
///
/// A rule that matches nothing leaves its variable untouched and produces a
/// warning; it never fails the step.
pub fn extract(
    context: &mut ScenarioContext,
    result: &RequestResult,
    extractors: &[Extractor],
) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut document = None;
    for extractor in extractors {
        match extractor.apply(result, &mut document) {
            Some(value) => context.set(extractor.name.clone(), value),
            None => warnings.push(format!(
                "extraction '{}' ({}) matched nothing",
                extractor.name, extractor.expression
            )),
        }
    }
    warnings
}

/// A step ready to execute: compiled once, shared by every user.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    step: Step,
    method: Method,
    extractors: Vec<Extractor>,
    validator: Validator,
}

impl CompiledStep {
    fn compile(step: Step, plan_rules: &ValidationRules) -> Result<Self, LoadTestError> {
        let method = Method::from_bytes(step.method.to_ascii_uppercase().as_bytes()).map_err(
            |_| LoadTestError::Workflow {
                message: format!("invalid HTTP method '{}'", step.method),
            },
        )?;
        let extractors = step
            .extract
            .iter()
            .map(|(name, rule)| Extractor::compile(name, rule))
            .collect::<Result<Vec<_>, _>>()?;
        let validator = Validator::new(step.validate.as_ref().unwrap_or(plan_rules))?;
        Ok(Self {
            step,
            method,
            extractors,
            validator,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.step.name.as_deref()
    }

    pub fn extractors(&self) -> &[Extractor] {
        &self.extractors
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Resolves every template of this step against `context`.
    ///
    /// Fails with `UnresolvedVariable` before anything is sent when a
    /// referenced variable is missing.
    fn resolve(
        &self,
        context: &ScenarioContext,
        defaults: &RequestDefaults,
        rng: &mut StdRng,
    ) -> Result<PreparedRequest, RequestError> {
        let url_template = if self.step.urls.is_empty() {
            self.step.url.as_str()
        } else {
            self.step.urls[rng.random_range(0..self.step.urls.len())].as_str()
        };
        let url = template::resolve(url_template, context)?;
        url::Url::parse(&url).map_err(|e| {
            RequestError::new(ErrorKind::InvalidRequest, format!("invalid URL '{url}': {e}"))
        })?;

        let mut headers: Vec<(String, String)> = Vec::new();
        let mut set_header = |name: String, value: String| {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
            headers.push((name, value));
        };
        if !defaults.user_agent.is_empty() {
            set_header("User-Agent".to_string(), defaults.user_agent.clone());
        }
        for (name, value) in &defaults.headers {
            set_header(name.clone(), template::resolve(value, context)?);
        }
        for (name, value) in &self.step.headers {
            set_header(name.clone(), template::resolve(value, context)?);
        }
        if let Some((name, value)) = defaults.auth.resolve(context)? {
            set_header(name, value);
        }

        let mut cookies: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &defaults.cookies {
            cookies.insert(name.clone(), template::resolve(value, context)?);
        }
        for (name, value) in context.cookies() {
            cookies.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.step.cookies {
            cookies.insert(name.clone(), template::resolve(value, context)?);
        }
        if !cookies.is_empty() {
            let cookie = cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            set_header("Cookie".to_string(), cookie);
        }

        let content_type = self
            .step
            .content_type
            .as_deref()
            .unwrap_or(&defaults.content_type);
        let payload = match &self.step.payload {
            None => Payload::Empty,
            Some(body) => encode_payload(body, content_type, context)?,
        };
        if !matches!(payload, Payload::Empty) && !content_type.is_empty() {
            let explicit = headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
            if !explicit {
                headers.push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        Ok(PreparedRequest {
            method: self.method.clone(),
            url,
            headers,
            payload,
        })
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json(media: &str) -> bool {
    media == "application/json" || media.ends_with("+json")
}

/// Resolves a payload template and encodes it according to `content_type`.
fn encode_payload(
    body: &Value,
    content_type: &str,
    context: &ScenarioContext,
) -> Result<Payload, RequestError> {
    let media = media_type(content_type);
    let payload = match body {
        Value::String(raw) => {
            let text = template::resolve(raw, context)?;
            if is_json(&media) {
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) => Payload::Json(value),
                    Err(_) => Payload::Text(text),
                }
            } else if media == "application/octet-stream" {
                Payload::Binary(text.into_bytes())
            } else {
                Payload::Text(text)
            }
        },
        other => {
            let value = template::resolve_json(other, context)?;
            match (media.as_str(), &value) {
                ("application/x-www-form-urlencoded", Value::Object(map)) => Payload::Form(
                    map.iter()
                        .map(|(k, v)| (k.clone(), jsonpath::value_to_string(v)))
                        .collect(),
                ),
                ("application/octet-stream", _) => Payload::Binary(value.to_string().into_bytes()),
                (m, _) if is_json(m) => Payload::Json(value),
                _ => Payload::Text(value.to_string()),
            }
        },
    };
    Ok(payload)
}

/// A compiled workflow, shared read-only by every virtual user.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: Option<String>,
    steps: Vec<CompiledStep>,
    defaults: RequestDefaults,
    policy: ContextPolicy,
}

impl Workflow {
    /// Validates `definition` against `plan` and compiles every rule.
    pub fn compile(definition: WorkflowDefinition, plan: &TestPlan) -> Result<Self, LoadTestError> {
        if definition.steps.is_empty() {
            return Err(LoadTestError::Workflow {
                message: "workflow has no steps".to_string(),
            });
        }
        let steps = definition
            .steps
            .into_iter()
            .map(|step| CompiledStep::compile(step, &plan.validation))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: definition.name,
            steps,
            defaults: RequestDefaults::from_plan(plan),
            policy: plan.settings.context_policy,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&CompiledStep> {
        self.steps.get(index)
    }

    pub fn context_policy(&self) -> ContextPolicy {
        self.policy
    }

    /// Variables referenced somewhere in the workflow that neither the seeded
    /// context nor any extraction rule can set. Requests using them always
    /// fail unsent.
    pub fn unbound_variables(&self) -> BTreeSet<String> {
        let mut bound: BTreeSet<&str> = ["base_url", "user_id"].into_iter().collect();
        for step in &self.steps {
            bound.extend(step.extractors.iter().map(Extractor::name));
        }

        let mut templates: Vec<&str> = Vec::new();
        templates.extend(self.defaults.headers.values().map(String::as_str));
        templates.extend(self.defaults.cookies.values().map(String::as_str));
        templates.extend(self.defaults.auth.templates());
        for compiled in &self.steps {
            step_templates(&compiled.step, &mut templates);
        }

        templates
            .into_iter()
            .flat_map(template::referenced_variables)
            .filter(|name| !bound.contains(name))
            .map(str::to_string)
            .collect()
    }
}

fn step_templates<'a>(step: &'a Step, out: &mut Vec<&'a str>) {
    if step.urls.is_empty() {
        out.push(&step.url);
    } else {
        out.extend(step.urls.iter().map(String::as_str));
    }
    out.extend(step.headers.values().map(String::as_str));
    out.extend(step.cookies.values().map(String::as_str));
    if let Some(payload) = &step.payload {
        json_templates(payload, out);
    }
}

fn json_templates<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| json_templates(item, out)),
        Value::Object(map) => {
            for (key, item) in map {
                out.push(key);
                json_templates(item, out);
            }
        },
        _ => {},
    }
}

/// A resolved step, ready to hand to a protocol executor.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub index: usize,
    pub name: Option<String>,
    pub request: PreparedRequest,
}

/// Result of asking a cursor for its next step.
#[derive(Debug)]
pub enum NextStep {
    Ready(ResolvedStep),
    /// The step could not be resolved; nothing was sent.
    Failed {
        name: Option<String>,
        error: RequestError,
    },
    EndOfWorkflow,
}

/// A single user's position in a [`Workflow`].
pub struct WorkflowCursor {
    workflow: Arc<Workflow>,
    index: usize,
    rng: StdRng,
}

impl WorkflowCursor {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        Self {
            workflow,
            index: 0,
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Back to step 1, applying the workflow's context policy.
    pub fn restart(&mut self, context: &mut ScenarioContext) {
        self.index = 0;
        if self.workflow.policy == ContextPolicy::Reset {
            context.reset();
        }
    }

    /// Skips the rest of the current iteration.
    pub fn abort(&mut self) {
        self.index = self.workflow.steps.len();
    }

    /// Resolves the next step against `context` and advances.
    pub fn next_step(&mut self, context: &ScenarioContext) -> NextStep {
        let Some(step) = self.workflow.steps.get(self.index) else {
            return NextStep::EndOfWorkflow;
        };
        let index = self.index;
        self.index += 1;
        let name = step.step.name.clone();
        match step.resolve(context, &self.workflow.defaults, &mut self.rng) {
            Ok(request) => NextStep::Ready(ResolvedStep {
                index,
                name,
                request,
            }),
            Err(error) => NextStep::Failed { name, error },
        }
    }
}
