//! Authentication header resolution.
//!
//! The `[auth]` table selects one of four schemes. Values are templates, so a
//! bearer token extracted by an earlier workflow step can be referenced as
//! `token = "${token}"`. Resolution happens once per request.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::loadtest::error::{LoadTestError, RequestError};
use crate::loadtest::template::{resolve, ScenarioContext};

/// Authentication scheme applied to every request of a run.
///
/// # Example TOML
///
/// ```toml
/// [auth]
/// type = "basic"
/// username = "admin"
/// password = "secret"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthSpec {
    /// No authentication header.
    #[default]
    None,
    /// `Authorization: Basic base64(username:password)`.
    Basic { username: String, password: String },
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// A literal header name/value pair.
    Custom { name: String, value: String },
}

impl AuthSpec {
    /// Parses a `Name: value` string into a [`AuthSpec::Custom`] spec.
    ///
    /// The split happens on the first `:` so values may contain colons.
    pub fn parse_custom(header: &str) -> Result<Self, LoadTestError> {
        let (name, value) = header.split_once(':').ok_or_else(|| {
            LoadTestError::validation(format!(
                "custom auth header '{header}' must have the form 'Name: value'"
            ))
        })?;
        Ok(Self::Custom {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        })
    }

    /// Checks that the fields required by the selected scheme are present.
    pub fn validate(&self) -> Result<(), LoadTestError> {
        match self {
            Self::None => Ok(()),
            Self::Basic { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(LoadTestError::validation(
                        "basic auth requires both username and password",
                    ));
                }
                Ok(())
            },
            Self::Bearer { token } => {
                if token.is_empty() {
                    return Err(LoadTestError::validation("bearer auth requires a token"));
                }
                Ok(())
            },
            Self::Custom { name, .. } => {
                if name.is_empty() {
                    return Err(LoadTestError::validation(
                        "custom auth requires a header name",
                    ));
                }
                Ok(())
            },
        }
    }

    /// Resolves the header this scheme contributes, if any.
    /// Template strings resolved on every request.
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::None => Vec::new(),
            Self::Basic { username, password } => vec![username, password],
            Self::Bearer { token } => vec![token],
            Self::Custom { name, value } => vec![name, value],
        }
    }

    pub fn resolve(
        &self,
        context: &ScenarioContext,
    ) -> Result<Option<(String, String)>, RequestError> {
        match self {
            Self::None => Ok(None),
            Self::Basic { username, password } => {
                let credentials = format!(
                    "{}:{}",
                    resolve(username, context)?,
                    resolve(password, context)?
                );
                Ok(Some((
                    "Authorization".to_string(),
                    format!("Basic {}", STANDARD.encode(credentials)),
                )))
            },
            Self::Bearer { token } => Ok(Some((
                "Authorization".to_string(),
                format!("Bearer {}", resolve(token, context)?),
            ))),
            Self::Custom { name, value } => Ok(Some((
                resolve(name, context)?,
                resolve(value, context)?,
            ))),
        }
    }
}
