use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

static CAPTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(":[A-Za-z_][A-Za-z0-9_]*\\*|\\*").unwrap());

/// A rewrite rule as written in the runtime config.
#[derive(Deserialize, Debug, Clone)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule `{rule}`: source `{pattern}` {reason}")]
    InvalidSource {
        rule: String,
        pattern: String,
        reason: String,
    },
    #[error("rule `{rule}`: destination `{template}` {reason}")]
    InvalidDestination {
        rule: String,
        template: String,
        reason: String,
    },
    #[error("rule `{rule}`: destination placeholder `{placeholder}` does not match source capture `{captured}`")]
    CaptureMismatch {
        rule: String,
        captured: Capture,
        placeholder: Capture,
    },
    #[error("rule `{rule}`: prefix `{prefix}` overlaps prefix `{other_prefix}` of rule `{other}`")]
    Overlap {
        rule: String,
        prefix: String,
        other: String,
        other_prefix: String,
    },
}

/// The trailing wildcard of a source pattern, and the placeholder of a
/// destination template receiving it.
///
/// `*` is anonymous, `:path*` is named `path`. A destination placeholder must
/// be the same kind (and name) as its source capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    Anonymous,
    Named(String),
}

impl Capture {
    fn from_token(token: &str) -> Self {
        match token.strip_prefix(':') {
            Some(named) => Capture::Named(named.trim_end_matches('*').to_string()),
            None => Capture::Anonymous,
        }
    }
}

impl fmt::Display for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capture::Anonymous => write!(f, "*"),
            Capture::Named(name) => write!(f, ":{name}*"),
        }
    }
}

/// Finds the single capture token of `template`.
///
/// Returns the byte range of the token alongside the capture, or a reason
/// when the template holds zero or several tokens.
fn single_capture(template: &str) -> Result<(usize, usize, Capture), String> {
    let tokens: Vec<_> = CAPTURE.find_iter(template).collect();
    match tokens.as_slice() {
        [] => Err("is missing a capture (`*` or `:name*`)".to_string()),
        [token] => Ok((
            token.start(),
            token.end(),
            Capture::from_token(token.as_str()),
        )),
        _ => Err(format!(
            "contains {} captures, expected exactly one",
            tokens.len()
        )),
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    name: String,
    source: String,
    destination: String,
    prefix: String,
    capture: Capture,
    head: String,
    tail: String,
}

impl RewriteRule {
    /// Parses and validates a rule. `name` defaults to the source pattern.
    pub fn new(name: Option<&str>, source: &str, destination: &str) -> Result<Self, RuleError> {
        let name = name.unwrap_or(source).to_string();

        let invalid_source = |reason: String| RuleError::InvalidSource {
            rule: name.clone(),
            pattern: source.to_string(),
            reason,
        };
        let invalid_destination = |reason: String| RuleError::InvalidDestination {
            rule: name.clone(),
            template: destination.to_string(),
            reason,
        };

        if !source.starts_with('/') {
            return Err(invalid_source("should start with `/`".to_string()));
        }
        let (start, end, capture) = single_capture(source).map_err(invalid_source)?;
        if end != source.len() {
            return Err(invalid_source("must end with its capture".to_string()));
        }
        let prefix = &source[..start];
        if !prefix.ends_with('/') {
            return Err(invalid_source("capture must follow a `/`".to_string()));
        }

        let (start, end, placeholder) =
            single_capture(destination).map_err(invalid_destination)?;
        if placeholder != capture {
            return Err(RuleError::CaptureMismatch {
                rule: name,
                captured: capture,
                placeholder,
            });
        }
        let head = &destination[..start];
        let tail = &destination[end..];

        match Url::parse(&format!("{head}{tail}")) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => (),
            _ => {
                return Err(invalid_destination(
                    "is not an absolute http(s) URL".to_string(),
                ))
            }
        }

        Ok(Self {
            prefix: prefix.to_string(),
            capture,
            head: head.to_string(),
            tail: tail.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Literal part of the source, up to the capture.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    pub fn overlaps(&self, other: &RewriteRule) -> bool {
        self.prefix.starts_with(&other.prefix) || other.prefix.starts_with(&self.prefix)
    }

    /// Rewrites `path` if it starts with this rule's prefix.
    pub fn rewrite(&self, path: &str) -> Option<String> {
        path.strip_prefix(&self.prefix)
            .map(|suffix| self.substitute(suffix))
    }

    fn substitute(&self, suffix: &str) -> String {
        format!("{}{}{}", self.head, suffix, self.tail)
    }
}

impl TryFrom<&RuleConfig> for RewriteRule {
    type Error = RuleError;

    fn try_from(config: &RuleConfig) -> Result<Self, Self::Error> {
        RewriteRule::new(
            config.name.as_deref(),
            &config.source,
            &config.destination,
        )
    }
}
