//! Outbound address templates.
//!
//! A template such as `devices/{deviceId}/messages/events` binds when every
//! variable it references has a non-empty value. [`AddressTemplates`] tries its
//! templates in order and uses the first that binds.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// One parsed address template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl AddressTemplate {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTemplate`] for unbalanced braces or
    /// variable names that are not identifiers.
    pub fn parse(raw: &str) -> ConfigResult<Self> {
        static VARIABLE: OnceLock<Regex> = OnceLock::new();
        let re = VARIABLE.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("valid regex"));
        let invalid = |message: String| ConfigError::InvalidTemplate {
            template: raw.to_string(),
            message,
        };

        let mut segments = Vec::new();
        let mut last = 0;
        for caps in re.captures_iter(raw) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_literal(&mut segments, &raw[last..whole.start()]).map_err(invalid)?;
            let name = name.as_str();
            if !is_identifier(name) {
                return Err(invalid(format!("'{name}' is not a valid variable name")));
            }
            segments.push(Segment::Variable(name.to_string()));
            last = whole.end();
        }
        push_literal(&mut segments, &raw[last..]).map_err(invalid)?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Bind variables, or `None` if any referenced variable is missing or empty.
    #[must_use]
    pub fn bind(&self, vars: &[(&str, &str)]) -> Option<String> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    let value = vars
                        .iter()
                        .find(|(key, _)| *key == name.as_str())
                        .map(|(_, value)| *value)
                        .filter(|value| !value.is_empty())?;
                    out.push_str(value);
                }
            }
        }
        Some(out)
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<(), String> {
    if text.contains('{') || text.contains('}') {
        return Err("unbalanced brace".to_string());
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Ordered template list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTemplates {
    templates: Vec<AddressTemplate>,
}

impl AddressTemplates {
    /// Parse every template.
    ///
    /// # Errors
    ///
    /// Returns the first template parse error.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> ConfigResult<Self> {
        let templates = raw
            .iter()
            .map(|t| AddressTemplate::parse(t.as_ref()))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self { templates })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Address from the first template that binds; empty when none do.
    #[must_use]
    pub fn resolve(&self, vars: &[(&str, &str)]) -> String {
        self.templates
            .iter()
            .find_map(|template| template.bind(vars))
            .unwrap_or_default()
    }
}
