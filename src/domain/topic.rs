//! Topic template resolution
//!
//! Topics follow `client/{client_id}/session/{session_id}/`, always with
//! exactly one trailing separator.

use std::fmt;

pub const CLIENT_ID_PLACEHOLDER: &str = "{client_id}";
pub const SESSION_ID_PLACEHOLDER: &str = "{session_id}";
pub const DEFAULT_TOPIC_TEMPLATE: &str = "client/{client_id}/session/{session_id}/";

const SEPARATOR: char = '/';

/// Validated topic template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate(String);

impl TopicTemplate {
    /// Validate a template; both placeholders are required
    pub fn parse(template: &str) -> anyhow::Result<Self> {
        for placeholder in [CLIENT_ID_PLACEHOLDER, SESSION_ID_PLACEHOLDER] {
            if !template.contains(placeholder) {
                anyhow::bail!("topic template {:?} is missing {}", template, placeholder);
            }
        }
        if template.contains(['+', '#']) {
            anyhow::bail!("topic template {:?} must not contain MQTT wildcards", template);
        }
        Ok(Self(template.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute ids and normalise separators
    pub fn resolve(&self, client_id: &str, session_id: &str) -> String {
        let raw = self
            .0
            .replace(CLIENT_ID_PLACEHOLDER, client_id)
            .replace(SESSION_ID_PLACEHOLDER, session_id);
        normalize_topic(&raw)
    }
}

impl Default for TopicTemplate {
    fn default() -> Self {
        Self(DEFAULT_TOPIC_TEMPLATE.to_string())
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse repeated separators and end with exactly one
///
/// A single leading separator is kept (`/a` and `a` are distinct topics).
pub fn normalize_topic(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len() + 1);
    for ch in topic.chars() {
        if ch == SEPARATOR && out.ends_with(SEPARATOR) {
            continue;
        }
        out.push(ch);
    }
    if !out.ends_with(SEPARATOR) {
        out.push(SEPARATOR);
    }
    out
}
