//! Input validation and sanitization for inbound chat messages.
//!
//! Validation rejects; it never rewrites. `sanitize` is applied only to
//! messages that passed validation and produces the sole text forwarded to
//! the classifier, cache and model.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::config::LimitsConfig;

const MAX_USER_ID_LENGTH: usize = 128;

/// Named disallowed-content rules. Any match is a validation error.
const CONTENT_RULES: &[(&str, &str)] = &[
    ("noScripts", r"<script|javascript:|data:"),
    (
        "noSQLInjection",
        r#"'|"|;|--|\b(SELECT|INSERT|UPDATE|DELETE|DROP|UNION)\b"#,
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    max_message_length: usize,
    content_rules: Vec<(&'static str, Regex)>,
}

impl Validator {
    pub fn new(limits: &LimitsConfig) -> Result<Self, regex::Error> {
        let content_rules = CONTENT_RULES
            .iter()
            .map(|(name, pattern)| {
                let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
                Ok((*name, regex))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            max_message_length: limits.max_message_length,
            content_rules,
        })
    }

    /// Check a raw request body. Pure; collects every problem found.
    pub fn validate(&self, input: &Value) -> Validation {
        let mut errors = Vec::new();

        match input.get("message") {
            None | Some(Value::Null) => errors.push("Message is required".to_string()),
            Some(Value::String(message)) => self.check_message(message, &mut errors),
            Some(_) => errors.push("Message must be a string".to_string()),
        }

        match input.get("userId") {
            None | Some(Value::Null) => {}
            Some(Value::String(user)) if user.chars().count() > MAX_USER_ID_LENGTH => errors.push(
                format!("userId exceeds {MAX_USER_ID_LENGTH} characters"),
            ),
            Some(Value::String(_)) => {}
            Some(_) => errors.push("userId must be a string".to_string()),
        }

        Validation::from_errors(errors)
    }

    fn check_message(&self, message: &str, errors: &mut Vec<String>) {
        let length = message.chars().count();
        if length == 0 {
            errors.push("Message is required".to_string());
            return;
        }
        if length > self.max_message_length {
            errors.push(format!(
                "Message exceeds {} characters",
                self.max_message_length
            ));
        }

        for (name, rule) in &self.content_rules {
            if rule.is_match(message) {
                errors.push(format!("Message contains invalid content ({name})"));
            }
        }
    }

    /// Trim, drop angle brackets and cap the length.
    pub fn sanitize(&self, message: &str) -> String {
        message
            .trim()
            .chars()
            .filter(|c| *c != '<' && *c != '>')
            .take(self.max_message_length)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> Validator {
        Validator::new(&LimitsConfig::default()).unwrap()
    }

    #[test]
    fn missing_or_non_string_message_is_invalid() {
        let v = validator();
        for body in [
            json!({}),
            json!({ "message": null }),
            json!({ "message": "" }),
            json!({ "message": 42 }),
            json!({ "message": ["a"] }),
            json!({ "message": { "text": "hi" } }),
        ] {
            let result = v.validate(&body);
            assert!(!result.valid, "{body} should be rejected");
            assert!(!result.errors.is_empty());
        }
    }

    #[test]
    fn over_long_message_cites_length() {
        let v = validator();
        let body = json!({ "message": "a".repeat(5001) });
        let result = v.validate(&body);
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["Message exceeds 5000 characters"]);

        let body = json!({ "message": "a".repeat(5000) });
        assert!(v.validate(&body).valid);
    }

    #[test]
    fn disallowed_content_is_an_error() {
        let v = validator();

        let result = v.validate(&json!({ "message": "<SCRIPT>alert(1)</script>" }));
        assert!(!result.valid);
        assert!(result.errors[0].contains("noScripts"));

        let result = v.validate(&json!({ "message": "1; drop table invoices" }));
        assert_eq!(
            result.errors,
            vec!["Message contains invalid content (noSQLInjection)"]
        );

        // Whole words only.
        assert!(v.validate(&json!({ "message": "selection of products" })).valid);
    }

    #[test]
    fn user_id_must_be_string() {
        let v = validator();
        let result = v.validate(&json!({ "message": "hello", "userId": 7 }));
        assert_eq!(result.errors, vec!["userId must be a string"]);
        assert!(v.validate(&json!({ "message": "hello", "userId": "u-1" })).valid);
    }

    #[test]
    fn sanitize_trims_strips_and_truncates() {
        let v = Validator::new(&LimitsConfig {
            max_message_length: 5,
            ..LimitsConfig::default()
        })
        .unwrap();
        assert_eq!(v.sanitize("  <b>hi</b>  "), "bhi/b");
        assert_eq!(v.sanitize("abcdefgh"), "abcde");
        assert_eq!(v.sanitize("ñandú"), "ñandú");
    }
}
