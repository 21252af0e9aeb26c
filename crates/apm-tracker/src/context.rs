// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User and extra key/value data attached to a request.

use crate::errors::ContextError;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Context {
    user: Map<String, Value>,
    extra: Map<String, Value>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge valid entries into the extra context; invalid ones are logged and skipped.
    pub fn add_extra<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        merge_valid(&mut self.extra, values);
    }

    pub fn add_user<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        merge_valid(&mut self.user, values);
    }

    #[must_use]
    pub fn user(&self) -> &Map<String, Value> {
        &self.user
    }

    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.extra.is_empty()
    }
}

fn merge_valid<I, K>(target: &mut Map<String, Value>, values: I)
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    for (key, value) in values {
        let key = key.into();
        match validate(&key, &value) {
            Ok(()) => {
                target.insert(key, value);
            }
            Err(e) => warn!("Skipping context entry: {e}"),
        }
    }
}

/// Keys must be non-empty without whitespace; values must be scalars.
pub fn validate(key: &str, value: &Value) -> Result<(), ContextError> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(ContextError::InvalidKey(key.to_owned()));
    }
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(()),
        Value::Null | Value::Array(_) | Value::Object(_) => {
            Err(ContextError::InvalidValue(key.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_validate() {
        assert!(validate("account_id", &json!(42)).is_ok());
        assert!(validate("plan", &json!("gold")).is_ok());
        assert!(validate("beta", &json!(true)).is_ok());
        assert_eq!(
            validate("account id", &json!(1)),
            Err(ContextError::InvalidKey("account id".to_string()))
        );
        assert_eq!(
            validate("tags", &json!(["a"])),
            Err(ContextError::InvalidValue("tags".to_string()))
        );
        assert!(validate("", &json!(1)).is_err());
    }

    #[test]
    #[traced_test]
    fn test_invalid_entries_are_skipped() {
        let mut context = Context::new();
        context.add_extra([
            ("plan", json!("gold")),
            ("bad key", json!(1)),
            ("nested", json!({"a": 1})),
        ]);
        context.add_user([("email", json!("a@example.com"))]);

        assert_eq!(context.extra().len(), 1);
        assert_eq!(context.user().get("email"), Some(&json!("a@example.com")));
        assert!(logs_contain("Invalid context key"));
    }

    #[test]
    fn test_later_values_win() {
        let mut context = Context::new();
        context.add_extra([("plan", json!("gold"))]);
        context.add_extra([("plan", json!("silver"))]);
        assert_eq!(context.extra().get("plan"), Some(&json!("silver")));
    }
}
