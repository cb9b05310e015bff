use std::time::Duration;

use serde_json::Value;

use crate::sandbox::convert::type_name;
use crate::sandbox::error::{Result, SandboxError};

/// Argument of `session.wait(...)`: a selector to wait for, or seconds to sleep.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitTarget {
    Selector(String),
    Seconds(f64),
}

impl WaitTarget {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(selector) if !selector.trim().is_empty() => {
                Ok(WaitTarget::Selector(selector.clone()))
            }
            Value::String(_) => Err(SandboxError::invalid_input(
                "wait() selector must not be empty",
            )),
            Value::Number(n) => match n.as_f64() {
                Some(secs) if Duration::try_from_secs_f64(secs).is_ok() => {
                    Ok(WaitTarget::Seconds(secs))
                }
                _ => Err(SandboxError::invalid_input(
                    "wait() seconds must be a non-negative number within range",
                )),
            },
            other => Err(SandboxError::invalid_input(format!(
                "wait() expects a selector string or a number of seconds, got {}",
                type_name(other)
            ))),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            WaitTarget::Seconds(secs) => Duration::try_from_secs_f64(*secs).ok(),
            WaitTarget::Selector(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn strings_are_selectors_and_numbers_are_seconds() {
        assert_eq!(
            WaitTarget::from_json(&json!("#submit")).unwrap(),
            WaitTarget::Selector("#submit".into())
        );
        let secs = WaitTarget::from_json(&json!(1.5)).unwrap();
        assert_eq!(secs, WaitTarget::Seconds(1.5));
        assert_eq!(secs.duration(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn other_shapes_are_usage_errors() {
        for value in [json!(true), json!(null), json!({"selector": "a"}), json!(-1), json!("  "), json!(1e20)] {
            let err = WaitTarget::from_json(&value).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidInput, "{value}");
        }
    }
}
