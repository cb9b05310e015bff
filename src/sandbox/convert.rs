//! Value bridge between the guest interpreter and host JSON.

use boa_engine::{Context, JsResult, JsString, JsValue};
use serde_json::{Map, Number, Value};

use super::error::{Result, SandboxError};

/// Export a guest value. Functions and symbols become `null`; values that
/// `JSON.stringify` rejects (cycles, bigints) fall back to their display form.
pub fn to_json(value: &JsValue, context: &mut Context) -> JsResult<Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(flag) = value.as_boolean() {
        return Ok(Value::Bool(flag));
    }
    if let Some(text) = value.as_string() {
        return Ok(Value::String(text.to_std_string_lossy()));
    }
    if let Some(n) = value.as_number() {
        return Ok(number(n));
    }
    if value.is_callable() {
        return Ok(Value::Null);
    }

    let json = context
        .global_object()
        .get(JsString::from("JSON"), context)?;
    let stringify = match json.as_object() {
        Some(obj) => obj.get(JsString::from("stringify"), context)?,
        None => return Ok(Value::String(value.display().to_string())),
    };
    let Some(func) = stringify.as_callable() else {
        return Ok(Value::String(value.display().to_string()));
    };
    match func.call(&json, &[value.clone()], context) {
        Ok(text) => Ok(text
            .as_string()
            .and_then(|s| serde_json::from_str(&s.to_std_string_lossy()).ok())
            .unwrap_or(Value::Null)),
        Err(_) => Ok(Value::String(value.display().to_string())),
    }
}

pub fn to_js(value: &Value, context: &mut Context) -> JsResult<JsValue> {
    JsValue::from_json(value, context)
}

/// Export call arguments. An argument that cannot be exported becomes `null`.
pub fn args_to_json(args: &[JsValue], context: &mut Context) -> Vec<Value> {
    args.iter()
        .map(|arg| to_json(arg, context).unwrap_or(Value::Null))
        .collect()
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&Value::Null)
}

pub fn require_str(args: &[Value], index: usize, name: &str) -> Result<String> {
    arg(args, index)
        .as_str()
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SandboxError::invalid_input(format!("'{}' must be a non-empty string", name)))
}

/// Like [`require_str`] but allows the empty string.
pub fn require_text(args: &[Value], index: usize, name: &str) -> Result<String> {
    match arg(args, index) {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(SandboxError::invalid_input(format!(
            "'{}' must be a string, got {}",
            name,
            type_name(other)
        ))),
    }
}

pub fn optional_str(args: &[Value], index: usize) -> Option<String> {
    arg(args, index)
        .as_str()
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

pub fn optional_u64(args: &[Value], index: usize, name: &str) -> Result<Option<u64>> {
    u64_value(arg(args, index), name)
}

/// A non-negative number, or `None` for null. Anything else is a usage error.
pub fn u64_value(value: &Value, name: &str) -> Result<Option<u64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| Some(v as u64))
            .ok_or_else(|| {
                SandboxError::invalid_input(format!("'{}' must be a non-negative number", name))
            }),
        other => Err(SandboxError::invalid_input(format!(
            "'{}' must be a number, got {}",
            name,
            type_name(other)
        ))),
    }
}

pub fn optional_object<'a>(
    args: &'a [Value],
    index: usize,
    name: &str,
) -> Result<Option<&'a Map<String, Value>>> {
    match arg(args, index) {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(SandboxError::invalid_input(format!(
            "'{}' must be an object, got {}",
            name,
            type_name(other)
        ))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
