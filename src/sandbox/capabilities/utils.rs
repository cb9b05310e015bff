use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};

use super::{filetype, success};
use crate::sandbox::convert::{arg, require_str, require_text};
use crate::sandbox::error::SandboxError;
use crate::sandbox::registrar::{CapabilityGroup, HostContext, HostFunction};

pub struct UtilitiesGroup;

impl CapabilityGroup for UtilitiesGroup {
    fn name(&self) -> &'static str {
        "utilities"
    }

    fn functions(&self, _host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        vec![
            Arc::new(SleepFn),
            Arc::new(UuidFn),
            Arc::new(NowFn),
            Arc::new(Base64EncodeFn),
            Arc::new(Base64DecodeFn),
            Arc::new(RandomIntFn),
            Arc::new(RegexTestFn),
            Arc::new(DetectFileTypeFn),
        ]
    }
}

pub struct SleepFn;

#[async_trait]
impl HostFunction for SleepFn {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn description(&self) -> &'static str {
        "Pause the script for the given number of milliseconds"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let ms = match arg(args, 0).as_f64() {
            Some(ms) if ms.is_finite() && ms >= 0.0 => ms as u64,
            _ => {
                return Err(SandboxError::invalid_input(
                    "sleep() expects a non-negative number of milliseconds",
                )
                .into())
            }
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(success(json!({ "slept_ms": ms })))
    }
}

pub struct UuidFn;

#[async_trait]
impl HostFunction for UuidFn {
    fn name(&self) -> &'static str {
        "uuid"
    }

    fn description(&self) -> &'static str {
        "Random v4 UUID"
    }

    fn arity(&self) -> usize {
        0
    }

    async fn call(&self, _args: &[Value]) -> Result<Value> {
        Ok(success(json!({ "uuid": uuid::Uuid::new_v4().to_string() })))
    }
}

pub struct NowFn;

#[async_trait]
impl HostFunction for NowFn {
    fn name(&self) -> &'static str {
        "now"
    }

    fn description(&self) -> &'static str {
        "Current UTC time as RFC 3339 and epoch milliseconds"
    }

    fn arity(&self) -> usize {
        0
    }

    async fn call(&self, _args: &[Value]) -> Result<Value> {
        let now = chrono::Utc::now();
        Ok(success(json!({
            "iso": now.to_rfc3339(),
            "epoch_ms": now.timestamp_millis(),
        })))
    }
}

pub struct Base64EncodeFn;

#[async_trait]
impl HostFunction for Base64EncodeFn {
    fn name(&self) -> &'static str {
        "base64Encode"
    }

    fn description(&self) -> &'static str {
        "Base64-encode a UTF-8 string"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let text = require_text(args, 0, "text")?;
        Ok(success(json!({ "result": BASE64_STANDARD.encode(text.as_bytes()) })))
    }
}

pub struct Base64DecodeFn;

#[async_trait]
impl HostFunction for Base64DecodeFn {
    fn name(&self) -> &'static str {
        "base64Decode"
    }

    fn description(&self) -> &'static str {
        "Decode base64 into a UTF-8 string"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let encoded = require_text(args, 0, "text")?;
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| SandboxError::invalid_input(format!("invalid base64: {}", e)))?;
        Ok(success(json!({
            "result": String::from_utf8_lossy(&bytes),
            "bytes": bytes.len(),
        })))
    }
}

pub struct RandomIntFn;

#[async_trait]
impl HostFunction for RandomIntFn {
    fn name(&self) -> &'static str {
        "randomInt"
    }

    fn description(&self) -> &'static str {
        "Random integer in the inclusive range [min, max]"
    }

    fn arity(&self) -> usize {
        2
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let bound = |index: usize, name: &str| {
            arg(args, index)
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| v as i64)
                .ok_or_else(|| SandboxError::invalid_input(format!("'{}' must be a number", name)))
        };
        let min = bound(0, "min")?;
        let max = bound(1, "max")?;
        if min > max {
            return Err(SandboxError::invalid_input(format!(
                "min ({}) must not exceed max ({})",
                min, max
            ))
            .into());
        }
        let value = rand::thread_rng().gen_range(min..=max);
        Ok(success(json!({ "value": value })))
    }
}

pub struct RegexTestFn;

#[async_trait]
impl HostFunction for RegexTestFn {
    fn name(&self) -> &'static str {
        "regexTest"
    }

    fn description(&self) -> &'static str {
        "Test a regular expression against text and return every match"
    }

    fn arity(&self) -> usize {
        2
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let pattern = require_str(args, 0, "pattern")?;
        let text = require_text(args, 1, "text")?;
        let re = Regex::new(&pattern)
            .map_err(|e| SandboxError::invalid_input(format!("invalid pattern: {}", e)))?;
        let matches: Vec<&str> = re.find_iter(&text).map(|m| m.as_str()).collect();
        Ok(success(json!({
            "matched": !matches.is_empty(),
            "matches": matches,
        })))
    }
}

pub struct DetectFileTypeFn;

#[async_trait]
impl HostFunction for DetectFileTypeFn {
    fn name(&self) -> &'static str {
        "detectFileType"
    }

    fn description(&self) -> &'static str {
        "Identify a file's type from its leading bytes"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        let kind = filetype::sniff_path(&path).await?;
        Ok(success(json!({
            "path": path.display().to_string(),
            "mime": kind.mime,
            "extension": kind.extension,
            "category": kind.category,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::ErrorCode;

    fn code(err: &anyhow::Error) -> ErrorCode {
        err.downcast_ref::<SandboxError>().unwrap().code()
    }

    #[tokio::test]
    async fn base64_round_trips_text() {
        let encoded = Base64EncodeFn.call(&[json!("héllo")]).await.unwrap();
        let decoded = Base64DecodeFn.call(&[encoded["result"].clone()]).await.unwrap();
        assert_eq!(decoded["result"], "héllo");
        let err = Base64DecodeFn.call(&[json!("!!!")]).await.unwrap_err();
        assert_eq!(code(&err), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn random_int_respects_bounds() {
        for _ in 0..50 {
            let value = RandomIntFn.call(&[json!(3), json!(5)]).await.unwrap()["value"]
                .as_i64()
                .unwrap();
            assert!((3..=5).contains(&value));
        }
        let err = RandomIntFn.call(&[json!(9), json!(1)]).await.unwrap_err();
        assert_eq!(code(&err), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn regex_test_lists_matches() {
        let result = RegexTestFn
            .call(&[json!(r"\d+"), json!("a1 b22 c333")])
            .await
            .unwrap();
        assert_eq!(result["matched"], true);
        assert_eq!(result["matches"], json!(["1", "22", "333"]));
        let err = RegexTestFn.call(&[json!("("), json!("x")]).await.unwrap_err();
        assert_eq!(code(&err), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn sleep_rejects_negative_values() {
        assert!(SleepFn.call(&[json!(-5)]).await.is_err());
        let result = SleepFn.call(&[json!(1)]).await.unwrap();
        assert_eq!(result["slept_ms"], 1);
    }

    #[tokio::test]
    async fn detect_file_type_reports_missing_files() {
        let err = DetectFileTypeFn
            .call(&[json!("/definitely/not/here.bin")])
            .await
            .unwrap_err();
        assert_eq!(code(&err), ErrorCode::FileNotFound);
    }
}
