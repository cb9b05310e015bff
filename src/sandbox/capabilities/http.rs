use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::success;
use crate::sandbox::config::Config;
use crate::sandbox::convert::{arg, optional_object, require_str, type_name, u64_value};
use crate::sandbox::error::{ErrorCode, SandboxError};
use crate::sandbox::registrar::{CapabilityGroup, HostContext, HostFunction};

pub struct HttpGroup;

impl CapabilityGroup for HttpGroup {
    fn name(&self) -> &'static str {
        "http"
    }

    fn functions(&self, host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        let http = Arc::new(HttpClient::new(&host.config));
        vec![
            Arc::new(HttpRequestFn { http: http.clone() }),
            Arc::new(HttpGetFn { http: http.clone() }),
            Arc::new(HttpPostFn { http }),
        ]
    }
}

fn http_error(message: impl Into<String>) -> SandboxError {
    SandboxError::new(ErrorCode::HttpError, message)
}

pub struct HttpClient {
    client: Client,
    max_body: u64,
}

impl HttpClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("scriptbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            max_body: config.max_file_size,
        }
    }

    /// Perform the request described by `options`. Non-2xx statuses come back
    /// as a failed structured result that still carries status and body.
    pub async fn request(&self, options: &Map<String, Value>) -> Result<Value> {
        let url = options
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SandboxError::invalid_input("request needs a 'url'"))?;
        let url = url::Url::parse(url)
            .map_err(|e| SandboxError::invalid_input(format!("invalid URL '{}': {}", url, e)))?;
        let method = options
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| SandboxError::invalid_input(format!("invalid method '{}'", method)))?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers(options.get("headers"))?);
        if let Some(ms) = u64_value(options.get("timeout").unwrap_or(&Value::Null), "timeout")? {
            request = request.timeout(Duration::from_millis(ms));
        }
        if let Some(body) = options.get("json").filter(|v| !v.is_null()) {
            request = request.json(body);
        } else if let Some(body) = options.get("body").filter(|v| !v.is_null()) {
            request = match body {
                Value::String(text) => request.body(text.clone()),
                other => request.json(other),
            };
        }

        debug!(%method, %url, "HTTP request");
        let response = request
            .send()
            .await
            .map_err(|e| http_error(format!("{} {} failed: {}", method, url, e)).with_cause(e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let response_headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let is_json = response_headers
            .get(CONTENT_TYPE.as_str())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| http_error(format!("reading body failed: {}", e)))?;
            if (body.len() + chunk.len()) as u64 > self.max_body {
                return Err(http_error(format!(
                    "response body exceeds the {} byte limit",
                    self.max_body
                ))
                .into());
            }
            body.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&body).into_owned();
        let parsed = if is_json {
            serde_json::from_str::<Value>(&text).ok()
        } else {
            None
        };

        let mut result = json!({
            "status": status.as_u16(),
            "status_text": status.canonical_reason().unwrap_or_default(),
            "url": final_url,
            "headers": response_headers,
            "body": text,
            "json": parsed,
        });
        if status.is_success() {
            Ok(success(result))
        } else {
            if let Value::Object(map) = &mut result {
                map.insert("success".into(), Value::Bool(false));
                map.insert(
                    "error".into(),
                    Value::String(format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or_default()
                    )),
                );
                map.insert("code".into(), json!(ErrorCode::HttpError));
            }
            Ok(result)
        }
    }
}

fn headers(value: Option<&Value>) -> std::result::Result<HeaderMap, SandboxError> {
    let mut map = HeaderMap::new();
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(map);
    };
    let Value::Object(entries) = value else {
        return Err(SandboxError::invalid_input(format!(
            "'headers' must be an object, got {}",
            type_name(value)
        )));
    };
    for (name, value) in entries {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| SandboxError::invalid_input(format!("invalid header name '{}'", name)))?;
        let value = HeaderValue::from_str(&text)
            .map_err(|_| SandboxError::invalid_input(format!("invalid value for header '{}'", name)))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub struct HttpRequestFn {
    http: Arc<HttpClient>,
}

#[async_trait]
impl HostFunction for HttpRequestFn {
    fn name(&self) -> &'static str {
        "httpRequest"
    }

    fn description(&self) -> &'static str {
        "HTTP request from {url, method, headers, body, json, timeout}"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let options = optional_object(args, 0, "options")?
            .ok_or_else(|| SandboxError::invalid_input("httpRequest() needs an options object"))?;
        self.http.request(options).await
    }
}

pub struct HttpGetFn {
    http: Arc<HttpClient>,
}

#[async_trait]
impl HostFunction for HttpGetFn {
    fn name(&self) -> &'static str {
        "httpGet"
    }

    fn description(&self) -> &'static str {
        "Shortcut for httpRequest with method GET"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let mut options = Map::new();
        options.insert("url".into(), json!(require_str(args, 0, "url")?));
        options.insert("method".into(), json!("GET"));
        options.insert("headers".into(), arg(args, 1).clone());
        self.http.request(&options).await
    }
}

pub struct HttpPostFn {
    http: Arc<HttpClient>,
}

#[async_trait]
impl HostFunction for HttpPostFn {
    fn name(&self) -> &'static str {
        "httpPost"
    }

    fn description(&self) -> &'static str {
        "Shortcut for httpRequest with method POST; object bodies are sent as JSON"
    }

    fn arity(&self) -> usize {
        2
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let mut options = Map::new();
        options.insert("url".into(), json!(require_str(args, 0, "url")?));
        options.insert("method".into(), json!("POST"));
        options.insert("body".into(), arg(args, 1).clone());
        options.insert("headers".into(), arg(args, 2).clone());
        self.http.request(&options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection and return the base URL.
    async fn serve(status: &'static str, content_type: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    content_type,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    fn client(config: Config) -> Arc<HttpClient> {
        Arc::new(HttpClient::new(&config))
    }

    #[tokio::test]
    async fn get_parses_json_bodies() {
        let base = serve("200 OK", "application/json", r#"{"ok":true}"#).await;
        let get = HttpGetFn {
            http: client(Config::default()),
        };
        let result = get.call(&[json!(format!("{}/status", base))]).await.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["status"], 200);
        assert_eq!(result["json"]["ok"], true);
    }

    #[tokio::test]
    async fn error_statuses_are_failed_results() {
        let base = serve("404 Not Found", "text/plain", "missing").await;
        let request = HttpRequestFn {
            http: client(Config::default()),
        };
        let result = request
            .call(&[json!({"url": base, "method": "post", "body": "x"})])
            .await
            .unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["code"], "HTTP_ERROR");
        assert_eq!(result["status"], 404);
        assert_eq!(result["body"], "missing");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let base = serve("200 OK", "text/plain", "0123456789").await;
        let get = HttpGetFn {
            http: client(Config::default().with_max_file_size(4)),
        };
        let err = get.call(&[json!(base)]).await.unwrap_err();
        let err = err.downcast_ref::<SandboxError>().unwrap();
        assert_eq!(err.code(), ErrorCode::HttpError);
    }

    #[tokio::test]
    async fn malformed_requests_are_usage_errors() {
        let request = HttpRequestFn {
            http: client(Config::default()),
        };
        for options in [
            json!({}),
            json!({"url": "not a url"}),
            json!({"url": "http://x", "headers": 3}),
            json!({"url": "http://x", "timeout": -1}),
            json!({"url": "http://x", "timeout": "100"}),
        ] {
            let err = request.call(&[options]).await.unwrap_err();
            let err = err.downcast_ref::<SandboxError>().unwrap();
            assert_eq!(err.code(), ErrorCode::InvalidInput);
        }
    }
}
