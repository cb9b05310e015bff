use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde_json::{json, Value};

use super::{filetype, success};
use crate::sandbox::config::Config;
use crate::sandbox::convert::require_str;
use crate::sandbox::error::{ErrorCode, SandboxError};
use crate::sandbox::registrar::{CapabilityGroup, HostContext, HostFunction};

static SCRIPT_OR_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)\s*>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f\v]+").unwrap());
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());

pub struct DocumentsGroup;

impl CapabilityGroup for DocumentsGroup {
    fn name(&self) -> &'static str {
        "documents"
    }

    fn functions(&self, host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        vec![
            Arc::new(ExtractTextFn {
                config: host.config.clone(),
            }),
            Arc::new(ReadJsonFn {
                config: host.config.clone(),
            }),
        ]
    }
}

fn document_error(message: impl Into<String>) -> SandboxError {
    SandboxError::new(ErrorCode::DocumentError, message)
}

async fn read_limited(config: &Config, path: &Path) -> std::result::Result<Vec<u8>, SandboxError> {
    if !config.allows_file(path) {
        return Err(SandboxError::invalid_input(format!(
            "file type of {} is not allowed",
            path.display()
        )));
    }
    let size = tokio::fs::metadata(path).await?.len();
    if size > config.max_file_size {
        return Err(document_error(format!(
            "{} is {} bytes, over the {} byte limit",
            path.display(),
            size,
            config.max_file_size
        )));
    }
    Ok(tokio::fs::read(path).await?)
}

pub struct ExtractTextFn {
    config: Arc<Config>,
}

#[async_trait]
impl HostFunction for ExtractTextFn {
    fn name(&self) -> &'static str {
        "extractText"
    }

    fn description(&self) -> &'static str {
        "Plain text of a text, XML or HTML document"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        let bytes = read_limited(&self.config, &path).await?;
        let kind = filetype::sniff(&bytes[..bytes.len().min(512)]);
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let markup = matches!(extension.as_str(), "xml" | "html" | "htm" | "xhtml" | "svg")
            || matches!(kind.extension, "xml" | "html");
        let (format, text) = if markup {
            let source = String::from_utf8_lossy(&bytes);
            let text = markup_text(&source).unwrap_or_else(|| strip_tags(&source));
            ("markup", text)
        } else if kind == filetype::BINARY || kind.category == "image" || kind.category == "archive" || kind.extension == "pdf" {
            return Err(document_error(format!(
                "cannot extract text from {} ({})",
                path.display(),
                kind.mime
            ))
            .into());
        } else {
            ("text", String::from_utf8_lossy(&bytes).into_owned())
        };

        Ok(success(json!({
            "path": path.display().to_string(),
            "format": format,
            "length": text.chars().count(),
            "text": text,
        })))
    }
}

/// Text nodes of well-formed markup. `None` when the document does not parse.
fn markup_text(source: &str) -> Option<String> {
    let mut reader = Reader::from_str(source);
    reader.trim_text(true);
    let mut parts: Vec<String> = Vec::new();
    let mut skipping = 0usize;
    loop {
        match reader.read_event().ok()? {
            Event::Start(tag) => {
                if matches!(tag.name().as_ref(), b"script" | b"style") {
                    skipping += 1;
                }
            }
            Event::End(tag) => {
                if matches!(tag.name().as_ref(), b"script" | b"style") {
                    skipping = skipping.saturating_sub(1);
                }
            }
            Event::Text(text) if skipping == 0 => {
                let decoded = text.unescape().ok()?;
                let trimmed = decoded.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            Event::CData(data) if skipping == 0 => {
                let raw = data.into_inner();
                let text = String::from_utf8_lossy(&raw);
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Some(parts.join("\n"))
}

/// Lenient fallback for markup quick-xml rejects, such as most real HTML.
fn strip_tags(source: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(source, " ");
    let without_tags = TAG.replace_all(&without_code, "\n");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let collapsed = BLANKS.replace_all(&decoded, " ");
    BLANK_LINES
        .replace_all(&collapsed, "\n")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ReadJsonFn {
    config: Arc<Config>,
}

#[async_trait]
impl HostFunction for ReadJsonFn {
    fn name(&self) -> &'static str {
        "readJSON"
    }

    fn description(&self) -> &'static str {
        "Parse a JSON file"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        let bytes = read_limited(&self.config, &path).await?;
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| {
            document_error(format!("{} is not valid JSON: {}", path.display(), e))
        })?;
        Ok(success(json!({
            "path": path.display().to_string(),
            "data": data,
        })))
    }
}
