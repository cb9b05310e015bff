use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use globset::{GlobBuilder, GlobSetBuilder};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use super::success;
use crate::sandbox::config::Config;
use crate::sandbox::convert::{optional_object, optional_str, require_str, require_text};
use crate::sandbox::error::{ErrorCode, SandboxError};
use crate::sandbox::registrar::{CapabilityGroup, HostContext, HostFunction};

const MAX_FIND_RESULTS: usize = 1000;

pub struct FilesystemGroup;

impl CapabilityGroup for FilesystemGroup {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn functions(&self, host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        let config = host.config.clone();
        vec![
            Arc::new(ReadFileFn::new(config.clone())),
            Arc::new(WriteFileFn::new(config.clone(), false)),
            Arc::new(WriteFileFn::new(config.clone(), true)),
            Arc::new(ListDirFn),
            Arc::new(FileExistsFn),
            Arc::new(DeleteFileFn::new(config.clone())),
            Arc::new(MakeDirFn),
            Arc::new(FindFilesFn),
        ]
    }
}

fn allowed_path(config: &Config, raw: String) -> std::result::Result<PathBuf, SandboxError> {
    let path = PathBuf::from(raw);
    if !config.allows_file(&path) {
        return Err(SandboxError::invalid_input(format!(
            "file type of {} is not allowed",
            path.display()
        )));
    }
    Ok(path)
}

fn too_large(path: &Path, size: u64, limit: u64) -> SandboxError {
    SandboxError::new(
        ErrorCode::FilesystemError,
        format!(
            "{} is {} bytes, over the {} byte limit",
            path.display(),
            size,
            limit
        ),
    )
}

pub struct ReadFileFn {
    config: Arc<Config>,
}

impl ReadFileFn {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostFunction for ReadFileFn {
    fn name(&self) -> &'static str {
        "readFile"
    }

    fn description(&self) -> &'static str {
        "Read a file as UTF-8 text, or base64 with encoding 'base64'"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = allowed_path(&self.config, require_str(args, 0, "path")?)?;
        let encoding = optional_str(args, 1).unwrap_or_else(|| "utf8".to_string());
        let size = fs::metadata(&path).await?.len();
        if size > self.config.max_file_size {
            return Err(too_large(&path, size, self.config.max_file_size).into());
        }
        let bytes = fs::read(&path).await?;
        let content = match encoding.to_lowercase().as_str() {
            "base64" => BASE64_STANDARD.encode(&bytes),
            "utf8" | "utf-8" | "text" => String::from_utf8_lossy(&bytes).into_owned(),
            other => {
                return Err(
                    SandboxError::invalid_input(format!("unknown encoding '{}'", other)).into(),
                )
            }
        };
        Ok(success(json!({
            "path": path.display().to_string(),
            "content": content,
            "size": size,
        })))
    }
}

/// `writeFile` and `appendFile`.
pub struct WriteFileFn {
    config: Arc<Config>,
    append: bool,
}

impl WriteFileFn {
    pub fn new(config: Arc<Config>, append: bool) -> Self {
        Self { config, append }
    }
}

#[async_trait]
impl HostFunction for WriteFileFn {
    fn name(&self) -> &'static str {
        if self.append {
            "appendFile"
        } else {
            "writeFile"
        }
    }

    fn description(&self) -> &'static str {
        if self.append {
            "Append text to a file, creating it if needed"
        } else {
            "Write text to a file, creating parent directories"
        }
    }

    fn arity(&self) -> usize {
        2
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = allowed_path(&self.config, require_str(args, 0, "path")?)?;
        let content = require_text(args, 1, "content")?;
        let existing = if self.append {
            fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        let total = existing + content.len() as u64;
        if total > self.config.max_file_size {
            return Err(too_large(&path, total, self.config.max_file_size).into());
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        if self.append {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        } else {
            fs::write(&path, content.as_bytes()).await?;
        }
        Ok(success(json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
            "size": total,
        })))
    }
}

pub struct ListDirFn;

#[async_trait]
impl HostFunction for ListDirFn {
    fn name(&self) -> &'static str {
        "listDir"
    }

    fn description(&self) -> &'static str {
        "List the entries of a directory"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let dir = PathBuf::from(require_str(args, 0, "path")?);
        let mut reader = fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "path": entry.path().display().to_string(),
                "is_dir": meta.is_dir(),
                "size": meta.len(),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(success(json!({
            "path": dir.display().to_string(),
            "count": entries.len(),
            "entries": entries,
        })))
    }
}

pub struct FileExistsFn;

#[async_trait]
impl HostFunction for FileExistsFn {
    fn name(&self) -> &'static str {
        "fileExists"
    }

    fn description(&self) -> &'static str {
        "Whether a path exists, and whether it is a file or a directory"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        let meta = fs::metadata(&path).await.ok();
        Ok(success(json!({
            "exists": meta.is_some(),
            "is_file": meta.as_ref().map(|m| m.is_file()).unwrap_or(false),
            "is_dir": meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
        })))
    }
}

pub struct DeleteFileFn {
    config: Arc<Config>,
}

impl DeleteFileFn {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostFunction for DeleteFileFn {
    fn name(&self) -> &'static str {
        "deleteFile"
    }

    fn description(&self) -> &'static str {
        "Delete a file, or a directory with { recursive: true }"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        let recursive = optional_object(args, 1, "options")?
            .and_then(|o| o.get("recursive"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let meta = fs::metadata(&path).await?;
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_dir(&path).await?;
            }
        } else {
            if !self.config.allows_file(&path) {
                return Err(SandboxError::invalid_input(format!(
                    "file type of {} is not allowed",
                    path.display()
                ))
                .into());
            }
            fs::remove_file(&path).await?;
        }
        Ok(success(json!({ "path": path.display().to_string() })))
    }
}

pub struct MakeDirFn;

#[async_trait]
impl HostFunction for MakeDirFn {
    fn name(&self) -> &'static str {
        "makeDir"
    }

    fn description(&self) -> &'static str {
        "Create a directory and any missing parents"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let path = PathBuf::from(require_str(args, 0, "path")?);
        fs::create_dir_all(&path).await?;
        Ok(success(json!({ "path": path.display().to_string() })))
    }
}

pub struct FindFilesFn;

#[async_trait]
impl HostFunction for FindFilesFn {
    fn name(&self) -> &'static str {
        "findFiles"
    }

    fn description(&self) -> &'static str {
        "Recursively find files under a directory whose path matches a glob"
    }

    fn arity(&self) -> usize {
        2
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let root = PathBuf::from(require_str(args, 0, "root")?);
        let pattern = require_str(args, 1, "pattern")?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(SandboxError::invalid_input(format!(
                "{} is not a directory",
                root.display()
            ))
            .into());
        }
        let glob = GlobBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SandboxError::invalid_input(format!("invalid glob: {}", e)))?;
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let set = builder.build()?;

        let (matches, truncated) = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let relative = path.strip_prefix(&root).unwrap_or(path);
                if set.is_match(relative) || set.is_match(path) {
                    if matches.len() == MAX_FIND_RESULTS {
                        return (matches, true);
                    }
                    matches.push(path.display().to_string());
                }
            }
            (matches, false)
        })
        .await?;

        Ok(success(json!({
            "count": matches.len(),
            "matches": matches,
            "truncated": truncated,
        })))
    }
}
