use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BROWSER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Sandbox settings. Build it with the `with_*` mutators before handing it to
/// a [`Sandbox`](crate::Sandbox); the sandbox never changes it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub default_timeout: Duration,
    pub http_timeout: Duration,
    /// Lifetime of a browser session.
    pub browser_timeout: Duration,
    pub max_file_size: u64,
    /// Lowercase extensions without the dot. Empty allows every type.
    pub allowed_file_types: Vec<String>,
    pub headless: bool,
    pub enable_browser: bool,
    pub enable_filesystem: bool,
    pub enable_http: bool,
    pub enable_documents: bool,
    pub enable_image_processing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            browser_timeout: DEFAULT_BROWSER_TIMEOUT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_file_types: Vec::new(),
            headless: true,
            enable_browser: true,
            enable_filesystem: true,
            enable_http: true,
            enable_documents: true,
            enable_image_processing: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_browser_timeout(mut self, timeout: Duration) -> Self {
        self.browser_timeout = timeout;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_allowed_file_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_file_types = types
            .into_iter()
            .map(|t| normalize_extension(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_browser(mut self, enabled: bool) -> Self {
        self.enable_browser = enabled;
        self
    }

    pub fn with_filesystem(mut self, enabled: bool) -> Self {
        self.enable_filesystem = enabled;
        self
    }

    pub fn with_http(mut self, enabled: bool) -> Self {
        self.enable_http = enabled;
        self
    }

    pub fn with_documents(mut self, enabled: bool) -> Self {
        self.enable_documents = enabled;
        self
    }

    pub fn with_image_processing(mut self, enabled: bool) -> Self {
        self.enable_image_processing = enabled;
        self
    }

    /// Disable a capability group by its script-facing name.
    pub fn without_group(self, group: &str) -> Result<Self> {
        let config = match group.trim().to_lowercase().as_str() {
            "browser" => self.with_browser(false),
            "filesystem" | "fs" => self.with_filesystem(false),
            "http" => self.with_http(false),
            "documents" => self.with_documents(false),
            "images" | "image_processing" => self.with_image_processing(false),
            other => return Err(anyhow!("unknown capability group '{}'", other)),
        };
        Ok(config)
    }

    /// Whether `path` may be read or written under `allowed_file_types`.
    pub fn allows_file(&self, path: &Path) -> bool {
        if self.allowed_file_types.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .map(|ext| self.allowed_file_types.iter().any(|t| *t == ext))
            .unwrap_or(false)
    }

    pub fn enabled_groups(&self) -> Vec<&'static str> {
        let mut groups = Vec::new();
        if self.enable_filesystem {
            groups.push("filesystem");
        }
        if self.enable_http {
            groups.push("http");
        }
        if self.enable_documents {
            groups.push("documents");
        }
        if self.enable_image_processing {
            groups.push("images");
        }
        if self.enable_browser {
            groups.push("browser");
        }
        groups
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let file: ConfigFile = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;
        Ok(file.into_config(Self::default()))
    }

    /// Overlay `SCRIPTBOX_*` environment variables on top of `self`.
    pub fn from_env(self) -> Result<Self> {
        let mut config = self;
        if let Some(ms) = env_u64("SCRIPTBOX_DEFAULT_TIMEOUT_MS")? {
            config = config.with_default_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64("SCRIPTBOX_HTTP_TIMEOUT_MS")? {
            config = config.with_http_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64("SCRIPTBOX_BROWSER_TIMEOUT_MS")? {
            config = config.with_browser_timeout(Duration::from_millis(ms));
        }
        if let Some(bytes) = env_u64("SCRIPTBOX_MAX_FILE_SIZE")? {
            config = config.with_max_file_size(bytes);
        }
        if let Ok(raw) = std::env::var("SCRIPTBOX_HEADLESS") {
            config = config.with_headless(parse_bool(&raw)?);
        }
        if let Ok(raw) = std::env::var("SCRIPTBOX_DISABLE") {
            for group in raw.split(',').filter(|g| !g.trim().is_empty()) {
                config = config.without_group(group)?;
            }
        }
        Ok(config)
    }
}

/// On-disk form of [`Config`]. Durations are milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    default_timeout_ms: Option<u64>,
    http_timeout_ms: Option<u64>,
    browser_timeout_ms: Option<u64>,
    max_file_size: Option<u64>,
    allowed_file_types: Option<Vec<String>>,
    headless: Option<bool>,
    enable_browser: Option<bool>,
    enable_filesystem: Option<bool>,
    enable_http: Option<bool>,
    enable_documents: Option<bool>,
    enable_image_processing: Option<bool>,
}

impl ConfigFile {
    fn into_config(self, base: Config) -> Config {
        let mut config = base;
        if let Some(ms) = self.default_timeout_ms {
            config = config.with_default_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.http_timeout_ms {
            config = config.with_http_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.browser_timeout_ms {
            config = config.with_browser_timeout(Duration::from_millis(ms));
        }
        if let Some(bytes) = self.max_file_size {
            config = config.with_max_file_size(bytes);
        }
        if let Some(types) = self.allowed_file_types {
            config = config.with_allowed_file_types(types);
        }
        if let Some(headless) = self.headless {
            config = config.with_headless(headless);
        }
        config.enable_browser = self.enable_browser.unwrap_or(config.enable_browser);
        config.enable_filesystem = self.enable_filesystem.unwrap_or(config.enable_filesystem);
        config.enable_http = self.enable_http.unwrap_or(config.enable_http);
        config.enable_documents = self.enable_documents.unwrap_or(config.enable_documents);
        config.enable_image_processing = self
            .enable_image_processing
            .unwrap_or(config.enable_image_processing);
        config
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an integer, got '{}'", key, raw)),
        Err(_) => Ok(None),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(anyhow!("invalid boolean '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_enable_everything() {
        let config = Config::default();
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.browser_timeout, Duration::from_secs(60));
        assert_eq!(config.max_file_size, 100 * 1024 * 1024);
        assert!(config.headless);
        assert_eq!(
            config.enabled_groups(),
            vec!["filesystem", "http", "documents", "images", "browser"]
        );
    }

    #[test]
    fn mutators_chain_into_a_new_config() {
        let base = Config::default();
        let config = base
            .clone()
            .with_default_timeout(Duration::from_millis(250))
            .with_browser(false)
            .with_allowed_file_types([".TXT", "json", " "]);
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert!(!config.enable_browser);
        assert_eq!(config.allowed_file_types, vec!["txt", "json"]);
        assert!(base.enable_browser);
    }

    #[test]
    fn allowed_file_types_filter_paths() {
        let config = Config::default().with_allowed_file_types(["txt"]);
        assert!(config.allows_file(Path::new("/tmp/notes.TXT")));
        assert!(!config.allows_file(Path::new("/tmp/image.png")));
        assert!(!config.allows_file(Path::new("/tmp/Makefile")));
        assert!(Config::default().allows_file(Path::new("/tmp/Makefile")));
    }

    #[test]
    fn without_group_rejects_unknown_names() {
        let config = Config::default().without_group("http").unwrap();
        assert!(!config.enable_http);
        assert!(Config::default().without_group("teleport").is_err());
    }

    #[test]
    fn load_from_path_reads_milliseconds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"default_timeout_ms": 1500, "enable_http": false, "allowed_file_types": ["CSV"]}}"#
        )
        .unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert!(!config.enable_http);
        assert!(config.enable_browser);
        assert_eq!(config.allowed_file_types, vec!["csv"]);
    }
}
