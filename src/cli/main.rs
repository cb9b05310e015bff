use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use scriptbox::{shared, CancellationToken, Config, Sandbox};

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(about = "Run a JavaScript file inside a capability sandbox")]
struct Args {
    /// Script file to run
    #[arg(required_unless_present = "eval")]
    file: Option<PathBuf>,

    /// Inline script source
    #[arg(short, long, conflicts_with = "file")]
    eval: Option<String>,

    /// Deadline in milliseconds; 0 uses the configured default
    #[arg(long, env = "SCRIPTBOX_TIMEOUT_MS", default_value_t = 0)]
    timeout_ms: u64,

    /// JSON config file
    #[arg(long, env = "SCRIPTBOX_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    no_browser: bool,

    #[arg(long)]
    no_fs: bool,

    #[arg(long)]
    no_http: bool,

    #[arg(long)]
    no_documents: bool,

    #[arg(long)]
    no_images: bool,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Also write logs to this directory
    #[arg(long, env = "SCRIPTBOX_LOG_DIR")]
    log_dir: Option<String>,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::load_from_path(path)?,
            None => Config::default(),
        };
        let mut config = base.from_env()?;
        if self.no_browser {
            config = config.with_browser(false);
        }
        if self.no_fs {
            config = config.with_filesystem(false);
        }
        if self.no_http {
            config = config.with_http(false);
        }
        if self.no_documents {
            config = config.with_documents(false);
        }
        if self.no_images {
            config = config.with_image_processing(false);
        }
        if self.headed {
            config = config.with_headless(false);
        }
        Ok(config)
    }

    fn script(&self) -> Result<String> {
        match (&self.eval, &self.file) {
            (Some(source), _) => Ok(source.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script {}", path.display())),
            (None, None) => anyhow::bail!("either a script file or --eval is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    match &args.log_dir {
        Some(dir) => {
            let _ = shared::init_service_logging(dir, "scriptbox");
        }
        None => {
            let _ = shared::init_console_logging();
        }
    }

    let config = args.config()?;
    let script = args.script()?;

    let root = CancellationToken::new();
    let interrupt = root.clone();
    ctrlc::set_handler(move || {
        info!("Interrupt received, cancelling sandbox");
        interrupt.cancel();
    })?;

    let sandbox = Sandbox::new(root, Some(config))?;
    let outcome = sandbox
        .run_with_deadline(&script, Duration::from_millis(args.timeout_ms))
        .await;
    sandbox.close().await;

    let (report, code) = match outcome {
        Ok(value) => (json!({ "success": true, "value": value }), ExitCode::SUCCESS),
        Err(err) => {
            error!(code = %err.code(), "Script failed: {}", err.message());
            (
                json!({ "success": false, "code": err.code(), "error": err.message() }),
                ExitCode::FAILURE,
            )
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(code)
}
