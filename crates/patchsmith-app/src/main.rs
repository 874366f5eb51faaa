//! patchsmith - apply a plan to a workspace through a builder model
//!
//! Thin glue: load config, read the plan and context bundle, run one builder
//! invocation and print the run result as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use patchsmith_adapters::config::Config;
use patchsmith_core::{ContextBundle, Plan, ResponseMode};
use patchsmith_engine::llm::HttpProvider;
use patchsmith_engine::{BuilderError, BuilderRunner, Interpreter, RunRequest, RunnerOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "patchsmith",
    about = "Turn an approved plan into applied file edits",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one builder invocation against a workspace
    Run {
        /// Workspace root (defaults to current directory)
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Plan JSON file
        #[arg(long)]
        plan: PathBuf,

        /// Context bundle JSON file
        #[arg(long)]
        context: Option<PathBuf>,

        /// Natural-language intent
        #[arg(long)]
        intent: String,

        /// Conversation lane id (a fresh one when omitted)
        #[arg(long)]
        lane: Option<String>,

        /// Override the configured response mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    ToolCalls,
    PatchJson,
    Freeform,
}

impl From<ModeArg> for ResponseMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::ToolCalls => ResponseMode::ToolCalls,
            ModeArg::PatchJson => ResponseMode::PatchJson,
            ModeArg::Freeform => ResponseMode::Freeform,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PATCHSMITH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {}", what, path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {} in {}", what, path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Run {
            workspace,
            plan,
            context,
            intent,
            lane,
            mode,
        } => {
            let root = workspace
                .canonicalize()
                .with_context(|| format!("Workspace not found: {}", workspace.display()))?;
            let config = Config::load_for_workspace(&root)?;
            tracing::debug!(workspace = %root.display(), model = %config.provider.model, "config loaded");

            let plan: Plan = read_json(&plan, "plan")?;
            let bundle: ContextBundle = match context {
                Some(path) => read_json(&path, "context bundle")?,
                None => ContextBundle::default(),
            };

            let mut options = RunnerOptions::from(&config.runner);
            if let Some(mode) = mode {
                options.response_mode = mode.into();
            }

            let provider = Arc::new(HttpProvider::from_settings(&config.provider)?);
            let interpreter =
                Interpreter::new(Arc::new(HttpProvider::from_settings(config.interpreter_settings())?));
            let runner = BuilderRunner::new(provider, &root)
                .with_options(options)
                .with_interpreter(interpreter);

            let request = RunRequest {
                lane: lane.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                intent,
                plan,
                bundle,
            };

            match runner.run(request).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(())
                }
                Err(err) => {
                    if !err.history().is_empty() {
                        eprintln!("{}", serde_json::to_string_pretty(err.history())?);
                    }
                    if let BuilderError::RollbackFailed { .. } = err {
                        eprintln!("  ! Workspace may be partially patched; inspect it before retrying.");
                    }
                    Err(err.into())
                }
            }
        }
    }
}
