use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod events;
mod extract;
mod io;
mod llm;
mod process;
mod record;
mod sequencer;
mod store;
mod telemetry;

use config::ServerCfg;
use events::Broadcaster;
use sequencer::{Availability, RunOptions, Sequencer};

/// Benchmark dashboard: runs sysbench/LLM stages and streams their output.
#[derive(Parser)]
#[command(name = "benchdash")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the dashboard API and websocket control channel
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },
    /// Run one benchmark without a server, printing progress to stdout
    Run {
        label: String,
        #[arg(long)]
        gpu: bool,
        #[arg(long)]
        ollama: bool,
        /// LLM model to benchmark (implies --ollama)
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List the models installed in the LLM runtime
    Models {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { bind, config, runs_dir } => {
            let mut cfg = ServerCfg::load(config.as_deref()).await?;
            if let Some(bind) = bind { cfg.bind = bind; }
            if let Some(dir) = runs_dir { cfg.runs_dir = dir; }
            api::serve(cfg).await
        }
        Commands::Run { label, gpu, ollama, model, config } => {
            let cfg = ServerCfg::load(config.as_deref()).await?;
            let opts = RunOptions { include_gpu: gpu, include_llm: ollama || model.is_some(), llm_model: model };
            run_headless(cfg, &label, opts).await
        }
        Commands::Models { config } => {
            let cfg = ServerCfg::load(config.as_deref()).await?;
            let tool = llm::LlmTool::new(cfg.tools.ollama.clone(), cfg.llm.clone());
            let models = tool
                .list_models(cfg.telemetry.probe_timeout())
                .await
                .context("Failed to list LLM models")?;
            if models.is_empty() {
                println!("No models installed");
            }
            for m in models {
                println!("{:<40} {}", m.name, m.size);
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "benchdash=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_headless(cfg: ServerCfg, label: &str, opts: RunOptions) -> Result<()> {
    let tools = Availability::probe(&cfg).await;
    let events = Arc::new(Broadcaster::new(cfg.viewer_queue.max(4096)));
    let (viewer, mut rx) = events.register();
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{line}");
        }
    });

    let seq = Sequencer::new(Arc::new(cfg), events.clone(), tools);
    seq.store().ensure_root().await.context("Failed to create runs directory")?;
    let result = seq.run(label, opts).await;

    events.deregister(viewer);
    let _ = printer.await;
    result.with_context(|| format!("Run {label} failed"))?;
    Ok(())
}
