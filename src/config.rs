use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::CommandSpec;

/// An external tool: the executable plus any arguments that must precede
/// the per-invocation ones (e.g. a wrapper like `sudo -n`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCmd {
    pub program: String,
    #[serde(default)]
    pub prefix_args: Vec<String>,
}

impl ToolCmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), prefix_args: Vec::new() }
    }

    /// Builds a command for this tool with `args` appended after the prefix.
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.program.clone())
            .args(self.prefix_args.iter().cloned())
            .args(args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsCfg {
    pub sysbench: ToolCmd,
    pub ollama: ToolCmd,
    pub nvidia_smi: ToolCmd,
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self {
            sysbench: ToolCmd::new("sysbench"),
            ollama: ToolCmd::new("ollama"),
            nvidia_smi: ToolCmd::new("nvidia-smi"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesCfg {
    pub cpu_time_secs: u32,
    pub memory_block_size: String,
    pub memory_total_size: String,
    pub include_disk: bool,
    pub disk_total_size: String,
    pub disk_test_mode: String,
}

impl Default for StagesCfg {
    fn default() -> Self {
        Self {
            cpu_time_secs: 20,
            memory_block_size: "1M".into(),
            memory_total_size: "10G".into(),
            include_disk: true,
            disk_total_size: "5G".into(),
            disk_test_mode: "seqrd".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryCfg {
    pub interval_ms: u64,
    pub query_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for TelemetryCfg {
    fn default() -> Self {
        Self { interval_ms: 2_000, query_timeout_ms: 5_000, probe_timeout_ms: 5_000, stop_timeout_ms: 3_000 }
    }
}

impl TelemetryCfg {
    pub fn interval(&self) -> Duration { Duration::from_millis(self.interval_ms) }
    pub fn query_timeout(&self) -> Duration { Duration::from_millis(self.query_timeout_ms) }
    pub fn probe_timeout(&self) -> Duration { Duration::from_millis(self.probe_timeout_ms) }
    pub fn stop_timeout(&self) -> Duration { Duration::from_millis(self.stop_timeout_ms) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmCfg {
    pub prompt: String,
    pub default_model: String,
    /// Pull `default_model` when the runtime has no models at all.
    /// Off unless explicitly enabled: a pull can take many minutes and gigabytes.
    pub auto_install: bool,
    pub install_timeout_secs: u64,
    pub verbose: bool,
}

impl Default for LlmCfg {
    fn default() -> Self {
        Self {
            prompt: "Explain quantum computing in simple terms.".into(),
            default_model: "llama3.1:8b".into(),
            auto_install: false,
            install_timeout_secs: 1_800,
            verbose: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub bind: String,
    pub runs_dir: PathBuf,
    pub static_dir: PathBuf,
    pub viewer_queue: usize,
    pub tools: ToolsCfg,
    pub stages: StagesCfg,
    pub telemetry: TelemetryCfg,
    pub llm: LlmCfg,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            runs_dir: PathBuf::from("runs"),
            static_dir: PathBuf::from("static"),
            viewer_queue: 256,
            tools: ToolsCfg::default(),
            stages: StagesCfg::default(),
            telemetry: TelemetryCfg::default(),
            llm: LlmCfg::default(),
        }
    }
}

impl ServerCfg {
    /// Reads the YAML file if given, then applies `BENCHDASH_*` overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let txt = tokio::fs::read_to_string(p)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                serde_yaml::from_str::<ServerCfg>(&txt).context("Failed to parse config YAML")?
            }
            None => ServerCfg::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("BENCHDASH_BIND") { self.bind = v; }
        if let Ok(v) = std::env::var("BENCHDASH_RUNS_DIR") { self.runs_dir = PathBuf::from(v); }
        if let Ok(v) = std::env::var("BENCHDASH_STATIC_DIR") { self.static_dir = PathBuf::from(v); }
        if let Some(v) = std::env::var("BENCHDASH_AUTO_INSTALL").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
            self.llm.auto_install = v;
        }
    }
}
