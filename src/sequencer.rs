use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::ServerCfg;
use crate::error::RunError;
use crate::events::{Broadcaster, RunEvent};
use crate::extract::{self, Metrics};
use crate::llm::{LlmTool, ModelChoice};
use crate::process::{self, CommandSpec};
use crate::record::{RunRecord, StageKind};
use crate::store::RunStore;
use crate::telemetry::{self, PollSettings, TelemetryPoller};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub include_gpu: bool,
    pub include_llm: bool,
    pub llm_model: Option<String>,
}

/// Parses `run:<label>[:gpu=..][:ollama=..][:model=..]`. Model tags keep
/// their own colons (`model=llama3.1:8b`).
pub fn parse_control(text: &str) -> Option<(String, RunOptions)> {
    let rest = text.trim().strip_prefix("run:")?;
    let mut parts = rest.split(':');
    let label = parts
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or("unnamed")
        .to_string();

    let mut opts = RunOptions::default();
    let mut in_model = false;
    for part in parts {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("gpu=") {
            opts.include_gpu = v.trim().eq_ignore_ascii_case("true");
            in_model = false;
        } else if let Some(v) = part.strip_prefix("ollama=") {
            opts.include_llm = v.trim().eq_ignore_ascii_case("true");
            in_model = false;
        } else if let Some(v) = part.strip_prefix("model=") {
            opts.llm_model = Some(v.trim().to_string());
            in_model = true;
        } else if in_model {
            if let Some(m) = opts.llm_model.as_mut() {
                m.push(':');
                m.push_str(part);
            }
        }
    }
    opts.llm_model = opts.llm_model.filter(|m| !m.is_empty());
    Some((label, opts))
}

/// One external command of a run. `prepare` and `cleanup` steps run in the
/// same directory around `command`; their output is captured with it.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    /// `None` for stages whose output carries no metrics.
    pub kind: Option<StageKind>,
    pub command: CommandSpec,
    pub working_dir: PathBuf,
    pub prepare: Vec<CommandSpec>,
    pub cleanup: Vec<CommandSpec>,
}

impl Stage {
    fn new(kind: StageKind, command: CommandSpec, working_dir: &Path) -> Self {
        Self {
            name: kind.display_name().to_string(),
            kind: Some(kind),
            command,
            working_dir: working_dir.to_path_buf(),
            prepare: Vec::new(),
            cleanup: Vec::new(),
        }
    }
}

/// Which optional tools answered their startup probe.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Availability {
    pub gpu: bool,
    pub llm: bool,
}

impl Availability {
    pub async fn probe(cfg: &ServerCfg) -> Self {
        let timeout = cfg.telemetry.probe_timeout();
        let llm = LlmTool::new(cfg.tools.ollama.clone(), cfg.llm.clone());
        let gpu_query = cfg.tools.nvidia_smi.command(["-L"]);
        let (gpu, llm) = tokio::join!(process::probe(&gpu_query, timeout), llm.probe(timeout));
        Self { gpu, llm }
    }
}

pub struct Sequencer {
    cfg: Arc<ServerCfg>,
    store: RunStore,
    events: Arc<Broadcaster>,
    tools: Availability,
    llm: LlmTool,
    active: Mutex<HashSet<String>>,
}

/// Holds a label in the active set for the lifetime of a run.
struct ActiveRun<'a> {
    active: &'a Mutex<HashSet<String>>,
    label: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.label);
    }
}

impl Sequencer {
    pub fn new(cfg: Arc<ServerCfg>, events: Arc<Broadcaster>, tools: Availability) -> Self {
        let store = RunStore::new(cfg.runs_dir.clone());
        let llm = LlmTool::new(cfg.tools.ollama.clone(), cfg.llm.clone());
        Self { cfg, store, events, tools, llm, active: Mutex::new(HashSet::new()) }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<Broadcaster> {
        &self.events
    }

    pub fn availability(&self) -> Availability {
        self.tools
    }

    pub fn llm(&self) -> &LlmTool {
        &self.llm
    }

    pub fn config(&self) -> &ServerCfg {
        &self.cfg
    }

    fn claim(&self, label: &str) -> Option<ActiveRun<'_>> {
        self.active
            .lock()
            .insert(label.to_string())
            .then(|| ActiveRun { active: &self.active, label: label.to_string() })
    }

    fn emit(&self, event: RunEvent) {
        self.events.emit(&event);
    }

    fn info(&self, label: &str, msg: impl Into<String>) {
        self.emit(RunEvent::Info { label: label.to_string(), msg: msg.into() });
    }

    fn warning(&self, label: &str, msg: impl Into<String>) {
        self.emit(RunEvent::Warning { label: label.to_string(), msg: msg.into() });
    }

    /// Runs every stage for `label` and persists the result. Only an invalid
    /// label, a label that is already running, or a run directory that cannot
    /// be created end the run early.
    pub async fn run(&self, label: &str, opts: RunOptions) -> Result<RunRecord, RunError> {
        let Some(_active) = self.claim(label) else {
            self.emit(RunEvent::Failed { label: label.to_string(), error: "a run with this label is already in progress".into() });
            return Err(RunError::AlreadyRunning(label.to_string()));
        };

        let run_dir = match self.store.create_run(label).await {
            Ok(dir) => dir,
            Err(e) => {
                error!(label, error = %e, "cannot create run directory");
                self.emit(RunEvent::Failed { label: label.to_string(), error: format!("cannot create run directory: {e}") });
                return Err(e.into());
            }
        };

        info!(label, ?opts, "benchmark started");
        let mut record = RunRecord::new(label);
        self.emit(RunEvent::Started { label: label.to_string(), at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string() });
        self.info(label, format!("📁 Results will be saved to: {}", run_dir.display()));

        let stages = self.build_stages(label, &opts, &run_dir).await;

        let mut poller = TelemetryPoller::new(label);
        let monitoring = self.start_telemetry(&mut poller, label, &opts).await;

        for stage in &stages {
            self.execute_stage(label, stage, &mut record).await;
        }

        record.gpu = poller.stop().await;
        if monitoring && record.gpu.is_empty() {
            self.warning(label, "No GPU samples were collected");
        }

        match self.store.write_record(&record).await {
            Ok(path) => self.info(label, format!("💾 Metrics saved to {}", path.display())),
            Err(e) => {
                error!(label, error = %e, "failed to save metrics");
                self.emit(RunEvent::Failed { label: label.to_string(), error: format!("Failed to save metrics: {e}") });
            }
        }

        for line in summary_lines(&record) {
            self.info(label, line);
        }
        self.emit(RunEvent::Finished { label: label.to_string(), at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string() });
        info!(label, "benchmark finished");
        Ok(record)
    }

    pub async fn build_stages(&self, label: &str, opts: &RunOptions, run_dir: &Path) -> Vec<Stage> {
        let s = &self.cfg.stages;
        let sysbench = &self.cfg.tools.sysbench;
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let time = format!("--time={}", s.cpu_time_secs);

        let mut stages = vec![
            Stage::new(
                StageKind::CpuSingle,
                sysbench.command(["cpu"]).arg("--threads=1").arg(time.clone()).arg("run"),
                run_dir,
            ),
            Stage::new(
                StageKind::CpuAll,
                sysbench.command(["cpu"]).arg(format!("--threads={threads}")).arg(time).arg("run"),
                run_dir,
            ),
            Stage::new(
                StageKind::Memory,
                sysbench
                    .command(["memory"])
                    .arg(format!("--memory-block-size={}", s.memory_block_size))
                    .arg(format!("--memory-total-size={}", s.memory_total_size))
                    .arg("run"),
                run_dir,
            ),
        ];

        if s.include_disk {
            let size = format!("--file-total-size={}", s.disk_total_size);
            let fileio = || sysbench.command(["fileio"]).arg(size.clone());
            let mut disk = Stage::new(
                StageKind::Disk,
                fileio().arg(format!("--file-test-mode={}", s.disk_test_mode)).arg("run"),
                &run_dir.join("disk"),
            );
            disk.prepare.push(fileio().arg("prepare"));
            disk.cleanup.push(fileio().arg("cleanup"));
            stages.push(disk);
        }

        if !opts.include_llm {
            self.info(label, "Ollama benchmark disabled");
        } else if !self.tools.llm {
            self.warning(label, "Ollama not available");
        } else {
            let choice = self
                .llm
                .resolve_model(opts.llm_model.as_deref(), self.cfg.telemetry.probe_timeout(), |msg| self.warning(label, msg))
                .await;
            let (how, model) = match choice {
                ModelChoice::Selected(m) => ("selected", m),
                ModelChoice::FirstAvailable(m) => ("available", m),
                ModelChoice::Installed(m) => ("installed", m),
                ModelChoice::Unavailable(why) => {
                    self.warning(label, format!("LLM model unavailable: {why}"));
                    stages.push(Stage {
                        name: StageKind::Llm.display_name().to_string(),
                        kind: None,
                        command: CommandSpec::new("echo").arg(format!("Ollama not available: {why}")),
                        working_dir: run_dir.to_path_buf(),
                        prepare: Vec::new(),
                        cleanup: Vec::new(),
                    });
                    return stages;
                }
            };
            self.info(label, format!("🤖 Using {how} model: {model}"));
            stages.push(Stage::new(StageKind::Llm, self.llm.run_command(&model), run_dir));
        }

        stages
    }

    /// Returns whether a poller was started.
    async fn start_telemetry(&self, poller: &mut TelemetryPoller, label: &str, opts: &RunOptions) -> bool {
        if !opts.include_gpu {
            return false;
        }
        if !self.tools.gpu {
            self.warning(label, "GPU monitoring not available");
            return false;
        }
        match self.store.telemetry_log(label).await {
            Ok(log) => {
                poller.start(
                    telemetry::query_command(&self.cfg.tools.nvidia_smi),
                    log,
                    self.events.clone(),
                    PollSettings::from(&self.cfg.telemetry),
                );
                self.info(label, "🎮 GPU monitoring enabled");
                true
            }
            Err(e) => {
                warn!(label, error = %e, "cannot open telemetry log");
                self.warning(label, format!("GPU monitoring disabled: {e}"));
                false
            }
        }
    }

    /// Runs one stage to completion and persists its raw output. Never fails:
    /// every problem is narrated to viewers instead.
    async fn execute_stage(&self, label: &str, stage: &Stage, record: &mut RunRecord) {
        self.emit(RunEvent::StageStarted { label: label.to_string(), stage: stage.name.clone() });
        info!(label, stage = %stage.name, command = %stage.command, "running stage");

        let publish = |line: &str| {
            self.events.emit(&RunEvent::Output { label: label.to_string(), stage: stage.name.clone(), line: line.to_string() });
        };

        let mut lines: Vec<String> = Vec::new();
        let mut failure: Option<String> = None;
        let mut exit_code: Option<i32> = None;

        if let Err(e) = fs::create_dir_all(&stage.working_dir).await {
            failure = Some(format!("cannot create {}: {e}", stage.working_dir.display()));
        }

        if failure.is_none() {
            for step in &stage.prepare {
                match process::run_streaming(step, &stage.working_dir, publish).await {
                    Ok(done) if done.success() => lines.extend(done.lines),
                    Ok(done) => {
                        failure = Some(format!("`{step}` exited with {}", done.status));
                        lines.extend(done.lines);
                        break;
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        if failure.is_none() {
            let mut metrics = Metrics::new();
            let on_line = |line: &str| {
                publish(line);
                if let Some(kind) = stage.kind {
                    extract::extract_line(kind.tool(), line, &mut metrics);
                    record.apply(kind, &metrics);
                }
            };
            match process::run_streaming(&stage.command, &stage.working_dir, on_line).await {
                Ok(done) => {
                    exit_code = done.status.code();
                    if !done.success() {
                        warn!(label, stage = %stage.name, status = %done.status, "stage exited unsuccessfully");
                    }
                    lines.extend(done.lines);
                }
                Err(e) => failure = Some(e.to_string()),
            }
        }

        for step in &stage.cleanup {
            match process::run_streaming(step, &stage.working_dir, publish).await {
                Ok(done) => lines.extend(done.lines),
                Err(e) => warn!(label, stage = %stage.name, error = %e, "cleanup step failed"),
            }
        }

        if let Err(e) = self.store.write_stage_output(label, &stage.name, &lines).await {
            error!(label, stage = %stage.name, error = %e, "failed to save stage output");
            self.emit(RunEvent::Failed { label: label.to_string(), error: format!("failed to save {} output: {e}", stage.name) });
        }

        if stage.kind == Some(StageKind::Llm) {
            match self.store.write_llm_response(label, &lines.join("\n")).await {
                Ok(Some(_)) => self.info(label, "💾 LLM response saved"),
                Ok(None) => {}
                Err(e) => self.emit(RunEvent::Failed { label: label.to_string(), error: format!("failed to save LLM response: {e}") }),
            }
        }

        match failure {
            Some(error) => {
                error!(label, stage = %stage.name, %error, "stage failed");
                self.emit(RunEvent::StageFailed { label: label.to_string(), stage: stage.name.clone(), error });
            }
            None => self.emit(RunEvent::StageFinished { label: label.to_string(), stage: stage.name.clone(), code: exit_code }),
        }
    }
}

/// Human-readable summary; fields that were never measured are left out.
pub fn summary_lines(record: &RunRecord) -> Vec<String> {
    let mut out = vec!["📊 Benchmark Summary:".to_string()];
    if record.cpu_all > 0.0 {
        out.push(format!("  CPU Score: {:.0} events/sec", record.cpu_all));
    }
    if let Some(scaling) = record.cpu_scaling() {
        out.push(format!("  CPU Scaling: {scaling:.2}x over single thread"));
    }
    if record.memory.total() > 0.0 {
        out.push(format!("  Memory: {:.1} MB/s", record.memory.total()));
    }
    if record.disk.total() > 0.0 {
        out.push(format!("  Disk: {:.1} MB/s", record.disk.total()));
    }
    if let Some(llm) = record.llm.filter(|l| l.tokens_per_sec > 0.0) {
        out.push(format!("  LLM: {:.1} tokens/sec", llm.tokens_per_sec));
    }
    let temps: Vec<f64> = record.gpu.temperature.iter().flatten().copied().collect();
    if let Some(s) = extract::summarize(&temps) {
        out.push(format!("  GPU: {} samples, max {:.0}°C", s.count, s.max));
    }
    out
}
