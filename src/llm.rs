use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{LlmCfg, ToolCmd};
use crate::error::CaptureError;
use crate::process::{self, CommandSpec};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: String,
}

/// Parses `ollama list`: a `NAME ID SIZE MODIFIED` header followed by one
/// model per line.
pub fn parse_model_list(stdout: &str) -> Vec<ModelInfo> {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("NAME"))
        .filter_map(|l| {
            let parts: Vec<&str> = l.split_whitespace().collect();
            let name = (*parts.first()?).to_string();
            let size = match (parts.get(2), parts.get(3)) {
                (Some(n), Some(u)) if UNITS.contains(u) => format!("{n} {u}"),
                (Some(n), _) => (*n).to_string(),
                _ => "Unknown".to_string(),
            };
            Some(ModelInfo { name, size })
        })
        .collect()
}

/// How the model for a run was picked.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChoice {
    Selected(String),
    FirstAvailable(String),
    Installed(String),
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct LlmTool {
    tool: ToolCmd,
    cfg: LlmCfg,
}

impl LlmTool {
    pub fn new(tool: ToolCmd, cfg: LlmCfg) -> Self {
        Self { tool, cfg }
    }

    pub async fn probe(&self, timeout: Duration) -> bool {
        process::probe(&self.tool.command(["--version"]), timeout).await
    }

    pub async fn list_models(&self, timeout: Duration) -> Result<Vec<ModelInfo>, CaptureError> {
        let out = process::capture(&self.tool.command(["list"]), timeout).await?;
        Ok(parse_model_list(&out.stdout))
    }

    /// Explicit selection, else the first installed model, else (only when
    /// `auto_install` is on) a pull of the default model. `notify` narrates
    /// each fallback step.
    pub async fn resolve_model<F>(&self, selected: Option<&str>, timeout: Duration, notify: F) -> ModelChoice
    where
        F: Fn(&str),
    {
        if let Some(m) = selected.map(str::trim).filter(|m| !m.is_empty()) {
            return ModelChoice::Selected(m.to_string());
        }

        notify("No model selected, auto-detecting...");
        let models = match self.list_models(timeout).await {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "failed to list models");
                return ModelChoice::Unavailable(format!("failed to list models: {e}"));
            }
        };
        if let Some(first) = models.into_iter().next() {
            return ModelChoice::FirstAvailable(first.name);
        }

        if !self.cfg.auto_install {
            return ModelChoice::Unavailable("no models installed and auto_install is disabled".into());
        }

        let model = self.cfg.default_model.clone();
        notify(&format!("No models found. Installing {model}..."));
        info!(model = %model, "pulling default model");
        let pull = self.tool.command(["pull".to_string(), model.clone()]);
        match process::capture(&pull, Duration::from_secs(self.cfg.install_timeout_secs)).await {
            Ok(_) => ModelChoice::Installed(model),
            Err(e) => {
                warn!(model = %model, error = %e, "model install failed");
                ModelChoice::Unavailable(format!("failed to install {model}: {e}"))
            }
        }
    }

    pub fn run_command(&self, model: &str) -> CommandSpec {
        let cmd = self.tool.command(["run".to_string(), model.to_string(), self.cfg.prompt.clone()]);
        if self.cfg.verbose { cmd.arg("--verbose") } else { cmd }
    }
}
