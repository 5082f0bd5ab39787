use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{TelemetryCfg, ToolCmd};
use crate::error::SampleError;
use crate::events::{Broadcaster, RunEvent};
use crate::io::LineLog;
use crate::process::{self, CommandSpec};
use crate::record::{TelemetrySample, TelemetrySeries};

const QUERY_FIELDS: &str = "temperature.gpu,utilization.gpu,memory.used,memory.total";
/// Cells nvidia-smi prints for a field the GPU cannot report.
const MISSING: [&str; 2] = ["[N/A]", "[Not Supported]"];

pub fn query_command(tool: &ToolCmd) -> CommandSpec {
    tool.command([format!("--query-gpu={QUERY_FIELDS}"), "--format=csv,noheader,nounits".to_string()])
}

/// Parses the first line of a `--query-gpu` result. `[N/A]` and
/// `[Not Supported]` cells become `None`; any other non-number is an error.
pub fn parse_sample(output: &str, timestamp: DateTime<Utc>) -> Result<TelemetrySample, SampleError> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).ok_or(SampleError::Empty)?;
    let cells: Vec<&str> = line.split(',').map(str::trim).collect();
    if cells.len() < 4 {
        return Err(SampleError::FieldCount(cells.len()));
    }
    let field = |idx: usize, name: &'static str| -> Result<Option<f64>, SampleError> {
        let raw = cells[idx];
        if MISSING.contains(&raw) {
            return Ok(None);
        }
        raw.parse::<f64>()
            .map(Some)
            .map_err(|_| SampleError::NotANumber { field: name, value: raw.to_string() })
    };
    Ok(TelemetrySample {
        timestamp,
        temperature: field(0, "temperature")?,
        utilization: field(1, "utilization")?,
        memory_used: field(2, "memory_used")?,
        memory_total: field(3, "memory_total")?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub query_timeout: Duration,
    pub stop_timeout: Duration,
}

impl From<&TelemetryCfg> for PollSettings {
    fn from(cfg: &TelemetryCfg) -> Self {
        Self { interval: cfg.interval(), query_timeout: cfg.query_timeout(), stop_timeout: cfg.stop_timeout() }
    }
}

enum PollerState {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
        series: Arc<Mutex<TelemetrySeries>>,
        stop_timeout: Duration,
    },
    Stopped,
}

/// `Idle -> Running -> Stopped`. A poller that never started goes straight
/// from `Idle` to `Stopped` and reports an empty series.
pub struct TelemetryPoller {
    label: String,
    state: PollerState,
}

impl TelemetryPoller {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), state: PollerState::Idle }
    }

    /// Spawns the polling task. Does nothing unless the poller is idle.
    pub fn start(&mut self, query: CommandSpec, log: LineLog, events: Arc<Broadcaster>, settings: PollSettings) {
        if !matches!(self.state, PollerState::Idle) {
            return;
        }
        let cancel = CancellationToken::new();
        let series = Arc::new(Mutex::new(TelemetrySeries::default()));
        let handle = tokio::spawn(poll_loop(
            self.label.clone(),
            query,
            log,
            events,
            settings,
            cancel.clone(),
            series.clone(),
        ));
        info!(label = %self.label, interval_ms = settings.interval.as_millis() as u64, "telemetry poller started");
        self.state = PollerState::Running { cancel, handle, series, stop_timeout: settings.stop_timeout };
    }

    /// Cancels the task and waits up to the configured stop timeout for it to
    /// wind down. Returns every sample that reached the log, even when the
    /// task has to be detached.
    pub async fn stop(&mut self) -> TelemetrySeries {
        match std::mem::replace(&mut self.state, PollerState::Stopped) {
            PollerState::Running { cancel, handle, series, stop_timeout } => {
                cancel.cancel();
                match tokio::time::timeout(stop_timeout, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(label = %self.label, error = %e, "telemetry task ended abnormally"),
                    Err(_) => {
                        // left to finish its current write; it cannot append again once cancelled
                        warn!(label = %self.label, "telemetry task did not stop in time, detaching");
                    }
                }
                let series = std::mem::take(&mut *series.lock());
                info!(label = %self.label, samples = series.len(), "telemetry poller stopped");
                series
            }
            PollerState::Idle | PollerState::Stopped => TelemetrySeries::default(),
        }
    }
}

async fn poll_loop(
    label: String,
    query: CommandSpec,
    mut log: LineLog,
    events: Arc<Broadcaster>,
    settings: PollSettings,
    cancel: CancellationToken,
    series: Arc<Mutex<TelemetrySeries>>,
) {
    let mut query_failing = false;
    let mut log_failing = false;

    loop {
        let captured = tokio::select! {
            _ = cancel.cancelled() => break,
            res = process::capture(&query, settings.query_timeout) => res,
        };
        let sample = match captured {
            Ok(out) => parse_sample(&out.stdout, Utc::now()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match sample {
            Ok(sample) => {
                if cancel.is_cancelled() {
                    break;
                }
                query_failing = false;
                match log.append(&sample.to_log_line()).await {
                    Ok(()) => log_failing = false,
                    Err(e) if !log_failing => {
                        log_failing = true;
                        warn!(label = %label, error = %e, "telemetry log write failed");
                        events.emit(&RunEvent::Warning { label: label.clone(), msg: format!("GPU log write failed: {e}") });
                    }
                    Err(_) => {}
                }
                series.lock().push(&sample);
                events.emit(&RunEvent::Telemetry { label: label.clone(), msg: sample.describe() });
            }
            Err(e) => {
                if !query_failing {
                    query_failing = true;
                    warn!(label = %label, error = %e, "GPU query failed");
                    events.emit(&RunEvent::Warning { label: label.clone(), msg: format!("GPU query failed: {e}") });
                } else {
                    debug!(label = %label, error = %e, "GPU query still failing");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }

    debug!(label = %label, path = %log.path().display(), "telemetry log closed");
    events.emit(&RunEvent::Info { label, msg: "🛑 GPU monitoring stopped".into() });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(interval_ms: u64) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(interval_ms),
            query_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn na_temperature_is_missing_not_an_error() {
        let s = parse_sample("[N/A], 37, 1024, 8192\n", Utc::now()).unwrap();
        assert_eq!(s.temperature, None);
        assert_eq!(s.utilization, Some(37.0));
        assert_eq!(s.memory_used, Some(1024.0));
        assert_eq!(s.memory_total, Some(8192.0));
    }

    #[test]
    fn not_supported_is_missing_too() {
        let s = parse_sample("51, [Not Supported], [N/A], [Not Supported]", Utc::now()).unwrap();
        assert_eq!(s.temperature, Some(51.0));
        assert_eq!(s.utilization, None);
        assert_eq!(s.memory_used, None);
        assert_eq!(s.memory_total, None);
    }

    #[test]
    fn first_gpu_line_wins() {
        let s = parse_sample("\n45, 10, 100, 200\n70, 90, 300, 400\n", Utc::now()).unwrap();
        assert_eq!(s.temperature, Some(45.0));
    }

    #[test]
    fn malformed_results() {
        assert_eq!(parse_sample("", Utc::now()), Err(SampleError::Empty));
        assert_eq!(parse_sample("45, 10", Utc::now()), Err(SampleError::FieldCount(2)));
        assert!(matches!(
            parse_sample("hot, 10, 100, 200", Utc::now()),
            Err(SampleError::NotANumber { field: "temperature", .. })
        ));
    }

    #[test]
    fn query_uses_csv_without_units() {
        let cmd = query_command(&ToolCmd::new("nvidia-smi"));
        assert_eq!(cmd.args, vec![
            "--query-gpu=temperature.gpu,utilization.gpu,memory.used,memory.total".to_string(),
            "--format=csv,noheader,nounits".to_string(),
        ]);
    }

    #[tokio::test]
    async fn idle_poller_stops_empty() {
        let mut p = TelemetryPoller::new("r");
        assert!(p.stop().await.is_empty());
    }

    #[tokio::test]
    async fn samples_go_to_log_series_and_viewers_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("gpu_metrics.txt");
        let log = LineLog::open(log_path.clone()).await.unwrap();
        let events = Arc::new(Broadcaster::new(1024));
        let (_id, mut rx) = events.register();

        let mut poller = TelemetryPoller::new("gpu-run");
        poller.start(sh("echo '[N/A], 30, 1024, 8192'"), log, events.clone(), settings(20));
        tokio::time::sleep(Duration::from_millis(400)).await;
        let series = poller.stop().await;
        assert!(poller.stop().await.is_empty());

        assert!(!series.is_empty());
        assert!(series.temperature.iter().all(Option::is_none));
        assert!(series.utilization.iter().all(|u| *u == Some(30.0)));

        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(logged.lines().count(), series.len());
        assert!(logged.ends_with('\n'));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), logged);

        let mut msgs = Vec::new();
        while let Ok(m) = rx.try_recv() {
            msgs.push(m);
        }
        assert!(msgs.iter().any(|m| m.contains("GPU: N/A°C | ⚡ 30%")));
        assert!(msgs.last().unwrap().contains("GPU monitoring stopped"));
    }

    #[tokio::test]
    async fn repeated_query_failures_are_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = LineLog::open(dir.path().join("gpu_metrics.txt")).await.unwrap();
        let events = Arc::new(Broadcaster::new(1024));
        let (_id, mut rx) = events.register();

        let mut poller = TelemetryPoller::new("r");
        poller.start(sh("exit 1"), log, events.clone(), settings(10));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let series = poller.stop().await;
        assert!(series.is_empty());

        let mut failures = 0;
        while let Ok(m) = rx.try_recv() {
            if m.contains("GPU query failed") {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn stop_timeout_keeps_samples_already_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("gpu_metrics.txt");
        let log = LineLog::open(log_path.clone()).await.unwrap();
        let events = Arc::new(Broadcaster::new(1024));

        let mut poller = TelemetryPoller::new("slow-stop");
        let settings = PollSettings { stop_timeout: Duration::ZERO, ..settings(20) };
        poller.start(sh("echo '60, 5, 100, 200'"), log, events, settings);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let series = poller.stop().await;

        assert!(!series.is_empty());
        assert!(series.temperature.iter().all(|t| *t == Some(60.0)));
        let logged = std::fs::read_to_string(&log_path).unwrap().lines().count();
        assert!(logged >= series.len());
    }
}
