use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::extract::{Metrics, ToolKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    #[serde(default, deserialize_with = "null_as_zero")]
    pub read: f64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub write: f64,
}

impl Throughput {
    pub fn total(&self) -> f64 {
        self.read + self.write
    }
}

/// One hardware reading. Fields the query reported as `[N/A]` are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub utilization: Option<f64>,
    pub memory_used: Option<f64>,
    pub memory_total: Option<f64>,
}

impl TelemetrySample {
    /// CSV row for `gpu_metrics.txt`, newline included. Missing values are empty.
    pub fn to_log_line(&self) -> String {
        fn cell(v: Option<f64>) -> String {
            v.map(|x| x.to_string()).unwrap_or_default()
        }
        format!(
            "{},{},{},{},{}\n",
            self.timestamp.to_rfc3339(),
            cell(self.temperature),
            cell(self.utilization),
            cell(self.memory_used),
            cell(self.memory_total),
        )
    }

    pub fn describe(&self) -> String {
        fn show(v: Option<f64>) -> String {
            v.map(|x| format!("{x:.0}")).unwrap_or_else(|| "N/A".into())
        }
        format!(
            "🌡️ GPU: {}°C | ⚡ {}% | 💾 {}/{}MB",
            show(self.temperature),
            show(self.utilization),
            show(self.memory_used),
            show(self.memory_total),
        )
    }
}

/// Column-oriented telemetry so dashboards can plot each field directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySeries {
    pub timestamps: Vec<DateTime<Utc>>,
    pub temperature: Vec<Option<f64>>,
    pub utilization: Vec<Option<f64>>,
    pub memory_used: Vec<Option<f64>>,
    pub memory_total: Vec<Option<f64>>,
}

impl TelemetrySeries {
    pub fn push(&mut self, s: &TelemetrySample) {
        self.timestamps.push(s.timestamp);
        self.temperature.push(s.temperature);
        self.utilization.push(s.utilization);
        self.memory_used.push(s.memory_used);
        self.memory_total.push(s.memory_total);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResult {
    #[serde(default, deserialize_with = "null_as_zero")]
    pub tokens_per_sec: f64,
    #[serde(rename = "latency", alias = "latency_ms", default, deserialize_with = "null_as_zero")]
    pub latency_ms: f64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub memory_mb: f64,
}

/// What a stage measures, and therefore which record fields its output feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    CpuSingle,
    CpuAll,
    Memory,
    Disk,
    Llm,
}

impl StageKind {
    pub fn tool(self) -> ToolKind {
        match self {
            StageKind::CpuSingle | StageKind::CpuAll => ToolKind::Cpu,
            StageKind::Memory => ToolKind::Memory,
            StageKind::Disk => ToolKind::Disk,
            StageKind::Llm => ToolKind::Llm,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            StageKind::CpuSingle => "CPU 1 thread",
            StageKind::CpuAll => "CPU all threads",
            StageKind::Memory => "Memory test",
            StageKind::Disk => "Disk test",
            StageKind::Llm => "Ollama LLM",
        }
    }

    /// Recognises raw output files written by earlier versions as well.
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let stem = stem.to_lowercase();
        [
            ("cpu_1_thread", StageKind::CpuSingle),
            ("cpu_all_threads", StageKind::CpuAll),
            ("memory_test", StageKind::Memory),
            ("disk_test", StageKind::Disk),
            ("ollama_llm", StageKind::Llm),
        ]
        .into_iter()
        .find(|(needle, _)| stem.contains(needle))
        .map(|(_, kind)| kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    #[serde(deserialize_with = "lenient_date")]
    pub date: DateTime<Utc>,
    #[serde(rename = "cpu1Thread", default, deserialize_with = "null_as_zero")]
    pub cpu_single: f64,
    #[serde(rename = "cpuAllThreads", default, deserialize_with = "null_as_zero")]
    pub cpu_all: f64,
    #[serde(default)]
    pub memory: Throughput,
    #[serde(default)]
    pub disk: Throughput,
    #[serde(default)]
    pub gpu: TelemetrySeries,
    /// Written as an all-zero object when no LLM stage ran.
    #[serde(rename = "ollama", default, serialize_with = "zeros_when_absent", deserialize_with = "absent_when_zero")]
    pub llm: Option<LlmResult>,
}

impl RunRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self::started_at(name, Utc::now())
    }

    pub fn started_at(name: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            date,
            cpu_single: 0.0,
            cpu_all: 0.0,
            memory: Throughput::default(),
            disk: Throughput::default(),
            gpu: TelemetrySeries::default(),
            llm: None,
        }
    }

    /// Copies whatever `metrics` holds for `kind` into the record. Fields the
    /// metrics do not mention are left as they are, so this can be called
    /// after every line.
    pub fn apply(&mut self, kind: StageKind, metrics: &Metrics) {
        let get = |k: &str| metrics.get(k).copied();
        match kind {
            StageKind::CpuSingle => {
                if let Some(v) = get("events_per_second") { self.cpu_single = v; }
            }
            StageKind::CpuAll => {
                if let Some(v) = get("events_per_second") { self.cpu_all = v; }
            }
            StageKind::Memory => {
                if let Some(v) = get("read_mib_sec") { self.memory.read = v; }
                if let Some(v) = get("write_mib_sec") { self.memory.write = v; }
            }
            StageKind::Disk => {
                if let Some(v) = get("read_mib_s") { self.disk.read = v; }
                if let Some(v) = get("write_mib_s") { self.disk.write = v; }
            }
            StageKind::Llm => {
                let llm = self.llm.get_or_insert_with(LlmResult::default);
                if let Some(v) = get("tokens_per_sec") { llm.tokens_per_sec = v; }
                if let Some(v) = get("latency_ms") { llm.latency_ms = v; }
                if let Some(v) = get("memory_mb") { llm.memory_mb = v; }
            }
        }
    }

    /// Multi-thread over single-thread score; `None` unless both were measured.
    pub fn cpu_scaling(&self) -> Option<f64> {
        (self.cpu_single > 0.0 && self.cpu_all > 0.0).then(|| self.cpu_all / self.cpu_single)
    }
}

fn null_as_zero<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(0.0))
}

fn zeros_when_absent<S>(llm: &Option<LlmResult>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    llm.unwrap_or_default().serialize(s)
}

fn absent_when_zero<'de, D>(d: D) -> Result<Option<LlmResult>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<LlmResult>::deserialize(d)?.filter(|l| *l != LlmResult::default()))
}

/// Accepts RFC 3339 as well as the zone-less ISO timestamps older runs wrote.
fn lenient_date<'de, D>(d: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid date: {raw}")))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}
