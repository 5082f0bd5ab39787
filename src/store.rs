use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::extract;
use crate::io::{write_atomic, LineLog};
use crate::record::{RunRecord, StageKind};

pub const METRICS_FILE: &str = "metrics.json";
pub const TELEMETRY_FILE: &str = "gpu_metrics.txt";
pub const LLM_RESPONSE_FILE: &str = "llm_response.txt";

/// One entry of the run listing.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub record: RunRecord,
    #[serde(rename = "cpuScaling")]
    pub cpu_scaling: Option<f64>,
    #[serde(rename = "hasLlmResponse")]
    pub has_llm_response: bool,
}

/// Directory-per-label persistence:
///
/// ```text
/// <root>/<label>/metrics.json        structured RunRecord
/// <root>/<label>/<Stage_Name>.txt    raw output of each stage
/// <root>/<label>/gpu_metrics.txt     telemetry CSV, append-only
/// <root>/<label>/llm_response.txt    cleaned LLM answer
/// ```
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await.map_err(|e| StoreError::io(&self.root, e))
    }

    /// Directory for `label`. Labels must be a single plain path component.
    pub fn run_dir(&self, label: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_label(label) {
            return Err(StoreError::InvalidLabel(label.to_string()));
        }
        Ok(self.root.join(label))
    }

    pub async fn create_run(&self, label: &str) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir(label)?;
        fs::create_dir_all(&dir).await.map_err(|e| StoreError::io(&dir, e))?;
        Ok(dir)
    }

    async fn existing_run_dir(&self, label: &str) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir(label)?;
        match fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::NotFound(label.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(label.to_string())),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    pub async fn write_stage_output(&self, label: &str, stage: &str, lines: &[String]) -> Result<PathBuf, StoreError> {
        let path = self.run_dir(label)?.join(stage_file_name(stage));
        write_atomic(&path, lines.join("\n").as_bytes()).await?;
        Ok(path)
    }

    pub async fn write_record(&self, record: &RunRecord) -> Result<PathBuf, StoreError> {
        let path = self.run_dir(&record.name)?.join(METRICS_FILE);
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Cleans `raw` and writes it; returns `None` when nothing is left to save.
    pub async fn write_llm_response(&self, label: &str, raw: &str) -> Result<Option<PathBuf>, StoreError> {
        let cleaned = clean_llm_output(raw);
        if cleaned.is_empty() {
            return Ok(None);
        }
        let path = self.run_dir(label)?.join(LLM_RESPONSE_FILE);
        write_atomic(&path, cleaned.as_bytes()).await?;
        Ok(Some(path))
    }

    pub async fn telemetry_log(&self, label: &str) -> Result<LineLog, StoreError> {
        LineLog::open(self.run_dir(label)?.join(TELEMETRY_FILE)).await
    }

    pub async fn read_llm_response(&self, label: &str) -> Result<Option<String>, StoreError> {
        let path = self.existing_run_dir(label).await?.join(LLM_RESPONSE_FILE);
        match fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Loads `metrics.json`, or rebuilds the record from the raw stage files
    /// when the document is missing or unreadable.
    pub async fn load_run(&self, label: &str) -> Result<RunRecord, StoreError> {
        let dir = self.existing_run_dir(label).await?;
        let metrics_path = dir.join(METRICS_FILE);
        match fs::read(&metrics_path).await {
            Ok(bytes) => match serde_json::from_slice::<RunRecord>(&bytes) {
                Ok(rec) => return Ok(rec),
                Err(e) => warn!(label, error = %e, "unreadable metrics.json, rebuilding from raw output"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&metrics_path, e)),
        }
        self.reconstruct(label, &dir).await
    }

    async fn reconstruct(&self, label: &str, dir: &Path) -> Result<RunRecord, StoreError> {
        let meta = fs::metadata(dir).await.map_err(|e| StoreError::io(dir, e))?;
        let date: DateTime<Utc> = meta
            .created()
            .or_else(|_| meta.modified())
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let mut record = RunRecord::started_at(label, date);

        let mut rd = fs::read_dir(dir).await.map_err(|e| StoreError::io(dir, e))?;
        while let Some(ent) = rd.next_entry().await.map_err(|e| StoreError::io(dir, e))? {
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("txt") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let content = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable stage file");
                    continue;
                }
            };
            if stem == TELEMETRY_FILE.trim_end_matches(".txt") {
                record.gpu = extract::parse_log(content.lines());
            } else if let Some(kind) = StageKind::from_file_stem(stem) {
                record.apply(kind, &extract::extract(kind.tool(), content.lines()));
            }
        }
        Ok(record)
    }

    /// Every run, newest first. Runs that cannot be read are skipped.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };
        while let Some(ent) = rd.next_entry().await.map_err(|e| StoreError::io(&self.root, e))? {
            let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let Some(label) = ent.file_name().to_str().map(str::to_string) else { continue };
            if !is_dir {
                continue;
            }
            match self.load_run(&label).await {
                Ok(record) => {
                    let has_llm_response = fs::try_exists(ent.path().join(LLM_RESPONSE_FILE)).await.unwrap_or(false);
                    out.push(RunSummary { cpu_scaling: record.cpu_scaling(), record, has_llm_response });
                }
                Err(e) => warn!(label, error = %e, "skipping run"),
            }
        }
        out.sort_by(|a, b| b.record.date.cmp(&a.record.date));
        Ok(out)
    }

    pub async fn delete_run(&self, label: &str) -> Result<(), StoreError> {
        let dir = self.existing_run_dir(label).await?;
        fs::remove_dir_all(&dir).await.map_err(|e| StoreError::io(&dir, e))
    }

    /// Removes every run and recreates an empty root. Returns how many runs
    /// were removed.
    pub async fn delete_all(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        match fs::read_dir(&self.root).await {
            Ok(mut rd) => {
                while let Some(ent) = rd.next_entry().await.map_err(|e| StoreError::io(&self.root, e))? {
                    if ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        count += 1;
                    }
                }
                fs::remove_dir_all(&self.root).await.map_err(|e| StoreError::io(&self.root, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&self.root, e)),
        }
        self.ensure_root().await?;
        Ok(count)
    }
}

fn is_safe_label(label: &str) -> bool {
    if label.is_empty() {
        return false;
    }
    let mut comps = Path::new(label).components();
    matches!((comps.next(), comps.next()), (Some(Component::Normal(_)), None))
}

pub fn stage_file_name(stage: &str) -> String {
    format!("{}.txt", stage.replace(' ', "_"))
}

/// Strips ANSI escape sequences and carriage returns, trims trailing
/// whitespace per line and keeps at most one blank line in a row.
pub fn clean_llm_output(raw: &str) -> String {
    static ANSI: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi pattern is valid"));
    let stripped = ANSI.replace_all(raw, "");

    let mut out = String::with_capacity(stripped.len());
    let mut blank_run = 0;
    for line in stripped.split('\n') {
        // spinners redraw with bare CRs; keep what was drawn last
        let line = line.rsplit('\r').find(|s| !s.trim().is_empty()).unwrap_or("").trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LlmResult, TelemetrySample};

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs"));
        (dir, store)
    }

    #[tokio::test]
    async fn record_round_trips_through_listing() {
        let (_tmp, store) = store();
        store.create_run("bench1").await.unwrap();
        let mut rec = RunRecord::new("bench1");
        rec.cpu_single = 1342.27;
        rec.cpu_all = 9876.5;
        rec.memory.read = 8923.41;
        rec.memory.write = 120.5;
        rec.disk.read = 192.9;
        rec.llm = Some(LlmResult { tokens_per_sec: 46.1, latency_ms: 3217.6, memory_mb: 0.0 });
        rec.gpu.push(&TelemetrySample { timestamp: Utc::now(), temperature: None, utilization: Some(3.0), memory_used: Some(1.0), memory_total: Some(2.0) });
        store.write_record(&rec).await.unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        let got = &runs[0].record;
        assert_eq!(got.cpu_single, rec.cpu_single);
        assert_eq!(got.cpu_all, rec.cpu_all);
        assert_eq!(got.memory, rec.memory);
        assert_eq!(got.disk, rec.disk);
        assert_eq!(got.llm, rec.llm);
        assert_eq!(got.gpu.temperature, vec![None]);
        assert!(runs[0].cpu_scaling.is_some());
    }

    #[tokio::test]
    async fn legacy_run_is_rebuilt_from_raw_files() {
        let (_tmp, store) = store();
        let dir = store.create_run("old").await.unwrap();
        std::fs::write(dir.join("CPU_1_thread.txt"), "CPU speed:\n    events per second:  1000.50\n").unwrap();
        std::fs::write(dir.join("CPU_all_threads.txt"), "    events per second:  8000.25\n").unwrap();
        std::fs::write(dir.join("Memory_test.txt"), "10240.00 MiB transferred (9000.10 MiB/sec)\n").unwrap();
        std::fs::write(dir.join("Disk_test.txt"), "    read, MiB/s:  150.00\n    written, MiB/s:  75.50\n").unwrap();
        std::fs::write(dir.join(TELEMETRY_FILE), "2025-01-02T03:04:05+00:00,50,10,1000,8192\n").unwrap();

        let rec = store.load_run("old").await.unwrap();
        assert_eq!(rec.name, "old");
        assert_eq!(rec.cpu_single, 1000.5);
        assert_eq!(rec.cpu_all, 8000.25);
        assert_eq!(rec.memory.read, 9000.1);
        assert_eq!(rec.disk.read, 150.0);
        assert_eq!(rec.disk.write, 75.5);
        assert_eq!(rec.gpu.len(), 1);
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let (_tmp, store) = store();
        for (label, date) in [("a", "2024-01-01T00:00:00Z"), ("b", "2025-01-01T00:00:00Z")] {
            store.create_run(label).await.unwrap();
            let rec = RunRecord::started_at(label, crate::record::parse_timestamp(date).unwrap());
            store.write_record(&rec).await.unwrap();
        }
        let names: Vec<String> = store.list_runs().await.unwrap().into_iter().map(|r| r.record.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn delete_and_not_found() {
        let (_tmp, store) = store();
        store.create_run("x").await.unwrap();
        store.create_run("y").await.unwrap();
        store.delete_run("x").await.unwrap();
        assert!(matches!(store.delete_run("x").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.read_llm_response("x").await, Err(StoreError::NotFound(_))));
        assert_eq!(store.read_llm_response("y").await.unwrap(), None);

        assert_eq!(store.delete_all().await.unwrap(), 1);
        assert!(store.root().is_dir());
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn labels_cannot_escape_root() {
        let (_tmp, store) = store();
        for bad in ["", "..", "../etc", "a/b", "/abs"] {
            assert!(matches!(store.create_run(bad).await, Err(StoreError::InvalidLabel(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn stage_output_uses_underscored_name() {
        let (_tmp, store) = store();
        let dir = store.create_run("r").await.unwrap();
        store.write_stage_output("r", "CPU all threads", &["a".into(), "b".into()]).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("CPU_all_threads.txt")).unwrap(), "a\nb");
    }

    #[tokio::test]
    async fn llm_response_is_cleaned() {
        let (_tmp, store) = store();
        store.create_run("r").await.unwrap();
        let raw = "\x1b[?25l\x1b[2K\x1b[1GQuantum \x1b[1mcomputing\x1b[0m\n\n\n\n\nuses qubits.\r\n   \n\n\n";
        store.write_llm_response("r", raw).await.unwrap();
        let text = store.read_llm_response("r").await.unwrap().unwrap();
        assert!(!text.contains('\x1b'));
        assert!(!text.contains("\n\n\n"));
        assert_eq!(text, "Quantum computing\n\nuses qubits.");

        assert_eq!(store.write_llm_response("r", "\x1b[0m  \n\n").await.unwrap(), None);
    }
}
