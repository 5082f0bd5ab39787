use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::record::{parse_timestamp, TelemetrySample, TelemetrySeries};

pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Cpu,
    Memory,
    Disk,
    Llm,
    /// Rows of `gpu_metrics.txt`.
    Telemetry,
}

// Each tool kind has a table of rules: a substring trigger, a pattern that
// captures the numbers, and where those numbers go. Lines that match nothing,
// or whose numbers do not parse, are skipped.
#[derive(Clone, Copy)]
enum Assign {
    /// Capture groups that matched, in order, go to these fields.
    Fields(&'static [&'static str]),
    /// First match sets `read_mib_sec`; later matches set `write_mib_sec`
    /// unless the line says it is a read.
    Transfer,
    /// A Go-style duration (`1m2.5s`, `850ms`) stored in milliseconds.
    Millis(&'static str),
}

struct Rule {
    trigger: &'static str,
    pattern: &'static str,
    assign: Assign,
}

const NUM: &str = r"(\d+(?:\.\d+)?)";

const LATENCY_RULES: &[Rule] = &[
    Rule { trigger: "min:", pattern: r"^\s*min:\s*NUM", assign: Assign::Fields(&["latency_min_ms"]) },
    Rule { trigger: "avg:", pattern: r"^\s*avg:\s*NUM", assign: Assign::Fields(&["latency_avg_ms"]) },
    Rule { trigger: "max:", pattern: r"^\s*max:\s*NUM", assign: Assign::Fields(&["latency_max_ms"]) },
    Rule {
        trigger: "min:",
        pattern: r"min:\s+NUM\s+avg:\s+NUM\s+max:\s+NUM",
        assign: Assign::Fields(&["latency_min_ms", "latency_avg_ms", "latency_max_ms"]),
    },
    Rule { trigger: "95th percentile:", pattern: r"95th percentile:\s*NUM", assign: Assign::Fields(&["latency_p95_ms"]) },
];

const CPU_RULES: &[Rule] = &[
    Rule { trigger: "total number of events", pattern: r"total number of events:\s*NUM", assign: Assign::Fields(&["total_events"]) },
    Rule {
        trigger: "events per second",
        pattern: r"events per second:\s*NUM|NUM\s+events per second",
        assign: Assign::Fields(&["events_per_second"]),
    },
    Rule { trigger: "total time:", pattern: r"total time:\s*NUM\s*s", assign: Assign::Fields(&["total_time_seconds"]) },
    Rule {
        trigger: "events (avg/stddev)",
        pattern: r"events \(avg/stddev\):\s*NUM/NUM",
        assign: Assign::Fields(&["thread_events_avg", "thread_events_stddev"]),
    },
    Rule {
        trigger: "execution time (avg/stddev)",
        pattern: r"execution time \(avg/stddev\):\s*NUM/NUM",
        assign: Assign::Fields(&["thread_time_avg", "thread_time_stddev"]),
    },
];

const MEMORY_RULES: &[Rule] = &[
    Rule {
        trigger: "Total operations",
        pattern: r"Total operations:\s*NUM\s*\(\s*NUM per second\)",
        assign: Assign::Fields(&["total_operations", "operations_per_second"]),
    },
    Rule { trigger: "operations per second", pattern: r"NUM\s+operations per second", assign: Assign::Fields(&["operations_per_second"]) },
    Rule { trigger: "MiB/sec", pattern: r"NUM\s+MiB/sec", assign: Assign::Transfer },
];

const DISK_RULES: &[Rule] = &[
    Rule { trigger: "reads/s:", pattern: r"reads/s:\s*NUM", assign: Assign::Fields(&["reads_per_sec"]) },
    Rule { trigger: "writes/s:", pattern: r"writes/s:\s*NUM", assign: Assign::Fields(&["writes_per_sec"]) },
    Rule { trigger: "fsyncs/s:", pattern: r"fsyncs/s:\s*NUM", assign: Assign::Fields(&["fsyncs_per_sec"]) },
    Rule { trigger: "read, MiB/s", pattern: r"read, MiB/s:\s*NUM", assign: Assign::Fields(&["read_mib_s"]) },
    Rule { trigger: "written, MiB/s", pattern: r"written, MiB/s:\s*NUM", assign: Assign::Fields(&["write_mib_s"]) },
    Rule { trigger: "total number of events", pattern: r"total number of events:\s*NUM", assign: Assign::Fields(&["total_operations"]) },
];

const LLM_RULES: &[Rule] = &[
    Rule { trigger: "Tokens/sec:", pattern: r"Tokens/sec:\s*NUM", assign: Assign::Fields(&["tokens_per_sec"]) },
    Rule { trigger: "eval rate:", pattern: r"^\s*eval rate:\s*NUM\s*tokens/s", assign: Assign::Fields(&["tokens_per_sec"]) },
    Rule { trigger: "eval count:", pattern: r"^\s*eval count:\s*NUM", assign: Assign::Fields(&["eval_tokens"]) },
    Rule { trigger: "Latency:", pattern: r"Latency:\s*NUM", assign: Assign::Fields(&["latency_ms"]) },
    Rule { trigger: "total duration:", pattern: r"total duration:\s*(\S+)", assign: Assign::Millis("latency_ms") },
    Rule { trigger: "Memory:", pattern: r"Memory:\s*NUM\s*MB", assign: Assign::Fields(&["memory_mb"]) },
];

struct Compiled {
    trigger: &'static str,
    regex: Regex,
    assign: Assign,
}

fn compile(tables: &[&[Rule]]) -> Vec<Compiled> {
    tables
        .iter()
        .flat_map(|t| t.iter())
        .map(|r| Compiled {
            trigger: r.trigger,
            regex: Regex::new(&r.pattern.replace("NUM", NUM)).expect("rule pattern is valid"),
            assign: r.assign,
        })
        .collect()
}

static CPU: LazyLock<Vec<Compiled>> = LazyLock::new(|| compile(&[CPU_RULES, LATENCY_RULES]));
static MEMORY: LazyLock<Vec<Compiled>> = LazyLock::new(|| compile(&[MEMORY_RULES, LATENCY_RULES]));
static DISK: LazyLock<Vec<Compiled>> = LazyLock::new(|| compile(&[DISK_RULES, LATENCY_RULES]));
static LLM: LazyLock<Vec<Compiled>> = LazyLock::new(|| compile(&[LLM_RULES]));

fn rules(kind: ToolKind) -> &'static [Compiled] {
    match kind {
        ToolKind::Cpu => &CPU,
        ToolKind::Memory => &MEMORY,
        ToolKind::Disk => &DISK,
        ToolKind::Llm => &LLM,
        ToolKind::Telemetry => &[],
    }
}

/// Folds one line into `metrics`. For [`ToolKind::Telemetry`] the line's
/// latest values are stored under `temperature`, `utilization`,
/// `memory_used` and `memory_total`.
pub fn extract_line(kind: ToolKind, line: &str, metrics: &mut Metrics) {
    if kind == ToolKind::Telemetry {
        if let Some(s) = parse_log_line(line) {
            for (k, v) in [
                ("temperature", s.temperature),
                ("utilization", s.utilization),
                ("memory_used", s.memory_used),
                ("memory_total", s.memory_total),
            ] {
                if let Some(v) = v {
                    metrics.insert(k.into(), v);
                }
            }
        }
        return;
    }

    for rule in rules(kind) {
        if !line.contains(rule.trigger) {
            continue;
        }
        let Some(caps) = rule.regex.captures(line) else { continue };
        match rule.assign {
            Assign::Fields(fields) => {
                let values: Option<Vec<f64>> = caps
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str().parse::<f64>().ok())
                    .collect();
                let Some(values) = values else { continue };
                for (field, v) in fields.iter().zip(values) {
                    metrics.insert((*field).to_string(), v);
                }
            }
            Assign::Transfer => {
                let Some(v) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else { continue };
                let key = if line.to_lowercase().contains("read") || !metrics.contains_key("read_mib_sec") {
                    "read_mib_sec"
                } else {
                    "write_mib_sec"
                };
                metrics.insert(key.into(), v);
            }
            Assign::Millis(field) => {
                if let Some(ms) = caps.get(1).and_then(|m| parse_go_duration_ms(m.as_str())) {
                    metrics.insert(field.into(), ms);
                }
            }
        }
    }
}

/// Batch form of [`extract_line`]. For telemetry logs this returns summary
/// statistics over all rows instead of the last row.
pub fn extract<I, S>(kind: ToolKind, lines: I) -> Metrics
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if kind == ToolKind::Telemetry {
        return telemetry_metrics(&parse_log(lines));
    }
    let mut metrics = Metrics::new();
    for line in lines {
        extract_line(kind, line.as_ref(), &mut metrics);
    }
    metrics
}

/// Parses `850ms`, `3.21s`, `1m2.5s`, `1h0m3s`, `120µs` into milliseconds.
fn parse_go_duration_ms(raw: &str) -> Option<f64> {
    static PART: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)(h|ms|m|s|µs|us|ns)").expect("duration pattern is valid"));
    let mut total = 0.0;
    let mut consumed = 0;
    for caps in PART.captures_iter(raw) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let v: f64 = caps[1].parse().ok()?;
        total += match &caps[2] {
            "h" => v * 3_600_000.0,
            "m" => v * 60_000.0,
            "s" => v * 1_000.0,
            "ms" => v,
            "µs" | "us" => v / 1_000.0,
            _ => v / 1_000_000.0,
        };
    }
    (consumed > 0 && consumed == raw.len()).then_some(total)
}

/// One row of `gpu_metrics.txt`: `timestamp,temperature,utilization,used,total`.
pub fn parse_log_line(line: &str) -> Option<TelemetrySample> {
    let cells: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if cells.len() < 5 {
        return None;
    }
    let timestamp = parse_timestamp(cells[0])?;
    let num = |s: &str| s.parse::<f64>().ok();
    Some(TelemetrySample {
        timestamp,
        temperature: num(cells[1]),
        utilization: num(cells[2]),
        memory_used: num(cells[3]),
        memory_total: num(cells[4]),
    })
}

pub fn parse_log<I, S>(lines: I) -> TelemetrySeries
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut series = TelemetrySeries::default();
    for s in lines.into_iter().filter_map(|l| parse_log_line(l.as_ref())) {
        series.push(&s);
    }
    series
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Percentiles fall back to the maximum on small series (≤20 for p95,
/// ≤100 for p99), where a rank-based pick would be noise.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let max = sorted[n - 1];
    let median = if n % 2 == 1 { sorted[n / 2] } else { (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0 };
    let rank = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
    Some(Summary {
        count: n,
        min: sorted[0],
        max,
        mean: sorted.iter().sum::<f64>() / n as f64,
        median,
        p95: if n > 20 { rank(0.95) } else { max },
        p99: if n > 100 { rank(0.99) } else { max },
    })
}

fn telemetry_metrics(series: &TelemetrySeries) -> Metrics {
    let mut m = Metrics::new();
    m.insert("samples".into(), series.len() as f64);
    fn present(col: &[Option<f64>]) -> Vec<f64> {
        col.iter().flatten().copied().collect()
    }
    for (name, col) in [
        ("temperature", &series.temperature),
        ("utilization", &series.utilization),
        ("memory_used", &series.memory_used),
    ] {
        if let Some(s) = summarize(&present(col)) {
            m.insert(format!("{name}_avg"), s.mean);
            m.insert(format!("{name}_max"), s.max);
        }
    }
    if let Some(total) = present(&series.memory_total).last() {
        m.insert("memory_total".into(), *total);
    }
    m
}
