use crate::metrics::{ModeStats, ResultSink, RoundResult, TestMode};
use crate::utils::{format_cpu, format_micros, format_packet_rate, generate_run_id};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Host details recorded alongside the results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_results: usize,
    pub missing_rounds: Vec<MissingRound>,
    pub system_info: SystemInfo,
}

/// A round of one mode that produced no result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRound {
    pub mode: TestMode,
    pub round_index: u32,
}

/// JSON document written by `MetricsAggregator::write_json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    pub metadata: ReportMetadata,
    pub results: Vec<RoundResult>,
}

/// Collects one result per round and role, and renders the final report.
///
/// Failed rounds simply have no entry; the summary and the JSON metadata
/// name them instead of inventing zeros. Rounds are tracked per mode, since
/// every mode numbers its rounds from 1.
pub struct MetricsAggregator {
    run_id: String,
    results: RwLock<Vec<RoundResult>>,
    expected: RwLock<Vec<(TestMode, u32)>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_run_id(generate_run_id())
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            results: RwLock::new(Vec::new()),
            expected: RwLock::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Store a result, folding any CPU time series into the end-of-round peak.
    pub fn add_result(&self, mut result: RoundResult) {
        if !result.cpu_samples.is_empty() {
            let peak = result
                .cpu_samples
                .iter()
                .copied()
                .filter(|sample| sample.is_finite())
                .fold(result.resource_end.cpu_peak_percent, f64::max);
            result.resource_end.cpu_peak_percent = peak;
            result.cpu_samples = Vec::new();
        }
        debug!(
            "Stored round {} {:?} result",
            result.round_index, result.role
        );
        self.results.write().push(result);
    }

    /// Sink that feeds engine results into this aggregator
    pub fn sink(self: &Arc<Self>) -> ResultSink {
        let aggregator = Arc::clone(self);
        Arc::new(move |result| aggregator.add_result(result))
    }

    /// Snapshot of every stored result in insertion order
    pub fn results(&self) -> Vec<RoundResult> {
        self.results.read().clone()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }

    /// Declare that `rounds` rounds of `mode` are scheduled.
    pub fn expect_rounds(&self, mode: TestMode, rounds: u32) {
        let mut expected = self.expected.write();
        match expected.iter_mut().find(|(m, _)| *m == mode) {
            Some(entry) => entry.1 = rounds,
            None => expected.push((mode, rounds)),
        }
    }

    /// Scheduled or seen modes, each with the last round to account for.
    ///
    /// Expected modes come first in declaration order, then modes that only
    /// appear in results.
    fn round_spans(&self, results: &[RoundResult]) -> Vec<(TestMode, u32)> {
        let mut spans = self.expected.read().clone();
        for result in results {
            let mode = result.mode();
            match spans.iter_mut().find(|(m, _)| *m == mode) {
                Some(span) => span.1 = span.1.max(result.round_index),
                None => spans.push((mode, result.round_index)),
            }
        }
        spans
    }

    /// Rounds of each mode without any stored result
    pub fn missing_rounds(&self) -> Vec<MissingRound> {
        let guard = self.results.read();
        let results: &[RoundResult] = &guard;
        self.round_spans(results)
            .into_iter()
            .flat_map(move |(mode, last)| {
                (1..=last)
                    .filter(move |round| {
                        !results
                            .iter()
                            .any(|r| r.mode() == mode && r.round_index == *round)
                    })
                    .map(move |round_index| MissingRound { mode, round_index })
            })
            .collect()
    }

    /// Render one line per round and role, grouped by mode, and log each line.
    ///
    /// Rounds of a mode that have no result get an explicit "no result" line.
    pub fn generate_summary(&self) -> String {
        let results = self.results.read();
        let mut summary = String::new();

        for (mode, last_round) in self.round_spans(&results) {
            for round in 1..=last_round {
                let mut found = false;
                for result in results
                    .iter()
                    .filter(|r| r.mode() == mode && r.round_index == round)
                {
                    found = true;
                    let line = summary_line(result);
                    info!("{}", line);
                    let _ = writeln!(summary, "{}", line);
                }
                if !found {
                    let line = format!("Round {} [{}]: no result", round, mode);
                    info!("{}", line);
                    let _ = writeln!(summary, "{}", line);
                }
            }
        }
        if results.is_empty() {
            summary.push_str("No rounds completed\n");
            info!("No rounds completed");
        }
        summary
    }

    /// Write every result plus run metadata as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let results = self.results();
        let document = ReportDocument {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                timestamp: chrono::Utc::now(),
                total_results: results.len(),
                missing_rounds: self.missing_rounds(),
                system_info: SystemInfo::default(),
            },
            results,
        };

        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        info!("Results written to: {:?}", path);
        Ok(())
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn summary_line(result: &RoundResult) -> String {
    let mode = match &result.stats {
        ModeStats::Throughput(t) => format!(
            "{:.2} Mbps, {}, avg {:.0} B",
            t.throughput_mbps,
            format_packet_rate(t.throughput_pps),
            t.avg_packet_size_bytes
        ),
        ModeStats::Latency(l) => format!(
            "RTT avg {} min {} max {}",
            format_micros(l.avg_rtt_us),
            format_micros(l.min_rtt_us),
            format_micros(l.max_rtt_us)
        ),
    };
    format!(
        "Round {} [{} {:?}]: sent {} recv {} loss {:.3}% | {} | CPU peak {} | mem {:+} KB (peak {} KB) | blocks {:+}",
        result.round_index,
        result.mode(),
        result.role,
        result.sent_count,
        result.received_count,
        result.loss_rate_percent,
        mode,
        format_cpu(result.resource_end.cpu_peak_percent),
        result.memory_delta_kb(),
        result.resource_end.memory_peak_kb,
        result.block_delta()
    )
}
