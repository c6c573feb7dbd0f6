use crate::sampler::NO_DATA;
use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Benchmark pattern a round was run with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    Throughput,
    Latency,
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestMode::Throughput => write!(f, "throughput"),
            TestMode::Latency => write!(f, "latency"),
        }
    }
}

/// Resource usage observed at a round boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Peak CPU since the previous snapshot, -1.0 when nothing was sampled
    pub cpu_peak_percent: f64,
    pub memory_peak_kb: u64,
    pub memory_current_kb: u64,
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub current_block_count: u64,
}

impl ResourceSample {
    pub fn has_cpu_data(&self) -> bool {
        self.cpu_peak_percent >= 0.0
    }
}

impl Default for ResourceSample {
    fn default() -> Self {
        Self {
            cpu_peak_percent: NO_DATA,
            memory_peak_kb: 0,
            memory_current_kb: 0,
            alloc_count: 0,
            dealloc_count: 0,
            current_block_count: 0,
        }
    }
}

/// Throughput-specific round statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub throughput_mbps: f64,
    pub throughput_pps: f64,
    pub avg_packet_size_bytes: f64,
    pub duplicate_count: u64,
    pub lost_sequences: Vec<u32>,
}

/// Latency-specific round statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_rtt_us: f64,
    pub min_rtt_us: f64,
    pub max_rtt_us: f64,
    pub p50_rtt_us: u64,
    pub p95_rtt_us: u64,
    pub p99_rtt_us: u64,
    pub rtt_samples: Vec<f64>,
}

/// Mode-specific part of a round result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeStats {
    Throughput(ThroughputStats),
    Latency(LatencyStats),
}

/// Which side of the exchange produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Subscriber,
}

/// Outcome of one completed round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    /// One-based round number
    pub round_index: u32,
    pub role: Role,
    pub resource_start: ResourceSample,
    pub resource_end: ResourceSample,
    pub sent_count: u64,
    pub received_count: u64,
    pub loss_rate_percent: f64,
    pub duration_seconds: f64,
    pub stats: ModeStats,
    /// Optional CPU time series; reduced to a peak when the result is stored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu_samples: Vec<f64>,
}

impl RoundResult {
    pub fn mode(&self) -> TestMode {
        match self.stats {
            ModeStats::Throughput(_) => TestMode::Throughput,
            ModeStats::Latency(_) => TestMode::Latency,
        }
    }

    /// Memory growth over the round in KB
    pub fn memory_delta_kb(&self) -> i64 {
        self.resource_end.memory_current_kb as i64 - self.resource_start.memory_current_kb as i64
    }

    /// Change in outstanding allocation blocks over the round
    pub fn block_delta(&self) -> i64 {
        self.resource_end.current_block_count as i64
            - self.resource_start.current_block_count as i64
    }
}

/// Receiver of completed round results
pub type ResultSink = Arc<dyn Fn(RoundResult) + Send + Sync>;

/// Loss figures for one round.
///
/// Both values are zero when nothing was expected.
pub fn loss_figures(expected: u64, received: u64) -> (u64, f64) {
    if expected == 0 {
        return (0, 0.0);
    }
    let lost = expected.saturating_sub(received);
    (lost, lost as f64 / expected as f64 * 100.0)
}

/// Packet and bit rates over `duration_seconds`.
///
/// Returns `(pps, mbps)`, where a megabit is 1024 * 1024 bits. Both are zero
/// for a non-positive duration or an empty round so a result never carries
/// NaN or infinity.
pub fn throughput_figures(
    received: u64,
    avg_packet_size_bytes: f64,
    duration_seconds: f64,
) -> (f64, f64) {
    if received == 0 || !(duration_seconds > 0.0) || !duration_seconds.is_finite() {
        return (0.0, 0.0);
    }
    let pps = received as f64 / duration_seconds;
    let mbps = avg_packet_size_bytes * received as f64 * 8.0 / (1024.0 * 1024.0) / duration_seconds;
    (pps, mbps)
}

/// Collects RTT samples for one latency round
pub struct RttCollector {
    samples_us: Vec<f64>,
    histogram: Histogram<u64>,
}

impl RttCollector {
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self {
            samples_us: Vec::new(),
            histogram,
        })
    }

    /// Record a sample; non-positive RTTs are rejected.
    pub fn record(&mut self, rtt_us: f64) -> bool {
        if !(rtt_us > 0.0) || !rtt_us.is_finite() {
            return false;
        }
        self.samples_us.push(rtt_us);
        // Percentiles are advisory; a histogram error does not drop the sample.
        if let Err(e) = self.histogram.record(rtt_us.round().max(1.0) as u64) {
            debug!("RTT {:.0}us left out of percentiles: {}", rtt_us, e);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.samples_us.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples_us.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples_us.clear();
        self.histogram.reset();
    }

    /// Summary statistics, all zero when no sample was recorded
    pub fn stats(&self) -> LatencyStats {
        if self.samples_us.is_empty() {
            return LatencyStats::default();
        }
        let min = self.samples_us.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.samples_us.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = self.samples_us.iter().sum::<f64>() / self.samples_us.len() as f64;

        LatencyStats {
            avg_rtt_us: avg,
            min_rtt_us: min,
            max_rtt_us: max,
            p50_rtt_us: self.histogram.value_at_percentile(50.0),
            p95_rtt_us: self.histogram.value_at_percentile(95.0),
            p99_rtt_us: self.histogram.value_at_percentile(99.0),
            rtt_samples: self.samples_us.clone(),
        }
    }
}
