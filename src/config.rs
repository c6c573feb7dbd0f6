//! Scenario and round configuration.
//!
//! A `ScenarioTemplate` holds one array per round parameter; round `i` takes
//! element `i` of each array. `RoundConfig::from_template` resolves and
//! validates a single round, and `EngineSettings` carries the timing knobs the
//! engines share across rounds.

use crate::codec::HEADER_SIZE;
use crate::defaults;
use crate::error::{BenchError, Result};
use crate::utils::{validate_print_gap, validate_size_range};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-round parameter arrays loaded from JSON.
///
/// The number of rounds is the length of `min_size`. Any other array that is
/// shorter reuses its last element; an empty array falls back to the crate
/// default for that parameter (`max_size` falls back to `min_size`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTemplate {
    #[serde(default = "default_name")]
    pub name: String,
    pub min_size: Vec<usize>,
    #[serde(default)]
    pub max_size: Vec<usize>,
    #[serde(default)]
    pub send_count: Vec<u64>,
    /// Sleep after every N sends, 0 disables pacing
    #[serde(default)]
    pub send_delay_count: Vec<u64>,
    /// Pacing sleep in microseconds
    #[serde(default)]
    pub send_delay_us: Vec<u64>,
    #[serde(default)]
    pub send_print_gap: Vec<i64>,
    #[serde(default)]
    pub recv_print_gap: Vec<i64>,
}

fn default_name() -> String {
    "scenario".to_string()
}

/// Element `index`, else the last element, else `fallback`.
fn pick<T: Copy>(values: &[T], index: usize, fallback: T) -> T {
    values
        .get(index)
        .or_else(|| values.last())
        .copied()
        .unwrap_or(fallback)
}

impl ScenarioTemplate {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let template: Self =
            serde_json::from_str(json).context("Failed to parse scenario JSON")?;
        if template.min_size.is_empty() {
            anyhow::bail!("Scenario '{}' defines no rounds", template.name);
        }
        Ok(template)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
        Self::from_json_str(&json)
            .with_context(|| format!("Invalid scenario file {}", path.display()))
    }

    /// Built-in scenario used when no file is given.
    pub fn builtin() -> Self {
        Self {
            name: "default".to_string(),
            min_size: vec![64, 1024, 16 * 1024, 64],
            max_size: vec![64, 1024, 16 * 1024, 8 * 1024],
            send_count: vec![10_000, 10_000, 2_000, 5_000],
            send_delay_count: vec![100],
            send_delay_us: vec![100],
            send_print_gap: vec![2_000, 2_000, 500, 1_000],
            recv_print_gap: vec![2_000, 2_000, 500, 1_000],
        }
    }

    pub fn rounds(&self) -> usize {
        self.min_size.len()
    }

    /// Resolve every round, failing on the first invalid one.
    pub fn round_configs(&self) -> Result<Vec<RoundConfig>> {
        (0..self.rounds())
            .map(|index| RoundConfig::from_template(self, index))
            .collect()
    }
}

/// Parameters of one round. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundConfig {
    /// One-based round number
    pub active_round: u32,
    pub min_size: usize,
    pub max_size: usize,
    pub send_count: u64,
    /// Sleep after every N sends, 0 disables pacing
    pub send_delay_every: u64,
    pub send_delay: Duration,
    /// Publisher progress log cadence, 0 disables
    pub print_gap: u64,
    /// Receiver progress log cadence, 0 disables
    pub recv_print_gap: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            active_round: 1,
            min_size: defaults::PAYLOAD_SIZE,
            max_size: defaults::PAYLOAD_SIZE,
            send_count: defaults::SEND_COUNT,
            send_delay_every: 0,
            send_delay: Duration::ZERO,
            print_gap: 0,
            recv_print_gap: 0,
        }
    }
}

impl RoundConfig {
    /// Resolve round `round_index` (zero-based) of `template`.
    pub fn from_template(template: &ScenarioTemplate, round_index: usize) -> Result<Self> {
        if round_index >= template.rounds() {
            return Err(BenchError::InvalidConfig(format!(
                "round {} out of range, scenario '{}' has {} rounds",
                round_index + 1,
                template.name,
                template.rounds()
            )));
        }
        let min_size = pick(&template.min_size, round_index, defaults::PAYLOAD_SIZE);
        let config = Self {
            active_round: round_index as u32 + 1,
            min_size,
            max_size: pick(&template.max_size, round_index, min_size),
            send_count: pick(&template.send_count, round_index, defaults::SEND_COUNT),
            send_delay_every: pick(&template.send_delay_count, round_index, 0),
            send_delay: Duration::from_micros(pick(&template.send_delay_us, round_index, 0)),
            print_gap: invalid(validate_print_gap(pick(&template.send_print_gap, round_index, 0)))?,
            recv_print_gap: invalid(validate_print_gap(pick(
                &template.recv_print_gap,
                round_index,
                0,
            )))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.active_round == 0 {
            return Err(BenchError::InvalidConfig(
                "round numbers start at 1".to_string(),
            ));
        }
        if self.send_count > u32::MAX as u64 + 1 {
            return Err(BenchError::InvalidConfig(format!(
                "send count {} exceeds the 32-bit sequence space",
                self.send_count
            )));
        }
        invalid(validate_size_range(self.min_size, self.max_size))
    }

    pub fn fixed_size(&self) -> bool {
        self.min_size == self.max_size
    }

    /// Size actually put on the wire for a requested size
    pub fn effective_size(size: usize) -> usize {
        size.max(HEADER_SIZE)
    }
}

fn invalid<T>(result: anyhow::Result<T>) -> Result<T> {
    result.map_err(|e| BenchError::InvalidConfig(e.to_string()))
}

/// Timing knobs shared by every round.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Cadence of the matched-peer poll
    pub match_poll_interval: Duration,
    /// Bound on the peer match wait, `None` waits until cancelled
    pub match_timeout: Option<Duration>,
    /// Bound on the publisher's acknowledgment wait
    pub ack_timeout: Duration,
    pub end_packet_repeats: u32,
    pub end_packet_gap: Duration,
    /// Bound on waiting for a lost peer to come back
    pub reconnect_timeout: Duration,
    /// Bound on waiting for END, `None` waits until cancelled
    pub round_end_timeout: Option<Duration>,
    /// How long the latency initiator waits for trailing replies
    pub reply_window: Duration,
    /// Gap between latency probes when the round configures no pacing
    pub probe_gap: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            match_poll_interval: Duration::from_secs(1),
            match_timeout: None,
            ack_timeout: Duration::from_secs(10),
            end_packet_repeats: 3,
            end_packet_gap: Duration::from_millis(10),
            reconnect_timeout: Duration::from_secs(30),
            round_end_timeout: Some(Duration::from_secs(60)),
            reply_window: Duration::from_secs(10),
            probe_gap: Duration::from_micros(100),
        }
    }
}
