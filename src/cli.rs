use crate::config::EngineSettings;
use crate::metrics::TestMode;
use crate::transport::LoopbackConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Pub/Sub Benchmark - round-based throughput, loss and latency measurement
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Test modes to run (space-separated: throughput, latency, or all)
    #[clap(short = 'm', long = "mode", value_enum, default_values_t = vec![BenchMode::Throughput], help_heading = "Core Options", num_args = 1..)]
    pub modes: Vec<BenchMode>,

    /// Scenario file (JSON); the built-in scenario is used when omitted
    #[clap(short = 's', long, help_heading = "Core Options")]
    pub scenario: Option<PathBuf>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output: PathBuf,

    /// Base channel name; latency adds _ping and _pong
    #[clap(long, default_value = crate::defaults::CHANNEL)]
    pub channel: String,

    /// Percentage of deliveries dropped by the loopback transport
    #[clap(long, default_value_t = 0.0, help_heading = "Fault Injection")]
    pub loss_percent: f64,

    /// One-way delivery delay in microseconds
    #[clap(long, default_value_t = 0, help_heading = "Fault Injection")]
    pub delay_us: u64,

    /// Seed for the loss generator
    #[clap(long, help_heading = "Fault Injection")]
    pub seed: Option<u64>,

    /// Give up on a peer match after this long (waits indefinitely if unset)
    #[clap(long, value_parser = parse_duration, help_heading = "Timeouts")]
    pub match_timeout: Option<Duration>,

    /// Bound on waiting for the END sentinel
    #[clap(long, value_parser = parse_duration, default_value = "60s", help_heading = "Timeouts")]
    pub round_timeout: Duration,

    /// How long the latency initiator waits for trailing replies
    #[clap(long, value_parser = parse_duration, default_value = "10s", help_heading = "Timeouts")]
    pub reply_window: Duration,

    /// CPU sampling interval [default: 50ms]
    #[clap(long, value_parser = parse_duration)]
    pub sample_interval: Option<Duration>,

    /// Also write logs to a daily rolling file in this directory
    #[clap(long)]
    pub log_dir: Option<PathBuf>,

    /// Continue with the remaining rounds when a round fails
    #[clap(long, default_value_t = false)]
    pub continue_on_error: bool,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

impl Args {
    /// Engine timing derived from the command line
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            match_timeout: self.match_timeout,
            round_end_timeout: Some(self.round_timeout),
            reply_window: self.reply_window,
            ..EngineSettings::default()
        }
    }

    /// CPU sampling interval, falling back to `defaults::SAMPLE_INTERVAL`
    pub fn sample_interval(&self) -> Duration {
        self.sample_interval.unwrap_or(crate::defaults::SAMPLE_INTERVAL)
    }

    pub fn loopback_config(&self) -> LoopbackConfig {
        LoopbackConfig {
            loss_percent: self.loss_percent,
            delay: Duration::from_micros(self.delay_us),
            seed: self.seed,
        }
    }
}

/// Test modes selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BenchMode {
    /// Unidirectional bulk transfer
    #[clap(name = "throughput")]
    Throughput,

    /// Ping/pong round trips
    #[clap(name = "latency")]
    Latency,

    /// Every mode
    #[clap(name = "all")]
    All,
}

impl std::fmt::Display for BenchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchMode::Throughput => write!(f, "Throughput"),
            BenchMode::Latency => write!(f, "Latency"),
            BenchMode::All => write!(f, "All Modes"),
        }
    }
}

impl BenchMode {
    /// Expand `All` and map to concrete test modes, keeping order
    pub fn expand_all(modes: &[BenchMode]) -> Vec<TestMode> {
        if modes.contains(&BenchMode::All) {
            return vec![TestMode::Throughput, TestMode::Latency];
        }
        let mut expanded = Vec::new();
        for mode in modes {
            let mode = match mode {
                BenchMode::Throughput => TestMode::Throughput,
                BenchMode::Latency => TestMode::Latency,
                BenchMode::All => continue,
            };
            if !expanded.contains(&mode) {
                expanded.push(mode);
            }
        }
        expanded
    }
}

/// Parse duration from string (e.g., "500us", "10ms", "10s", "5m")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("us") {
        (stripped, "us")
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if num < 0.0 || !num.is_finite() {
        return Err(format!("Duration must be non-negative: {}", s));
    }

    let duration = match unit {
        "us" => Duration::from_micros(num as u64),
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_mode_expand_all() {
        assert_eq!(
            BenchMode::expand_all(&[BenchMode::All]),
            vec![TestMode::Throughput, TestMode::Latency]
        );
        assert_eq!(
            BenchMode::expand_all(&[BenchMode::Latency, BenchMode::Latency]),
            vec![TestMode::Latency]
        );
    }

    #[test]
    fn test_args_parse_and_settings() {
        let args = Args::parse_from([
            "pubsub-bench",
            "--mode",
            "latency",
            "--loss-percent",
            "5",
            "--delay-us",
            "200",
            "--round-timeout",
            "5s",
        ]);
        assert_eq!(args.modes, vec![BenchMode::Latency]);
        let settings = args.engine_settings();
        assert_eq!(settings.round_end_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.end_packet_repeats, 3);
        let loopback = args.loopback_config();
        assert_eq!(loopback.delay, Duration::from_micros(200));
        assert_eq!(loopback.loss_percent, 5.0);
    }

    #[test]
    fn test_sample_interval_default_and_override() {
        let args = Args::parse_from(["pubsub-bench"]);
        assert_eq!(args.sample_interval, None);
        assert_eq!(args.sample_interval(), crate::defaults::SAMPLE_INTERVAL);

        let args = Args::parse_from(["pubsub-bench", "--sample-interval", "20ms"]);
        assert_eq!(args.sample_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(BenchMode::Throughput.to_string(), "Throughput");
        assert_eq!(BenchMode::All.to_string(), "All Modes");
    }
}
