//! # Pub/Sub Benchmark Library
//!
//! A round-based benchmark harness that measures throughput, packet loss and
//! round-trip latency of a publish/subscribe channel while sampling process
//! CPU and allocator usage in the background.
//!
//! ## Architecture Overview
//!
//! - `codec`: the 13-byte packet header and the typed END sentinel
//! - `sampler`: background CPU peak sampler and the round-boundary monitor
//! - `memory`: counting global allocator and the `MemoryProbe` seam
//! - `sync`: peer matching, reconnect detection, round-end latch, cancellation
//! - `transport`: writer/reader traits and the in-process loopback bus
//! - `throughput` / `latency`: the two round engines
//! - `metrics` / `results`: round records, statistics, summary and JSON report
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pubsub_bench::{
//!     EngineContext, LoopbackTransport, MetricsAggregator, NoMemoryProbe, ResourceMonitor,
//!     RoundConfig, RoundRunner, ThroughputEngine,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let aggregator = Arc::new(MetricsAggregator::new());
//! let monitor = Arc::new(ResourceMonitor::start(
//!     Arc::new(NoMemoryProbe),
//!     Duration::from_millis(50),
//! ));
//! let context = EngineContext::new(
//!     Arc::new(LoopbackTransport::default()),
//!     monitor,
//!     aggregator.sink(),
//! );
//! let engine = Arc::new(ThroughputEngine::new(context, "bench"));
//!
//! let config = RoundConfig::default();
//! let subscriber = Arc::clone(&engine);
//! let sub_config = config.clone();
//! let handle = std::thread::spawn(move || subscriber.run_subscriber_round(&sub_config));
//! engine.run_publisher_round(&config)?;
//! handle.join().expect("subscriber thread")?;
//!
//! println!("{}", aggregator.generate_summary());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod latency;
pub mod logging;
pub mod memory;
pub mod metrics;

/// Round results, summary rendering and JSON export
pub mod results;

pub mod sampler;

/// Peer matching and round-end signalling
///
/// Blocking waits in this module honour a `CancellationToken` and never spin
/// longer than a short poll interval.
pub mod sync;

pub mod throughput;

/// Transport collaborator
///
/// Engines only see the `Transport`, `PacketWriter` and `PacketReader`
/// traits; `LoopbackTransport` is the in-process implementation.
pub mod transport;

pub mod utils;

pub use cli::{Args, BenchMode};
pub use codec::{PacketHeader, PacketKind, HEADER_SIZE};
pub use config::{EngineSettings, RoundConfig, ScenarioTemplate};
pub use engine::{EngineContext, RoundRunner};
pub use error::{BenchError, TransportError};
pub use latency::LatencyEngine;
pub use memory::{CountingAllocator, MemoryProbe, MemoryStats, NoMemoryProbe};
pub use metrics::{ModeStats, ResourceSample, RoundResult, TestMode};
pub use results::MetricsAggregator;
pub use sampler::{PeakWindow, ResourceMonitor, ResourceSampler, ResourceWindow, NO_DATA};
pub use sync::CancellationToken;
pub use throughput::ThroughputEngine;
pub use transport::{LoopbackConfig, LoopbackTransport, Transport};

/// The current version of the benchmark
///
/// Populated from Cargo.toml and recorded in every JSON report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Payload size when a scenario leaves it unset
    pub const PAYLOAD_SIZE: usize = 64;

    /// Packets per round when a scenario leaves it unset
    pub const SEND_COUNT: u64 = 1000;

    /// Default output file name
    pub const OUTPUT_FILE: &str = "benchmark_results.json";

    /// Default base channel name
    pub const CHANNEL: &str = "pubsub_bench";

    /// CPU sampling interval
    ///
    /// Short enough to catch bursts inside a sub-second round, long enough
    /// that the sampler itself does not show up in the peak.
    pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);
}
