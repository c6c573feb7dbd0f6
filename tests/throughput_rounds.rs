//! End-to-end throughput rounds over the loopback transport.

use pubsub_bench::config::EngineSettings;
use pubsub_bench::metrics::{ModeStats, Role};
use pubsub_bench::sampler::{CpuClock, CpuTimes};
use pubsub_bench::{
    BenchError, CancellationToken, EngineContext, LoopbackConfig, LoopbackTransport,
    MetricsAggregator, NoMemoryProbe, ResourceMonitor, RoundConfig, RoundResult, RoundRunner,
    TestMode, ThroughputEngine,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fast_settings() -> EngineSettings {
    EngineSettings {
        match_poll_interval: Duration::from_millis(5),
        match_timeout: Some(Duration::from_secs(10)),
        ack_timeout: Duration::from_secs(5),
        end_packet_gap: Duration::from_millis(2),
        reconnect_timeout: Duration::from_secs(5),
        round_end_timeout: Some(Duration::from_secs(20)),
        ..EngineSettings::default()
    }
}

struct Harness {
    transport: LoopbackTransport,
    aggregator: Arc<MetricsAggregator>,
    publisher: Arc<ThroughputEngine>,
    subscriber: Arc<ThroughputEngine>,
}

impl Harness {
    fn new(transport: LoopbackTransport, channel: &str) -> Self {
        Self::with_settings(transport, channel, fast_settings())
    }

    fn with_settings(transport: LoopbackTransport, channel: &str, settings: EngineSettings) -> Self {
        let aggregator = Arc::new(MetricsAggregator::new());
        let monitor = Arc::new(ResourceMonitor::start(
            Arc::new(NoMemoryProbe),
            Duration::from_millis(20),
        ));
        let context = EngineContext::new(Arc::new(transport.clone()), monitor, aggregator.sink())
            .with_settings(settings);
        Self {
            transport,
            aggregator,
            publisher: Arc::new(ThroughputEngine::new(context.clone(), channel)),
            subscriber: Arc::new(ThroughputEngine::new(context, channel)),
        }
    }

    /// Run both roles of one round and wait for both to finish.
    fn run_round(&self, config: &RoundConfig) {
        let subscriber = Arc::clone(&self.subscriber);
        let sub_config = config.clone();
        let handle = thread::spawn(move || subscriber.run_subscriber_round(&sub_config));
        self.publisher.run_publisher_round(config).unwrap();
        handle.join().unwrap().unwrap();
    }

    fn subscriber_result(&self, round: u32) -> RoundResult {
        self.aggregator
            .results()
            .into_iter()
            .find(|r| r.round_index == round && r.role == Role::Subscriber)
            .expect("subscriber result for round")
    }
}

fn round(active_round: u32, send_count: u64) -> RoundConfig {
    RoundConfig {
        active_round,
        send_count,
        ..RoundConfig::default()
    }
}

#[test]
fn test_small_round_delivers_everything() {
    let harness = Harness::new(LoopbackTransport::default(), "tp_small");
    harness.run_round(&round(1, 10));

    let result = harness.subscriber_result(1);
    assert_eq!(result.sent_count, 10);
    assert_eq!(result.received_count, 10);
    assert_eq!(result.loss_rate_percent, 0.0);
    let ModeStats::Throughput(stats) = &result.stats else {
        panic!("expected throughput stats");
    };
    assert!(stats.lost_sequences.is_empty());
    assert_eq!(stats.avg_packet_size_bytes, 64.0);
    assert_eq!(stats.duplicate_count, 0);

    let published = harness
        .aggregator
        .results()
        .into_iter()
        .find(|r| r.role == Role::Publisher)
        .unwrap();
    assert_eq!(published.sent_count, 10);
}

#[test]
fn test_dropped_sequence_is_reported_lost() {
    let transport = LoopbackTransport::default();
    // Drop DATA packet 999 only; END shares no sequence with it.
    transport.set_drop_filter(Arc::new(|payload: &[u8]| {
        payload.len() >= 13
            && payload[12] == 0
            && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) == 999
    }));
    let harness = Harness::new(transport, "tp_drop");
    harness.run_round(&round(1, 1000));

    let result = harness.subscriber_result(1);
    assert_eq!(result.received_count, 999);
    assert!((result.loss_rate_percent - 0.1).abs() < 1e-9);
    let ModeStats::Throughput(stats) = &result.stats else {
        panic!("expected throughput stats");
    };
    assert_eq!(stats.lost_sequences, vec![999]);
}

#[test]
fn test_variable_sizes_stay_in_range() {
    let harness = Harness::new(LoopbackTransport::default(), "tp_sizes");
    let config = RoundConfig {
        min_size: 100,
        max_size: 200,
        ..round(1, 200)
    };
    harness.run_round(&config);

    let result = harness.subscriber_result(1);
    let ModeStats::Throughput(stats) = &result.stats else {
        panic!("expected throughput stats");
    };
    assert_eq!(result.received_count, 200);
    assert!(stats.avg_packet_size_bytes >= 100.0 && stats.avg_packet_size_bytes <= 200.0);
}

#[test]
fn test_consecutive_rounds_reconnect_and_reset() {
    let harness = Harness::new(LoopbackTransport::default(), "tp_rounds");
    harness.run_round(&round(1, 50));
    harness.run_round(&round(2, 80));
    harness.run_round(&RoundConfig {
        send_delay_every: 10,
        send_delay: Duration::from_micros(200),
        ..round(3, 30)
    });

    for (round_index, expected) in [(1, 50), (2, 80), (3, 30)] {
        let result = harness.subscriber_result(round_index);
        assert_eq!(result.received_count, expected, "round {}", round_index);
        assert_eq!(result.loss_rate_percent, 0.0);
    }
    assert_eq!(harness.aggregator.len(), 6);
    harness.aggregator.expect_rounds(TestMode::Throughput, 3);
    assert!(harness.aggregator.missing_rounds().is_empty());
    assert_eq!(harness.subscriber.counters().invalid_payloads(), 0);
    harness.transport.shutdown();
}

/// Reports the process as using half of the system on every read.
struct HalfShareClock {
    ticks: u64,
}

impl CpuClock for HalfShareClock {
    fn read(&mut self) -> Option<CpuTimes> {
        self.ticks += 1;
        Some(CpuTimes {
            process: self.ticks * 500,
            system: self.ticks * 1000,
        })
    }
}

#[test]
fn test_both_roles_see_cpu_peak_on_shared_monitor() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let monitor = Arc::new(ResourceMonitor::with_clock(
        Arc::new(NoMemoryProbe),
        Duration::from_millis(20),
        HalfShareClock { ticks: 0 },
    ));
    let transport = LoopbackTransport::default();
    let context = EngineContext::new(
        Arc::new(transport.clone()),
        Arc::clone(&monitor),
        aggregator.sink(),
    )
    .with_settings(fast_settings());
    let harness = Harness {
        transport,
        aggregator: Arc::clone(&aggregator),
        publisher: Arc::new(ThroughputEngine::new(context.clone(), "tp_shared_monitor")),
        subscriber: Arc::new(ThroughputEngine::new(context, "tp_shared_monitor")),
    };
    // Paced to last roughly 200ms, several sampling intervals.
    harness.run_round(&RoundConfig {
        send_delay_every: 10,
        send_delay: Duration::from_millis(5),
        ..round(1, 400)
    });

    for role in [Role::Publisher, Role::Subscriber] {
        let result = aggregator
            .results()
            .into_iter()
            .find(|r| r.role == role)
            .expect("result for role");
        assert!(
            (result.resource_end.cpu_peak_percent - 50.0).abs() < 1e-9,
            "{:?} end peak {}",
            role,
            result.resource_end.cpu_peak_percent
        );
    }
    monitor.shutdown();
}

#[test]
fn test_random_loss_is_counted() {
    let transport = LoopbackTransport::new(LoopbackConfig {
        loss_percent: 20.0,
        seed: Some(7),
        ..LoopbackConfig::default()
    });
    // Enough END copies that one survives the loss.
    let mut settings = fast_settings();
    settings.end_packet_repeats = 20;
    let harness = Harness::with_settings(transport, "tp_loss", settings);
    harness.run_round(&round(1, 500));

    let result = harness.subscriber_result(1);
    assert!(result.received_count < 500);
    assert!(result.loss_rate_percent > 0.0);
    let ModeStats::Throughput(stats) = &result.stats else {
        panic!("expected throughput stats");
    };
    assert_eq!(stats.lost_sequences.len() as u64, 500 - result.received_count);
}

#[test]
fn test_cancelled_match_wait_emits_nothing() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let monitor = Arc::new(ResourceMonitor::start(
        Arc::new(NoMemoryProbe),
        Duration::from_millis(20),
    ));
    let cancel = CancellationToken::new();
    let mut settings = fast_settings();
    settings.match_timeout = None;
    let context = EngineContext::new(
        Arc::new(LoopbackTransport::default()),
        monitor,
        aggregator.sink(),
    )
    .with_settings(settings)
    .with_cancel(cancel.clone());
    let engine = Arc::new(ThroughputEngine::new(context, "tp_cancel"));

    let subscriber = Arc::clone(&engine);
    let handle = thread::spawn(move || subscriber.run_subscriber_round(&round(1, 10)));
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(BenchError::Cancelled { round: 1 })));
    assert!(aggregator.is_empty());
}

#[test]
fn test_match_timeout_fails_round() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let monitor = Arc::new(ResourceMonitor::start(
        Arc::new(NoMemoryProbe),
        Duration::from_millis(20),
    ));
    let mut settings = fast_settings();
    settings.match_timeout = Some(Duration::from_millis(30));
    let context = EngineContext::new(
        Arc::new(LoopbackTransport::default()),
        monitor,
        aggregator.sink(),
    )
    .with_settings(settings);
    let engine = ThroughputEngine::new(context, "tp_lonely");

    let result = engine.run_publisher_round(&round(1, 10));
    assert!(matches!(result, Err(BenchError::PeerMatch { .. })));
    assert!(aggregator.is_empty());
}
