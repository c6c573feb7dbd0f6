//! # Pub/Sub Benchmark - Main Entry Point
//!
//! Runs every configured round of each selected mode with both roles in this
//! process over the loopback transport:
//!
//! 1. **Initialize logging**: colorized console plus optional rolling file
//! 2. **Parse arguments** and load the scenario
//! 3. **Start the resource monitor** on the counting global allocator
//! 4. **Run rounds**: subscriber and publisher on blocking tasks, Ctrl-C cancels
//! 5. **Report**: per-round summary and JSON results

use anyhow::{Context, Result};
use clap::Parser;
use pubsub_bench::{
    cli::{Args, BenchMode},
    logging,
    utils::validate_loss_percent,
    CancellationToken, CountingAllocator, EngineContext, LatencyEngine, LoopbackTransport,
    MemoryProbe, MetricsAggregator, ResourceMonitor, RoundConfig, RoundRunner, ScenarioTemplate,
    TestMode, ThroughputEngine, Transport,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator::new();

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.log_dir.as_deref())?;

    info!("Starting Pub/Sub Benchmark {}", pubsub_bench::VERSION);
    info!("Configuration: {:?}", args);
    validate_loss_percent(args.loss_percent)?;

    let template = match &args.scenario {
        Some(path) => ScenarioTemplate::from_json_file(path)?,
        None => ScenarioTemplate::builtin(),
    };
    let rounds = template
        .round_configs()
        .with_context(|| format!("Scenario '{}' is invalid", template.name))?;
    info!("Scenario '{}' with {} rounds", template.name, rounds.len());

    let transport = Arc::new(LoopbackTransport::new(args.loopback_config()));
    info!("Transport: {}", transport.name());
    let memory: Arc<dyn MemoryProbe> = Arc::new(&ALLOCATOR);
    let monitor = Arc::new(ResourceMonitor::start(memory, args.sample_interval()));
    let aggregator = Arc::new(MetricsAggregator::new());
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the current round");
            ctrl_c.cancel();
        }
    });

    let context = EngineContext::new(transport.clone(), Arc::clone(&monitor), aggregator.sink())
        .with_settings(args.engine_settings())
        .with_cancel(cancel.clone());

    let modes = BenchMode::expand_all(&args.modes);
    for mode in &modes {
        aggregator.expect_rounds(*mode, rounds.len() as u32);
    }

    'modes: for mode in modes {
        let channel = format!("{}_{}", args.channel, mode);
        let engine: Arc<dyn RoundRunner> = match mode {
            TestMode::Throughput => Arc::new(ThroughputEngine::new(context.clone(), channel)),
            TestMode::Latency => Arc::new(LatencyEngine::new(context.clone(), channel)?),
        };
        info!("Running {} rounds", engine.mode());

        for config in &rounds {
            if cancel.is_cancelled() {
                break 'modes;
            }
            match run_round(Arc::clone(&engine), config.clone()).await {
                Ok(()) => info!("Round {} ({}) completed", config.active_round, mode),
                Err(e) => {
                    error!("Round {} ({}) failed: {:#}", config.active_round, mode, e);
                    if !args.continue_on_error {
                        break 'modes;
                    }
                }
            }
        }
    }

    aggregator.generate_summary();
    aggregator.write_json(&args.output)?;

    monitor.shutdown();
    transport.shutdown();
    info!("Pub/Sub Benchmark completed (run {})", aggregator.run_id());
    Ok(())
}

/// Run both roles of one round on blocking tasks and wait for both.
async fn run_round(engine: Arc<dyn RoundRunner>, config: RoundConfig) -> Result<()> {
    let subscriber = {
        let engine = Arc::clone(&engine);
        let config = config.clone();
        tokio::task::spawn_blocking(move || engine.run_subscriber_round(&config))
    };
    let publisher = tokio::task::spawn_blocking(move || engine.run_publisher_round(&config));

    let (subscriber, publisher) = tokio::join!(subscriber, publisher);
    let subscriber = subscriber.context("Subscriber task panicked")?;
    let publisher = publisher.context("Publisher task panicked")?;
    subscriber.context("Subscriber role failed")?;
    publisher.context("Publisher role failed")?;
    Ok(())
}
