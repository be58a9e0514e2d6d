//! Tileres Simulator
//!
//! Drives the resource engine with synthetic providers and an in-memory GPU:
//! the viewport pans across a tile grid while zooming in and out, and the
//! engine fetches, uploads, falls back and evicts as it would under a real
//! renderer. Metrics and per-collection statistics are printed at the end.
//!
//! ```text
//! ┌──────────────┐  active zone   ┌──────────────────┐  sync   ┌──────────────┐
//! │ frame loop   │ ─────────────▶ │ ResourcesEngine  │ ──────▶ │ RecordingGpu │
//! └──────────────┘                └──────────────────┘         └──────────────┘
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tileres::adapters::{EmbeddedBundle, RecordingGpu, StaticKeyedProvider, SyntheticTileProvider};
use tileres::domain::NoopSignals;
use tileres::resources::{CollectionStats, MetricsSnapshot};
use tileres::{EngineConfig, ProviderId, ProviderRegistration, ResourcesEngine, Result, TileId, ZoomLevel};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tileres - resource lifecycle simulator for tiled map rendering
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of frames to simulate
    #[arg(long, env = "TILERES_FRAMES", default_value = "120")]
    frames: u32,

    /// Fetch worker threads (overrides the config file)
    #[arg(long, env = "TILERES_WORKERS")]
    workers: Option<usize>,

    /// YAML engine config
    #[arg(long, env = "TILERES_CONFIG")]
    config: Option<String>,

    /// Simulated provider latency in milliseconds
    #[arg(long, env = "TILERES_LATENCY_MS", default_value = "2")]
    latency_ms: u64,

    /// Frame duration in milliseconds
    #[arg(long, env = "TILERES_FRAME_MS", default_value = "4")]
    frame_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    frames: u32,
    metrics: MetricsSnapshot,
    collections: Vec<CollectionStats>,
    gpu_uploads: usize,
    gpu_live_handles: usize,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }

    info!("Starting Tileres simulator");
    info!("  Frames: {}", args.frames);
    info!("  Fetch workers: {}", config.effective_worker_threads());
    info!("  Background worker: {}", config.background_worker);

    let engine = ResourcesEngine::with_bundle(
        config,
        Arc::new(NoopSignals),
        Arc::new(EmbeddedBundle::with_default_stubs()),
    )?;
    let gpu = RecordingGpu::new();

    let latency = Duration::from_millis(args.latency_ms);
    let symbols = Arc::new(StaticKeyedProvider::new(["pois", "labels"]).with_latency(latency));
    engine.update_bindings(vec![
        ProviderRegistration::new(
            ProviderId::new(1),
            Arc::new(SyntheticTileProvider::raster().with_latency(latency)),
        ),
        ProviderRegistration::new(
            ProviderId::new(2),
            Arc::new(
                SyntheticTileProvider::elevation()
                    .with_latency(latency)
                    .with_zoom_range(ZoomLevel::new(0), ZoomLevel::new(12)),
            ),
        ),
        ProviderRegistration::new(ProviderId::new(3), symbols.clone()),
    ])?;

    let frame = Duration::from_millis(args.frame_ms);
    for i in 0..args.frames {
        let (tiles, zoom) = viewport(i);
        engine.update_active_zone(tiles, zoom);
        if i == args.frames / 2 {
            symbols.set_keys(["labels", "roads"]);
        }
        if !engine.config().background_worker {
            engine.process_pending_work()?;
        }
        thread::sleep(frame);
        engine.sync_resources_in_gpu(&gpu, None);
    }

    if !engine.wait_for_fetches(Duration::from_secs(5)) {
        warn!(in_flight = engine.in_flight_fetches(), "Timed out waiting for fetches");
    }
    let collections = engine.collection_stats();
    engine.update_active_zone(Vec::new(), ZoomLevel::MIN);
    engine.release_all_resources(&gpu, false);
    engine.shutdown();

    let report = Report {
        frames: args.frames,
        metrics: engine.metrics(),
        collections,
        gpu_uploads: gpu.uploads(),
        gpu_live_handles: gpu.live_handles(),
    };
    print_report(&report, args.json)?;

    info!("Simulation complete");
    Ok(())
}

/// 3x3 viewport panning right; zoom oscillates between 4 and 8.
fn viewport(frame: u32) -> (Vec<TileId>, ZoomLevel) {
    let zoom = 4 + ((frame / 20) % 5) as u8;
    let origin = (frame / 4) as i32;
    let tiles = (0..3)
        .flat_map(|dy| (0..3).map(move |dx| TileId::new(origin + dx, dy)))
        .collect();
    (tiles, ZoomLevel::new(zoom))
}

fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let m = &report.metrics;
    println!("Frames simulated:    {}", report.frames);
    println!("Requests issued:     {}", m.requests_issued);
    println!("Fetches ready:       {}", m.fetches_ready);
    println!("Fetches unavailable: {}", m.fetches_unavailable);
    println!("Fetches cancelled:   {}", m.fetches_cancelled);
    println!("Uploads:             {} ({} bytes)", m.uploads_ok, m.bytes_uploaded);
    println!("Unloads:             {}", m.unloads);
    println!("Entries removed:     {}", m.entries_removed);
    println!("GPU handles leaked:  {}", report.gpu_live_handles);
    for stats in &report.collections {
        println!(
            "  {} {:?}: {} entries, {} junk",
            stats.provider_id, stats.resource_type, stats.total, stats.junk
        );
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so `--json` output stays parseable.
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
