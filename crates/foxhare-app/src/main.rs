//! Command-line shell for the foxhare predation simulation.

use anyhow::{Context, Result};
use clap::Parser;
use foxhare_core::{SimConfig, World};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

mod layout;
mod metrics;

#[derive(Parser, Debug)]
#[command(name = "foxhare")]
#[command(about = "Predator-prey ecosystem simulator on a discrete grid")]
struct Args {
    /// TOML parameter file; defaults apply for missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Terrain layout file: one line per row, comma-separated 1-based
    /// column indices marking forest cells
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Random seed override for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Tick count override
    #[arg(long)]
    ticks: Option<u64>,

    /// Metrics output path (JSON lines, one population summary per tick)
    #[arg(long, default_value = "metrics.jsonl")]
    metrics: PathBuf,

    /// Ticks between progress reports; 0 disables them
    #[arg(long, default_value_t = 100)]
    report_interval: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(seed) = args.seed {
        config.rng_seed = Some(seed);
    }
    if let Some(ticks) = args.ticks {
        config.iterations = ticks;
    }

    let terrain = match args.layout.as_deref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading layout {}", path.display()))?;
            layout::parse_layout(&text, config.width, config.height)?
        }
        None => layout::default_terrain(config.width, config.height)?,
    };

    let sink = metrics::JsonlSink::create(&args.metrics)
        .with_context(|| format!("opening metrics file {}", args.metrics.display()))?;
    let mut world = World::with_sink(config.clone(), terrain, Box::new(sink))?;
    world.populate()?;

    let start = world.population();
    info!(
        hares = start.hares,
        foxes = start.foxes,
        entities = start.total,
        seed = ?config.rng_seed,
        "world populated"
    );

    for tick in 1..=config.iterations {
        let summary = world.step();
        if args.report_interval > 0 && tick % args.report_interval == 0 {
            info!(
                tick = summary.tick.0,
                hares = summary.hares,
                foxes = summary.foxes,
                entities = summary.total,
                "progress"
            );
        }
        if summary.hares == 0 && summary.foxes == 0 {
            warn!(tick = summary.tick.0, "both populations extinct, stopping early");
            break;
        }
    }

    let end = world.population();
    info!(
        tick = world.tick().0,
        hares = end.hares,
        foxes = end.foxes,
        entities = end.total,
        "run complete"
    );
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&Path>) -> Result<SimConfig> {
    let Some(path) = path else {
        return Ok(SimConfig::default());
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: SimConfig =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}
