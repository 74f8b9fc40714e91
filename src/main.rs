mod options;

use anyhow::{Context, Result, bail};
use clap::Parser;
use options::Options;
use parkgrid::{
    config::Config,
    export::{to_geojson, write_csv},
    job::{JobEvent, Orchestrator},
};
use std::fs::File;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    let filter = if options.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_file_or_default(&options.config)?;

    options.apply(&mut config);

    let orchestrator = Orchestrator::from_config(config).context("invalid configuration")?;

    let mut handle = orchestrator.start(options.request());

    info!("Started job {}", handle.id);

    let cancel = handle.cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");

            cancel.cancel();
        }
    });

    let mut result = None;

    // logs and errors are already mirrored to tracing by the orchestrator
    while let Some(event) = handle.events.recv().await {
        match event {
            JobEvent::Log { .. } => {}
            JobEvent::Progress {
                value,
                completed,
                total,
            } => info!("{value:.1}% ({completed}/{total} blocks)"),
            JobEvent::Error { message } => bail!(message),
            JobEvent::Cancelled => bail!("job {} cancelled", handle.id),
            JobEvent::FinalResult { data } => result = Some(data),
        }
    }

    let result = result.context("job ended without a result")?;

    if let Some(ref path) = options.geojson {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;

        serde_json::to_writer_pretty(file, &to_geojson(&result.spaces))?;

        info!("Wrote {}", path.display());
    }

    if let Some(ref path) = options.csv {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;

        write_csv(&result.spaces, file)?;

        info!("Wrote {}", path.display());
    }

    info!(
        "{} parking spaces, {} vehicles, capacity {} ({:?}, {}% occupied)",
        result.total_spaces,
        result.total_vehicles_detected,
        result.total_estimated_capacity,
        result.occupancy.level,
        result.occupancy.occupancy_rate
    );

    if !result.failed_block_indices.is_empty() {
        warn!("Failed blocks: {:?}", result.failed_block_indices);
    }

    Ok(())
}
