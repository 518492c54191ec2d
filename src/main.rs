//! CLI entry point for the ISI DAQ engine.
//!
//! Provides command-line interface for:
//! - Running the acquisition engine (simulated hardware for headless rigs)
//! - Analyzing a persisted session from the command line
//!
//! Physical camera/display drivers are external collaborators behind the
//! frame-source/frame-sink contracts; the binary links only the simulated
//! devices, so `run` currently requires `--simulate`.
//!
//! # Usage
//!
//! Start the engine against simulated hardware:
//! ```bash
//! isi_daq run --simulate
//! ```
//!
//! Analyze a recorded session:
//! ```bash
//! isi_daq analyze 0b24e1a8-...-9c
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use isi_daq::analysis::{backend, run_pipeline};
use isi_daq::config::Settings;
use isi_daq::hardware::mock::{SimulatedCamera, SimulatedDisplay};
use isi_daq::hardware::{FrameSink, FrameSource};
use isi_daq::rig::Rig;
use isi_daq::{logging, storage};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "isi_daq")]
#[command(about = "ISI acquisition and retinotopic analysis engine", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the acquisition engine
    Run {
        /// Use simulated camera and display hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Run the analysis pipeline over a persisted session
    Analyze {
        /// Session identifier under the storage root
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    settings.validate().context("configuration invalid")?;
    logging::init_from_config(&settings)?;

    match cli.command {
        Commands::Run { simulate } => run_engine(Arc::new(settings), simulate).await,
        Commands::Analyze { session_id } => analyze_session(&settings, &session_id),
    }
}

async fn run_engine(settings: Arc<Settings>, simulate: bool) -> Result<()> {
    if !simulate {
        bail!("no physical hardware driver is linked into this binary; run with --simulate");
    }

    let camera = &settings.camera;
    let source: Arc<dyn FrameSource> = Arc::new(SimulatedCamera::new(
        camera.width,
        camera.height,
        camera.channel_depth,
        camera.fps,
    ));
    let sink: Arc<dyn FrameSink> = Arc::new(SimulatedDisplay::new());

    let rig = Rig::start(settings, source, sink).await?;
    println!("control channel listening on {}", rig.control_addr);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    rig.shutdown().await;
    Ok(())
}

fn analyze_session(settings: &Settings, session_id: &str) -> Result<()> {
    let loaded = storage::load_session(&settings.storage.root, session_id)?;
    let compute = backend::from_name(&settings.analysis.backend)?;

    let stimulus_hz = loaded.manifest.params.stimulus_frequency_hz();
    let sample_hz = loaded.manifest.params.camera_fps;

    let mut progress = |stage: &str| println!("stage: {stage}");
    let products = run_pipeline(
        &loaded.datasets,
        stimulus_hz,
        sample_hz,
        &settings.analysis,
        compute.as_ref(),
        &mut progress,
    )?;

    let summary = serde_json::json!({
        "session_id": session_id,
        "directions": products.per_direction.len(),
        "boundaries": products.boundaries.len(),
        "regions": products.segmentation.regions.iter().map(|r| {
            serde_json::json!({
                "label": r.label,
                "sign": r.sign,
                "area": r.area,
                "centroid": [r.centroid.0, r.centroid.1],
            })
        }).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
