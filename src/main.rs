use chrono::Utc;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use stvid_acquire::camera::DriverAdapter;
use stvid_acquire::config::{Config, DEFAULT_CONFIG_PATH};
use stvid_acquire::logging;
use stvid_acquire::session::{observation_dir, CaptureSessionController};
use stvid_acquire::twilight::{CapturePlan, TwilightWindowCalculator};
use stvid_acquire::util::AbortSignal;
use tokio::signal;
use tracing::{info, warn, Level};

/// Capture and compress live video frames.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    conf_file: PathBuf,

    /// Testing mode - start capturing immediately for 31 minutes
    #[arg(short, long)]
    test: bool,

    /// Display live image while capturing
    #[arg(short, long)]
    live: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let config = Arc::new(Config::load(&args.conf_file)?);
    config.paths.prepare()?;

    let now = Utc::now();
    let session_dir = observation_dir(&config, now, args.test);
    fs::create_dir_all(&session_dir)?;
    logging::init(&session_dir, Level::DEBUG)?;

    info!("Using config: {}", args.conf_file.display());
    info!(
        "Observer {} ({}) at {:.4}, {:.4}, {} m",
        config.observer.name,
        config.observer.cospar,
        config.observer.latitude,
        config.observer.longitude,
        config.observer.elevation
    );
    info!("Storing images in {}", session_dir.display());
    if args.live {
        warn!("Live preview is not available, capturing without it");
    }

    let plan = if args.test {
        info!("Test mode, starting capture immediately");
        CapturePlan::test_run(now)
    } else {
        TwilightWindowCalculator::new(&config.observer, config.control.twilight).plan(now)?
    };
    info!("Capture from {} until {}", plan.start, plan.end);

    let (abort, aborter) = AbortSignal::new();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping acquisition");
            aborter.abort();
        }
    });

    warn!(
        "No camera bindings are built in, using a simulated {} camera {}",
        config.camera.camera_type(),
        config.camera.device_id()
    );
    let driver = DriverAdapter::simulated(&config.camera);

    let controller = CaptureSessionController::new(config.clone(), session_dir);
    controller.arm()?;
    let report = controller.run(plan, driver, abort).await?.map(
        |report| {
            info!("Acquisition finished");
            report
        },
        |report| {
            warn!("Acquisition aborted");
            report
        },
    );

    info!(
        "{} stacks written from {} frames",
        report.stacks_written, report.frames_captured
    );
    Ok(())
}
