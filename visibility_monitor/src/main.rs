use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use visibility_cam::config::{AppConfig, ConfigStore};
use visibility_cam::core_modules::display::DisplayNotice;
use visibility_cam::core_modules::recorder::EncoderFactory;
use visibility_cam::parallel_pipeline::{MonitorDeps, ParallelPipeline, open_sink};
use visibility_cam::weather::WeatherService;

mod capture;
mod recording;

const DEFAULT_FILTER: &str = "visibility_cam=info,visibility_monitor=info";

/// Watches IP camera streams for degraded visibility and records low-visibility events.
#[derive(Debug, Parser)]
#[command(name = "visibility_monitor", version)]
struct Cli {
    /// Configuration document (JSON).
    #[arg(long, env = "VISIBILITY_CAM_CONFIG", default_value = "data/camera_config.json")]
    config: PathBuf,

    /// Also write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write a starter configuration to `--config` and exit.
    #[arg(long)]
    write_default_config: bool,

    /// Only run these cameras (repeatable).
    #[arg(long = "camera", value_name = "ID")]
    cameras: Vec<String>,

    /// Score and log, but never record.
    #[arg(long)]
    no_recording: bool,

    /// Seconds between status lines.
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(fmt::layer().with_ansi(!cfg!(windows)))
        .try_init()?;
    Ok(())
}

fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists; not overwriting", path.display());
    }
    let store = ConfigStore::new(AppConfig::example())?;
    store.save_to(path)?;
    info!(path = %path.display(), "starter configuration written");
    Ok(())
}

/// Loads the document and applies the command-line overrides.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let store = ConfigStore::load(cli.config.clone())
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let mut config = (*store.snapshot()).clone();

    if !cli.cameras.is_empty() {
        let unknown: Vec<&str> =
            cli.cameras.iter().filter(|id| !config.cameras.contains_key(*id)).map(String::as_str).collect();
        if !unknown.is_empty() {
            bail!("unknown camera id(s): {}", unknown.join(", "));
        }
        config.cameras.retain(|id, _| cli.cameras.contains(id));
    }
    if cli.no_recording {
        config.recording.enabled = false;
    }
    if config.cameras.is_empty() {
        bail!("no cameras configured in {}", cli.config.display());
    }
    Ok(config)
}

/// One refresh loop per distinct weather location.
fn spawn_weather(config: &AppConfig) -> Vec<JoinHandle<()>> {
    let service = Arc::new(WeatherService::from_settings(&config.weather));
    let locations: BTreeSet<String> = config.cameras.values().filter_map(|c| c.weather_key.clone()).collect();
    let minutes = config.weather.refresh_interval_minutes;
    locations
        .into_iter()
        .map(|location| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let every = service.set_refresh_interval(&location, minutes);
                let mut tick = tokio::time::interval(every);
                loop {
                    tick.tick().await;
                    let report = service.get_weather(&location).await;
                    info!(
                        location = %report.location,
                        temperature_c = report.temperature_c,
                        humidity_pct = report.humidity_pct,
                        visibility_km = report.visibility_km,
                        condition = %report.condition,
                        synthetic = report.synthetic,
                        "weather"
                    );
                }
            })
        })
        .collect()
}

fn spawn_notice_logger(mut notices: tokio::sync::broadcast::Receiver<DisplayNotice>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => warn!(camera = %notice.camera_id, kind = ?notice.kind, "{}", notice.message),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notices skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_statuses(monitor: &ParallelPipeline) {
    for (camera_id, status) in monitor.statuses() {
        info!(
            camera = %camera_id,
            connected = status.connected,
            mode = ?status.mode,
            score = status.last_reading.as_ref().map(|r| r.score),
            frames = status.frames_processed,
            invalid = status.invalid_frames,
            reconnects = status.reconnect_sequences,
            avg_ms = status.avg_processing_ms,
            recording = status.recording,
            "status"
        );
    }
}

async fn run(config: AppConfig, status_every: Duration) -> Result<()> {
    let sink = open_sink(&config.event_log).context("opening event log")?;
    let encoder: Option<Arc<dyn EncoderFactory>> =
        config.recording.enabled.then(|| Arc::new(recording::OpenCvEncoderFactory) as Arc<dyn EncoderFactory>);
    let deps = MonitorDeps {
        backend: Arc::new(capture::OpenCvBackend),
        encoder,
        extractor: Some(Arc::new(recording::OpenCvClipExtractor)),
    };
    let monitor = ParallelPipeline::start(&config, deps, sink)?;
    let weather = spawn_weather(&config);
    let notices = spawn_notice_logger(monitor.display().subscribe_notices());

    let mut status_tick = tokio::time::interval(status_every);
    status_tick.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!("cannot listen for ctrl-c: {e}");
                }
                info!("shutdown signal received");
                break;
            }
            _ = status_tick.tick() => log_statuses(&monitor),
        }
    }

    weather.iter().for_each(JoinHandle::abort);
    notices.abort();
    for summary in monitor.shutdown().await {
        info!(
            camera = %summary.status.camera_id,
            frames = summary.status.frames_processed,
            recordings = summary.recordings.len(),
            "camera stopped"
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    if cli.write_default_config {
        return write_default_config(&cli.config);
    }

    let config = load_config(&cli)?;
    let workers = num_cpus::get().max(config.cameras.len() + 1);
    info!(cameras = config.cameras.len(), workers, "starting visibility monitor");

    let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(workers).enable_all().build()?;
    runtime.block_on(run(config, Duration::from_secs(cli.status_interval_secs.max(1))))
}
