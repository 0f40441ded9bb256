use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_core::{
    Alert, CameraConfig, CameraSource, Detector, Frame, NoopDetector, NullPublisher, Pipeline,
    PipelineConfig, PluginDetector, Publisher, TcpCameraSource, ThreatMatch, ThreatPolicy,
};

mod exporter;
mod viewer;

#[derive(Debug, Parser)]
#[command(name = "vigild")]
#[command(about = "Multi-camera threat detection pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "./vigil.json")]
    config: PathBuf,

    /// Shared object exposing the `vigil_detect` inference entry point.
    /// Without it the pipeline runs pass-through detection.
    #[arg(long)]
    detector_plugin: Option<PathBuf>,

    #[arg(long)]
    cooldown_secs: Option<f64>,

    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = 66)]
    publish_interval_ms: u64,

    #[arg(long, default_value_t = 30)]
    reconnect_max_secs: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse the configuration and print the resolved setup.
    Check,
    /// Run the pipeline headless with an alert audit log.
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: AlertFormat,
        #[arg(long, default_value = "./data/alerts")]
        alert_dir: String,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
    /// Run the pipeline with a live terminal status view.
    View {
        #[arg(long, default_value_t = 20)]
        alert_rows: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlertFormat {
    Human,
    Ndjson,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    cameras: Vec<CameraConfig>,
    #[serde(default = "default_confidence")]
    confidence_threshold: f32,
    #[serde(default = "default_threat_classes")]
    threat_classes: Vec<String>,
    #[serde(default = "default_threat_match")]
    threat_match: ThreatMatch,
    #[serde(default = "default_cooldown_seconds")]
    cooldown_seconds: f64,
}

fn default_confidence() -> f32 {
    0.5
}

fn default_threat_classes() -> Vec<String> {
    ThreatPolicy::default().classes
}

fn default_threat_match() -> ThreatMatch {
    ThreatMatch::Substring
}

fn default_cooldown_seconds() -> f64 {
    10.0
}

fn load_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    anyhow::ensure!(!config.cameras.is_empty(), "config declares no cameras");
    Ok(config)
}

fn build_detector(plugin: Option<&Path>, confidence_threshold: f32) -> Result<Arc<dyn Detector>> {
    match plugin {
        Some(path) => {
            let detector = PluginDetector::load(path, confidence_threshold)
                .with_context(|| format!("loading detector plugin {}", path.display()))?;
            info!(plugin = %path.display(), "detector plugin loaded");
            Ok(Arc::new(detector))
        }
        None => {
            warn!("no detector plugin configured, running pass-through detection");
            Ok(Arc::new(NoopDetector))
        }
    }
}

fn build_cameras(
    file: &FileConfig,
    config: &PipelineConfig,
) -> Vec<(CameraConfig, Box<dyn CameraSource>)> {
    file.cameras
        .iter()
        .map(|camera| {
            let transport: Box<dyn CameraSource> = Box::new(TcpCameraSource::new(
                camera.source.clone(),
                config.connect_timeout,
                config.read_timeout,
            ));
            (camera.clone(), transport)
        })
        .collect()
}

struct ConsolePublisher {
    format: AlertFormat,
}

impl Publisher for ConsolePublisher {
    fn publish_frame(&self, camera_id: &str, _frame: &Frame, detections: usize, threats: usize) {
        tracing::trace!(camera = %camera_id, detections, threats, "frame published");
    }

    fn publish_alert(&self, alert: &Alert) {
        match self.format {
            AlertFormat::Ndjson => {
                if let Ok(line) = serde_json::to_string(alert) {
                    println!("{line}");
                }
            }
            AlertFormat::Human => println!(
                "ALERT #{} {} ({}) {} confidence={:.2}",
                alert.id, alert.camera_name, alert.camera_id, alert.threat_class, alert.confidence
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let file = load_config(&cli.config)?;

    let config = PipelineConfig {
        cooldown: Duration::from_secs_f64(cli.cooldown_secs.unwrap_or(file.cooldown_seconds)),
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        publish_interval: Duration::from_millis(cli.publish_interval_ms),
        reconnect_max: Duration::from_secs(cli.reconnect_max_secs),
        ..PipelineConfig::default()
    };
    let policy = ThreatPolicy::new(file.threat_classes.clone(), file.threat_match);

    match cli.command {
        Command::Check => {
            let out = serde_json::json!({
                "cameras": file.cameras,
                "confidence_threshold": file.confidence_threshold,
                "threat_policy": policy,
                "cooldown_seconds": config.cooldown.as_secs_f64(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Run {
            format,
            alert_dir,
            retention_days,
        } => {
            let detector = build_detector(cli.detector_plugin.as_deref(), file.confidence_threshold)?;
            let publisher = Arc::new(ConsolePublisher { format });
            let pipeline = Pipeline::start(
                build_cameras(&file, &config),
                config,
                policy,
                detector,
                publisher,
            )
            .await;

            let (alert_tx, alert_rx) = mpsc::unbounded_channel();
            pipeline
                .coordinator()
                .register_observer(move |alert: &Alert| {
                    alert_tx
                        .send(alert.clone())
                        .map_err(|_| anyhow::anyhow!("alert audit channel closed"))
                })
                .await;
            let export = tokio::spawn(exporter::run_exporter(alert_rx, alert_dir, retention_days));

            info!(cameras = file.cameras.len(), "pipeline running");
            run_until_interrupted(&pipeline).await;

            pipeline.shutdown().await;
            export.await??;
        }
        Command::View { alert_rows } => {
            let detector = build_detector(cli.detector_plugin.as_deref(), file.confidence_threshold)?;
            let pipeline = Pipeline::start(
                build_cameras(&file, &config),
                config,
                policy,
                detector,
                Arc::new(NullPublisher),
            )
            .await;

            let view_result = viewer::run_viewer(&pipeline, alert_rows).await;
            pipeline.shutdown().await;
            view_result?;
        }
    }

    Ok(())
}

async fn run_until_interrupted(pipeline: &Pipeline) {
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    // The immediate first tick would just repeat startup logging.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = heartbeat.tick() => {
                for status in pipeline.camera_statuses().await {
                    info!(
                        camera = %status.id,
                        connected = status.connected,
                        fps = %format_args!("{:.1}", status.fps),
                        "camera status"
                    );
                }
                let active = pipeline.coordinator().active_alert_count().await;
                if active > 0 {
                    info!(unacknowledged = active, "alerts awaiting acknowledgment");
                }
            }
        }
    }
}
