use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::alerts::AlertCoordinator;
use crate::capture::{CameraStatus, FrameSource};
use crate::config::{CameraConfig, PipelineConfig};
use crate::detect::{Detector, ThreatPolicy};
use crate::publish::Publisher;
use crate::source::CameraSource;

/// The running system: one capture task and one detection stage per
/// camera, sharing a single alert coordinator.
pub struct Pipeline {
    sources: Vec<Arc<FrameSource>>,
    stages: Vec<JoinHandle<()>>,
    coordinator: Arc<AlertCoordinator>,
    stop: watch::Sender<bool>,
    stop_timeout: Duration,
}

struct StageContext {
    camera: CameraConfig,
    source: Arc<FrameSource>,
    detector: Arc<dyn Detector>,
    policy: ThreatPolicy,
    coordinator: Arc<AlertCoordinator>,
    publisher: Arc<dyn Publisher>,
    poll_interval: Duration,
    publish_interval: Duration,
}

impl Pipeline {
    pub async fn start(
        cameras: Vec<(CameraConfig, Box<dyn CameraSource>)>,
        config: PipelineConfig,
        policy: ThreatPolicy,
        detector: Arc<dyn Detector>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let coordinator = Arc::new(AlertCoordinator::new(config.cooldown));
        {
            let publisher = publisher.clone();
            coordinator
                .register_observer(move |alert| {
                    publisher.publish_alert(alert);
                    Ok(())
                })
                .await;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sources = Vec::with_capacity(cameras.len());
        let mut stages = Vec::with_capacity(cameras.len());

        for (camera, transport) in cameras {
            let source = Arc::new(FrameSource::spawn(camera.clone(), transport, &config));
            let context = StageContext {
                camera,
                source: source.clone(),
                detector: detector.clone(),
                policy: policy.clone(),
                coordinator: coordinator.clone(),
                publisher: publisher.clone(),
                poll_interval: config.poll_interval,
                publish_interval: config.publish_interval,
            };
            stages.push(tokio::spawn(detect_loop(context, stop_rx.clone())));
            sources.push(source);
        }

        Self {
            sources,
            stages,
            coordinator,
            stop: stop_tx,
            stop_timeout: config.stop_timeout,
        }
    }

    /// Snapshot of every camera, in configuration order. This is what new
    /// subscribers receive at connect time.
    pub async fn camera_statuses(&self) -> Vec<CameraStatus> {
        let mut statuses = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            statuses.push(source.status().await);
        }
        statuses
    }

    pub fn coordinator(&self) -> &Arc<AlertCoordinator> {
        &self.coordinator
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for stage in self.stages {
            if timeout(self.stop_timeout, stage).await.is_err() {
                warn!("detection stage did not stop in time");
            }
        }
        for source in &self.sources {
            source.stop().await;
        }
    }
}

async fn detect_loop(ctx: StageContext, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }

        let Some(frame) = ctx.source.frame().await else {
            tokio::select! {
                _ = stop.changed() => {}
                _ = sleep(ctx.poll_interval) => {}
            }
            continue;
        };

        match ctx.detector.detect(&frame) {
            Ok(mut output) => {
                ctx.policy.classify(&mut output.detections);
                let threats = output.detections.iter().filter(|d| d.is_threat).count();

                for detection in output.detections.iter().filter(|d| d.is_threat) {
                    ctx.coordinator
                        .check_and_alert(
                            &ctx.camera.id,
                            &ctx.camera.name,
                            &detection.label,
                            detection.confidence,
                        )
                        .await;
                }

                ctx.publisher.publish_frame(
                    &ctx.camera.id,
                    &output.annotated,
                    output.detections.len(),
                    threats,
                );
            }
            Err(err) => {
                warn!(camera = %ctx.camera.id, error = %err, "detection failed, skipping frame");
            }
        }

        // Caps the publish rate; capture keeps its own pace.
        tokio::select! {
            _ = stop.changed() => {}
            _ = sleep(ctx.publish_interval) => {}
        }
    }

    debug!(camera = %ctx.camera.id, "detection stage stopped");
}
