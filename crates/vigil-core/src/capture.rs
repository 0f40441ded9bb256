use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, PipelineConfig};
use crate::source::{CameraSource, Frame};

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub id: String,
    pub name: String,
    pub connected: bool,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Single-slot frame buffer. The newest write always wins; frames that were
/// never read are dropped, which is how backpressure is relieved here.
#[derive(Default)]
struct FrameSlot {
    frame: Option<Frame>,
    last_capture: Option<Instant>,
    fps: f64,
}

impl FrameSlot {
    fn record(&mut self, frame: Frame, now: Instant) {
        if let Some(prev) = self.last_capture {
            let delta = now.duration_since(prev).as_secs_f64();
            if delta > 0.0 {
                self.fps = 1.0 / delta;
            }
        }
        self.last_capture = Some(now);
        self.frame = Some(frame);
    }

    // The first frame after a (re)connect has no meaningful delta.
    fn clear_rate(&mut self) {
        self.last_capture = None;
        self.fps = 0.0;
    }
}

struct Shared {
    slot: Mutex<FrameSlot>,
    connected: AtomicBool,
}

/// Owns one camera's capture task: connection lifecycle, exponential
/// reconnect backoff and the latest-frame slot.
pub struct FrameSource {
    camera: CameraConfig,
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl FrameSource {
    pub fn spawn(camera: CameraConfig, source: Box<dyn CameraSource>, config: &PipelineConfig) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(FrameSlot::default()),
            connected: AtomicBool::new(false),
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(capture_loop(
            camera.clone(),
            source,
            shared.clone(),
            stop_rx,
            config.reconnect_initial,
            config.reconnect_max,
        ));

        Self {
            camera,
            shared,
            stop: stop_tx,
            handle: Mutex::new(Some(handle)),
            stop_timeout: config.stop_timeout,
        }
    }

    /// Copy of the latest frame, or `None` when nothing was captured yet.
    /// Never waits for a frame to arrive.
    pub async fn frame(&self) -> Option<Frame> {
        self.shared.slot.lock().await.frame.clone()
    }

    pub async fn status(&self) -> CameraStatus {
        let fps = self.shared.slot.lock().await.fps;
        CameraStatus {
            id: self.camera.id.clone(),
            name: self.camera.name.clone(),
            connected: self.shared.connected.load(Ordering::Relaxed),
            fps,
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// Request shutdown and wait a bounded time for the capture task to end.
    /// Returns false if the task outlived the wait.
    pub async fn stop(&self) -> bool {
        let _ = self.stop.send(true);
        let Some(handle) = self.handle.lock().await.take() else {
            return true;
        };
        match timeout(self.stop_timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(camera = %self.camera.id, "capture task did not stop in time");
                false
            }
        }
    }
}

async fn capture_loop(
    camera: CameraConfig,
    mut source: Box<dyn CameraSource>,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
) {
    let mut state = ConnectionState::Disconnected;
    let mut delay = reconnect_initial;

    loop {
        if *stop.borrow() {
            break;
        }

        match state {
            ConnectionState::Disconnected => state = ConnectionState::Connecting,
            ConnectionState::Connecting => match source.connect().await {
                Ok(()) => {
                    delay = reconnect_initial;
                    shared.connected.store(true, Ordering::Relaxed);
                    state = ConnectionState::Connected;
                    info!(camera = %camera.id, source = %camera.source, "camera connected");
                }
                Err(err) => {
                    warn!(
                        camera = %camera.id,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "connect failed"
                    );
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = sleep(delay) => {}
                    }
                    delay = (delay * 2).min(reconnect_max);
                }
            },
            ConnectionState::Connected => {
                let result = tokio::select! {
                    _ = stop.changed() => continue,
                    result = source.read_frame() => result,
                };
                match result {
                    Ok(frame) => {
                        shared.slot.lock().await.record(frame, Instant::now());
                    }
                    Err(err) => {
                        warn!(camera = %camera.id, error = %err, "frame read failed, reconnecting");
                        let _ = source.disconnect().await;
                        shared.connected.store(false, Ordering::Relaxed);
                        shared.slot.lock().await.clear_rate();
                        state = ConnectionState::Disconnected;
                        delay = reconnect_initial;
                    }
                }
            }
        }
    }

    let _ = source.disconnect().await;
    shared.connected.store(false, Ordering::Relaxed);
    debug!(camera = %camera.id, "capture stopped");
}
