use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One camera as declared in configuration. Never mutated after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    /// Connection target, e.g. `tcp://10.0.0.12:7001`.
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum spacing between accepted alerts for one camera.
    pub cooldown: Duration,
    /// Wait between polls while a camera has no frame yet.
    pub poll_interval: Duration,
    /// Pacing of the detect/publish loop, independent of capture rate.
    pub publish_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            publish_interval: Duration::from_millis(66),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        }
    }
}
