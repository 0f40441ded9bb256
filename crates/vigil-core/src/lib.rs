pub mod alerts;
pub mod capture;
pub mod config;
pub mod detect;
pub mod pipeline;
pub mod publish;
pub mod source;

pub use alerts::{Alert, AlertCoordinator, MAX_RECENT_ALERTS};
pub use capture::{CameraStatus, FrameSource};
pub use config::{CameraConfig, PipelineConfig};
pub use detect::{
    BoundingBox, DetectError, Detection, Detector, DetectorOutput, NoopDetector, PluginDetector,
    ThreatMatch, ThreatPolicy,
};
pub use pipeline::Pipeline;
pub use publish::{NullPublisher, Publisher};
pub use source::{CameraSource, Frame, SourceError, TcpCameraSource};
