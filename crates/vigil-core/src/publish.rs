use crate::alerts::Alert;
use crate::source::Frame;

/// Push boundary toward the presentation layer (dashboard, socket push,
/// notification sinks). Calls are fire-and-forget: the pipeline does not
/// await delivery, retry, or buffer for slow subscribers.
pub trait Publisher: Send + Sync {
    fn publish_frame(&self, camera_id: &str, frame: &Frame, detections: usize, threats: usize);
    fn publish_alert(&self, alert: &Alert);
}

/// Discards everything. Useful for bring-up and tests.
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish_frame(&self, _camera_id: &str, _frame: &Frame, _detections: usize, _threats: usize) {}

    fn publish_alert(&self, _alert: &Alert) {}
}
