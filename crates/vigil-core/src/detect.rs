use std::path::Path;

use chrono::{DateTime, Utc};
use libloading::Library;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::Frame;

pub const PLUGIN_SYMBOL: &[u8] = b"vigil_detect";
pub const PLUGIN_LABEL_BYTES: usize = 32;

/// Fixed capacity handed to the plugin per call. A frame with more boxes
/// than this is truncated by the backend.
const MAX_PLUGIN_DETECTIONS: usize = 64;

/// Pixel-coordinate box with x1 <= x2, y1 <= y2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub is_threat: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DetectorOutput {
    pub annotated: Frame,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("plugin error: {0}")]
    Plugin(String),
}

/// The external detection capability. One call per frame, synchronous,
/// no shared state across cameras.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<DetectorOutput, DetectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatMatch {
    Substring,
    Exact,
}

fn default_threat_match() -> ThreatMatch {
    ThreatMatch::Substring
}

/// Which detection labels count as threats, and how labels are compared.
/// Both the class set and the matching rule are configuration, not code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatPolicy {
    pub classes: Vec<String>,
    #[serde(default = "default_threat_match")]
    pub matching: ThreatMatch,
}

impl ThreatPolicy {
    pub fn new(classes: Vec<String>, matching: ThreatMatch) -> Self {
        Self { classes, matching }
    }

    pub fn is_threat(&self, label: &str) -> bool {
        let label = label.to_ascii_lowercase();
        match self.matching {
            ThreatMatch::Substring => self
                .classes
                .iter()
                .any(|class| label.contains(&class.to_ascii_lowercase())),
            ThreatMatch::Exact => self.classes.iter().any(|class| class.eq_ignore_ascii_case(&label)),
        }
    }

    pub fn classify(&self, detections: &mut [Detection]) {
        for detection in detections {
            detection.is_threat = self.is_threat(&detection.label);
        }
    }
}

impl Default for ThreatPolicy {
    fn default() -> Self {
        Self {
            classes: vec![
                "knife".to_string(),
                "scissors".to_string(),
                "fork".to_string(),
                "baseball bat".to_string(),
            ],
            matching: ThreatMatch::Substring,
        }
    }
}

/// Pass-through backend: no detections, frame unchanged. Used for pipeline
/// bring-up and in tests.
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&self, frame: &Frame) -> Result<DetectorOutput, DetectError> {
        Ok(DetectorOutput {
            annotated: frame.clone(),
            detections: Vec::new(),
        })
    }
}

/// One detection as reported over the plugin ABI. Label is NUL-terminated
/// UTF-8 within the fixed buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginDetection {
    pub label: [u8; PLUGIN_LABEL_BYTES],
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PluginDetection {
    fn empty() -> Self {
        Self {
            label: [0; PLUGIN_LABEL_BYTES],
            confidence: 0.0,
            x1: 0.0,
            y1: 0.0,
            x2: 0.0,
            y2: 0.0,
        }
    }
}

type PluginDetectFn = unsafe extern "C" fn(
    data: *const u8,
    len: usize,
    width: u32,
    height: u32,
    out: *mut PluginDetection,
    cap: usize,
) -> i32;

/// Bridges an external inference runtime compiled as a shared object. The
/// plugin exposes `vigil_detect` and returns the number of detections
/// written, or a negative value on backend failure.
///
/// The plugin reports boxes only; the frame passes through unannotated.
pub struct PluginDetector {
    detect: PluginDetectFn,
    confidence_threshold: f32,
    _lib: Library,
}

impl PluginDetector {
    pub fn load(path: &Path, confidence_threshold: f32) -> Result<Self, DetectError> {
        let lib = unsafe { Library::new(path) }.map_err(|err| {
            DetectError::Plugin(format!("failed to load {}: {err}", path.display()))
        })?;

        let detect = unsafe {
            let symbol: libloading::Symbol<'_, PluginDetectFn> =
                lib.get(PLUGIN_SYMBOL).map_err(|err| {
                    DetectError::Plugin(format!("missing vigil_detect in {}: {err}", path.display()))
                })?;
            *symbol
        };

        Ok(Self {
            detect,
            confidence_threshold,
            _lib: lib,
        })
    }
}

impl Detector for PluginDetector {
    fn detect(&self, frame: &Frame) -> Result<DetectorOutput, DetectError> {
        let mut raw = vec![PluginDetection::empty(); MAX_PLUGIN_DETECTIONS];

        let written = unsafe {
            (self.detect)(
                frame.data.as_ptr(),
                frame.data.len(),
                frame.width,
                frame.height,
                raw.as_mut_ptr(),
                raw.len(),
            )
        };

        if written < 0 {
            return Err(DetectError::Plugin(format!("backend returned {written}")));
        }

        let count = (written as usize).min(raw.len());
        let mut detections = Vec::with_capacity(count);
        for entry in &raw[..count] {
            let end = entry
                .label
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(PLUGIN_LABEL_BYTES);
            let label = String::from_utf8_lossy(&entry.label[..end]).into_owned();
            if label.is_empty() || entry.confidence < self.confidence_threshold {
                continue;
            }
            detections.push(Detection {
                label,
                confidence: entry.confidence.clamp(0.0, 1.0),
                bbox: BoundingBox {
                    x1: entry.x1.min(entry.x2),
                    y1: entry.y1.min(entry.y2),
                    x2: entry.x1.max(entry.x2),
                    y2: entry.y1.max(entry.y2),
                },
                is_threat: false,
                captured_at: frame.captured_at,
            });
        }

        Ok(DetectorOutput {
            annotated: frame.clone(),
            detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str) -> Detection {
        Detection {
            label: label.to_string(),
            confidence: 0.9,
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 10.0,
                y2: 10.0,
            },
            is_threat: false,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn substring_matching_is_case_insensitive() {
        let policy = ThreatPolicy::new(vec!["knife".to_string()], ThreatMatch::Substring);
        assert!(policy.is_threat("Knife"));
        assert!(policy.is_threat("butter knife"));
        assert!(!policy.is_threat("fork"));
    }

    #[test]
    fn exact_matching_rejects_partial_labels() {
        let policy = ThreatPolicy::new(vec!["knife".to_string()], ThreatMatch::Exact);
        assert!(policy.is_threat("KNIFE"));
        assert!(!policy.is_threat("butter knife"));
    }

    #[test]
    fn classify_flags_only_configured_classes() {
        let policy = ThreatPolicy::default();
        let mut detections = vec![detection("knife"), detection("person"), detection("scissors")];
        policy.classify(&mut detections);
        let flags: Vec<bool> = detections.iter().map(|d| d.is_threat).collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[test]
    fn noop_detector_passes_frame_through() {
        let frame = Frame {
            width: 2,
            height: 2,
            data: vec![1, 2, 3],
            captured_at: Utc::now(),
        };
        let output = NoopDetector.detect(&frame).expect("detect");
        assert_eq!(output.annotated.data, frame.data);
        assert!(output.detections.is_empty());
    }
}
