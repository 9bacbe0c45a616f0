//! OCR boundary.
//! An engine turns a frame region into ordered text fragments; the daemon
//! only consumes their concatenation.

pub mod python_engine;

use serde::{Deserialize, Serialize};

use crate::capture::{Frame, Roi};

pub use python_engine::PythonOcrEngine;

/// OCR request for one captured frame.
#[derive(Debug, Clone)]
pub struct OcrRequest {
    pub request_id: String,
    /// Encoded image (PNG), raw bytes.
    pub image: Vec<u8>,
    pub roi: Roi,
}

impl OcrRequest {
    pub fn from_frame(frame: Frame) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            image: frame.png,
            roi: frame.roi,
        }
    }
}

/// One recognized text box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrFragment {
    pub text: String,
    pub confidence: f32,
    /// x, y, w, h in frame pixels.
    pub bbox: (u32, u32, u32, u32),
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR worker not running")]
    WorkerNotRunning,
    #[error("OCR processing failed: {0}")]
    ProcessingFailed(String),
    #[error("OCR task aborted: {0}")]
    Aborted(String),
    #[error("OCR worker did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Text recognition engine. Blocking.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, request: OcrRequest) -> Result<Vec<OcrFragment>, OcrError>;

    fn is_available(&self) -> bool;

    /// Release engine resources; default is a no-op.
    fn shutdown(&self) {}
}

/// Join fragment texts with single spaces, in engine order.
pub fn join_fragments(fragments: &[OcrFragment]) -> String {
    fragments
        .iter()
        .map(|f| f.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
