//! Screenshot-tool frame source.
//! Shells out to grim (Wayland), maim or scrot (X11) for a full-screen PNG.
//! The backend is probed once at construction.

use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{png_dimensions, CaptureError, CaptureRegion, Frame, FrameSource};

/// Screen capture tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    Grim,
    Maim,
    Scrot,
}

impl CaptureBackend {
    fn command(self) -> &'static str {
        match self {
            CaptureBackend::Grim => "grim",
            CaptureBackend::Maim => "maim",
            CaptureBackend::Scrot => "scrot",
        }
    }

    fn args(self, path: &str) -> Vec<String> {
        match self {
            // -o: overwrite the (already created) temp file
            CaptureBackend::Scrot => vec!["-z".into(), "-o".into(), path.into()],
            CaptureBackend::Maim | CaptureBackend::Grim => vec![path.into()],
        }
    }
}

/// Find the first available backend, or check the requested one.
pub fn detect_backend(preferred: Option<CaptureBackend>) -> Option<CaptureBackend> {
    let order: &[CaptureBackend] = match preferred {
        Some(ref backend) => std::slice::from_ref(backend),
        None => &[CaptureBackend::Grim, CaptureBackend::Maim, CaptureBackend::Scrot],
    };
    for &backend in order {
        if probe_command(backend.command()) {
            info!(backend = backend.command(), "screen capture backend detected");
            return Some(backend);
        }
    }
    warn!("no screen capture backend found");
    None
}

/// Capture the full screen and return PNG bytes.
pub fn capture_full_screen(backend: CaptureBackend) -> Result<Vec<u8>, CaptureError> {
    let tmp = tempfile::Builder::new()
        .prefix("dubplay-capture-")
        .suffix(".png")
        .tempfile()?
        .into_temp_path();
    let path = tmp.to_string_lossy().into_owned();

    let output = Command::new(backend.command())
        .args(backend.args(&path))
        .output()
        .map_err(|e| CaptureError::CaptureFailed(format!("failed to run {}: {e}", backend.command())))?;

    if !output.status.success() {
        return Err(CaptureError::CaptureFailed(format!(
            "{} failed: {}",
            backend.command(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let bytes = std::fs::read(&tmp)?;
    debug!(size = bytes.len(), "screen captured");
    Ok(bytes)
}

/// Frame source backed by a screenshot tool.
pub struct ScreenCapture {
    backend: Option<CaptureBackend>,
    region: CaptureRegion,
}

impl ScreenCapture {
    pub fn new(preferred: Option<CaptureBackend>, region: CaptureRegion) -> Self {
        Self {
            backend: detect_backend(preferred),
            region,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }
}

impl FrameSource for ScreenCapture {
    fn capture(&self) -> Result<Frame, CaptureError> {
        let backend = self.backend.ok_or(CaptureError::NoBackendAvailable)?;
        let png = capture_full_screen(backend)?;
        frame_from_png(png, self.region)
    }
}

fn frame_from_png(png: Vec<u8>, region: CaptureRegion) -> Result<Frame, CaptureError> {
    let (width, height) = png_dimensions(&png)?;
    Ok(Frame {
        roi: region.roi(width, height),
        png,
        width,
        height,
    })
}

fn probe_command(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
