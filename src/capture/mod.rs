//! Frame capture boundary.
//! A frame is a full-screen PNG plus the region of interest (where subtitles
//! render) that OCR should look at.

pub mod screen;

use serde::Serialize;

pub use screen::{CaptureBackend, ScreenCapture};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no screen capture tool available (need grim, maim, or scrot)")]
    NoBackendAvailable,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("capture IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid screenshot: {0}")]
    InvalidImage(String),
}

/// Pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Which part of the screen subtitles are read from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureRegion {
    Full,
    /// Bottom band covering this fraction of the screen height.
    BottomFraction(f64),
}

impl CaptureRegion {
    pub fn roi(&self, width: u32, height: u32) -> Roi {
        match *self {
            CaptureRegion::Full => Roi {
                x: 0,
                y: 0,
                width,
                height,
            },
            CaptureRegion::BottomFraction(fraction) => {
                let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 1.0 };
                let band = ((height as f64 * fraction).round() as u32).clamp(1, height.max(1));
                Roi {
                    x: 0,
                    y: height.saturating_sub(band),
                    width,
                    height: band.min(height),
                }
            }
        }
    }
}

/// One captured screen.
#[derive(Debug, Clone)]
pub struct Frame {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub roi: Roi,
}

/// Source of frames for the daemon loop. Blocking.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<Frame, CaptureError>;
}

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Width and height from a PNG's IHDR chunk.
pub fn png_dimensions(png: &[u8]) -> Result<(u32, u32), CaptureError> {
    if png.len() < 24 || &png[..8] != PNG_SIGNATURE || &png[12..16] != b"IHDR" {
        return Err(CaptureError::InvalidImage("not a PNG".into()));
    }
    let width = u32::from_be_bytes([png[16], png[17], png[18], png[19]]);
    let height = u32::from_be_bytes([png[20], png[21], png[22], png[23]]);
    if width == 0 || height == 0 {
        return Err(CaptureError::InvalidImage("zero-sized PNG".into()));
    }
    Ok((width, height))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// PNG signature + IHDR header only; enough for dimension parsing.
    pub(crate) fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut out = PNG_SIGNATURE.to_vec();
        out.extend_from_slice(&13u32.to_be_bytes());
        out.extend_from_slice(b"IHDR");
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&[8, 6, 0, 0, 0]);
        out
    }

    #[test]
    fn test_png_dimensions() {
        assert_eq!(png_dimensions(&png_header(1920, 1080)).unwrap(), (1920, 1080));
        assert!(matches!(
            png_dimensions(b"GIF89a not a png at all......"),
            Err(CaptureError::InvalidImage(_))
        ));
        assert!(png_dimensions(&png_header(0, 10)).is_err());
    }

    #[test]
    fn test_bottom_third_roi() {
        let roi = CaptureRegion::BottomFraction(1.0 / 3.0).roi(1920, 1080);
        assert_eq!(
            roi,
            Roi {
                x: 0,
                y: 720,
                width: 1920,
                height: 360
            }
        );
    }

    #[test]
    fn test_roi_clamps_fraction() {
        assert_eq!(CaptureRegion::BottomFraction(2.0).roi(100, 50).y, 0);
        let tiny = CaptureRegion::BottomFraction(0.0).roi(100, 50);
        assert_eq!((tiny.y, tiny.height), (49, 1));
        assert_eq!(CaptureRegion::Full.roi(100, 50).height, 50);
    }
}
