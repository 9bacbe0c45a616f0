//! Playback controller.
//! Manages: audio asset → decoder → leading-silence trim → output sink.
//! Playback blocks the caller until the clip has been handed to the device
//! and drained; the daemon runs it on the blocking pool.

pub mod decode;
pub mod output;
pub mod silence;

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use silence::SilenceTrim;

/// Container/codec tag for in-memory audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Aac,
    Mp3,
    Wav,
}

impl AudioFormat {
    /// File extension used as a probe hint.
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Aac => "aac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    /// Map an HTTP `Content-Type` to a format, if recognized.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence {
            "audio/aac" | "audio/x-aac" | "audio/aacp" | "audio/mp4" => Some(AudioFormat::Aac),
            "audio/mpeg" | "audio/mp3" => Some(AudioFormat::Mp3),
            "audio/wav" | "audio/wave" | "audio/x-wav" => Some(AudioFormat::Wav),
            _ => None,
        }
    }
}

/// What to play: a cached asset on disk or freshly synthesized bytes.
#[derive(Debug, Clone)]
pub enum AudioSource {
    File(PathBuf),
    Bytes { data: Vec<u8>, format: AudioFormat },
}

impl AudioSource {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            AudioSource::File(path) => path.display().to_string(),
            AudioSource::Bytes { data, format } => {
                format!("<{} bytes {}>", data.len(), format.extension())
            }
        }
    }
}

/// Decoded PCM, interleaved f32 in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl Clip {
    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("playback task aborted: {0}")]
    Aborted(String),
}

/// Turns an audio source into PCM (external codec adapter).
pub trait ClipDecoder: Send + Sync {
    fn decode(&self, source: AudioSource) -> Result<Clip, PlaybackError>;
}

/// Plays PCM to an output device and returns once it finished.
pub trait AudioSink: Send + Sync {
    fn play(&self, clip: &Clip) -> Result<(), PlaybackError>;
}

/// Anything the matching engine can hand an audio source to.
pub trait Player: Send + Sync {
    fn play(&self, source: AudioSource) -> Result<(), PlaybackError>;
}

/// Decoder + silence trim + sink.
pub struct PlaybackController<D, S> {
    decoder: D,
    sink: S,
    trim: SilenceTrim,
}

impl<D: ClipDecoder, S: AudioSink> PlaybackController<D, S> {
    pub fn new(decoder: D, sink: S, trim: SilenceTrim) -> Self {
        Self {
            decoder,
            sink,
            trim,
        }
    }
}

impl<D: ClipDecoder, S: AudioSink> Player for PlaybackController<D, S> {
    fn play(&self, source: AudioSource) -> Result<(), PlaybackError> {
        let label = source.describe();
        let clip = self.decoder.decode(source)?;
        let before = clip.frames();
        let clip = silence::trim_leading_silence(clip, &self.trim);
        debug!(
            source = %label,
            trimmed_frames = before - clip.frames(),
            duration_ms = clip.duration().as_millis() as u64,
            "clip ready"
        );
        if clip.is_empty() {
            return Ok(());
        }
        self.sink.play(&clip)
    }
}

/// Player for the system default output device.
pub fn default_player() -> Result<PlaybackController<decode::SymphoniaDecoder, output::DeviceSink>, PlaybackError> {
    Ok(PlaybackController::new(
        decode::SymphoniaDecoder,
        output::DeviceSink::new()?,
        SilenceTrim::default(),
    ))
}
