//! Realtime synthesis boundary.
//! Used only for subtitles with no cached corpus line; a failure leaves the
//! line unplayed so a later stable tick can retry it.

pub mod middleware;

use async_trait::async_trait;

use crate::audio::AudioFormat;

pub use middleware::MiddlewareClient;

/// Raw audio returned by the synthesis service.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Http(String),
    #[error("synthesis service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("synthesis service error: {0}")]
    Api(String),
    #[error("synthesized audio exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("synthesized audio is empty")]
    Empty,
    #[error("synthesis timeout")]
    Timeout,
}

/// Text-to-speech service for one character's voice.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, character: &str) -> Result<SynthesizedAudio, SynthesisError>;
}
