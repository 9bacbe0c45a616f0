//! Dubbing middleware HTTP client.
//! `POST /dub {"text", "char_name"}` streams back raw audio (AAC unless the
//! response says otherwise). `POST /info` answers `{"status", "data"}`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{SynthesisError, SynthesizedAudio, Synthesizer};
use crate::audio::AudioFormat;

#[derive(Serialize)]
struct DubRequest<'a> {
    text: &'a str,
    char_name: &'a str,
}

/// `{"status": bool, "data": ...}` envelope used by the JSON endpoints.
#[derive(Deserialize)]
struct Envelope {
    status: bool,
    #[serde(default)]
    data: serde_json::Value,
}

/// Client for the middleware server fronting the TTS models.
pub struct MiddlewareClient {
    http: reqwest::Client,
    base_url: String,
    max_audio_bytes: usize,
}

impl MiddlewareClient {
    pub fn new(base_url: &str, timeout: Duration, max_audio_bytes: usize) -> Result<Self, SynthesisError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| SynthesisError::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_audio_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Query server info (loaded models, muted characters).
    pub async fn info(&self) -> Result<serde_json::Value, SynthesisError> {
        let resp = self
            .http
            .post(format!("{}/info", self.base_url))
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(resp).await);
        }
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| SynthesisError::Api(format!("bad info response: {e}")))?;
        if envelope.status {
            Ok(envelope.data)
        } else {
            Err(SynthesisError::Api(envelope.data.to_string()))
        }
    }

    /// Send the dub request; a timed-out attempt is retried once.
    async fn send_with_retry(&self, body: &DubRequest<'_>) -> Result<reqwest::Response, SynthesisError> {
        let mut timeout_retried = false;
        loop {
            let result = self
                .http
                .post(format!("{}/dub", self.base_url))
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => return Err(status_error(resp).await),
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(SynthesisError::Timeout);
                    }
                    warn!("synthesis request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(map_reqwest(e)),
            }
        }
    }
}

#[async_trait]
impl Synthesizer for MiddlewareClient {
    async fn synthesize(&self, text: &str, character: &str) -> Result<SynthesizedAudio, SynthesisError> {
        let body = DubRequest {
            text,
            char_name: character,
        };
        let resp = self.send_with_retry(&body).await?;

        let format = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(AudioFormat::from_mime)
            .unwrap_or(AudioFormat::Aac);

        let mut data = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest)?;
            if data.len() + chunk.len() > self.max_audio_bytes {
                return Err(SynthesisError::TooLarge {
                    limit: self.max_audio_bytes,
                });
            }
            data.extend_from_slice(&chunk);
        }

        if data.is_empty() {
            return Err(SynthesisError::Empty);
        }
        debug!(bytes = data.len(), format = ?format, character, "synthesized audio received");
        Ok(SynthesizedAudio { data, format })
    }
}

fn map_reqwest(e: reqwest::Error) -> SynthesisError {
    if e.is_timeout() {
        SynthesisError::Timeout
    } else {
        SynthesisError::Http(e.to_string())
    }
}

async fn status_error(resp: reqwest::Response) -> SynthesisError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    SynthesisError::Status {
        status,
        body: body.chars().take(200).collect(),
    }
}
