//! Audio decoding via symphonia.
//! Handles the corpus assets (AAC/ADTS, MP3, M4A, WAV) and synthesized bytes.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use super::{AudioSource, Clip, ClipDecoder, PlaybackError};

/// Decoder backed by symphonia's default codec and format registries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl ClipDecoder for SymphoniaDecoder {
    fn decode(&self, source: AudioSource) -> Result<Clip, PlaybackError> {
        let mut hint = Hint::new();
        let media: Box<dyn MediaSource> = match source {
            AudioSource::File(path) => {
                if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                    hint.with_extension(ext);
                }
                Box::new(std::fs::File::open(&path)?)
            }
            AudioSource::Bytes { data, format } => {
                hint.with_extension(format.extension());
                Box::new(Cursor::new(data))
            }
        };
        decode_stream(MediaSourceStream::new(media, Default::default()), &hint)
    }
}

fn decode_stream(mss: MediaSourceStream, hint: &Hint) -> Result<Clip, PlaybackError> {
    let probed = symphonia::default::get_probe()
        .format(hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| PlaybackError::Decode(format!("probe: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PlaybackError::Decode("no audio track".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| PlaybackError::Decode(format!("codec: {e}")))?;

    let mut sample_rate = params.sample_rate.unwrap_or(0);
    let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(PlaybackError::Decode(format!("demux: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;

                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // a corrupt frame is skipped, not fatal
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(error = %e, "skipping undecodable packet");
            }
            Err(e) => return Err(PlaybackError::Decode(format!("decode: {e}"))),
        }
    }

    if sample_rate == 0 || channels == 0 {
        return Err(PlaybackError::Decode("stream has no decodable audio".into()));
    }

    Ok(Clip {
        samples,
        channels,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    /// Minimal 16-bit PCM WAV.
    fn wav_bytes(samples: &[i16], channels: u16, rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_decode_wav_bytes() {
        let pcm: Vec<i16> = (0..1600).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect();
        let clip = SymphoniaDecoder
            .decode(AudioSource::Bytes {
                data: wav_bytes(&pcm, 1, 16_000),
                format: AudioFormat::Wav,
            })
            .unwrap();
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.sample_rate, 16_000);
        assert_eq!(clip.frames(), 1600);
        assert!((clip.samples[0] - 8000.0 / 32768.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_missing_file() {
        let err = SymphoniaDecoder.decode(AudioSource::File("/nonexistent/dub.aac".into()));
        assert!(matches!(err, Err(PlaybackError::Io(_))));
    }

    #[test]
    fn test_decode_garbage() {
        let err = SymphoniaDecoder.decode(AudioSource::Bytes {
            data: b"definitely not audio".to_vec(),
            format: AudioFormat::Aac,
        });
        assert!(matches!(err, Err(PlaybackError::Decode(_))));
    }
}
