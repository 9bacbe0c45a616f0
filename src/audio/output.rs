//! Default output device sink via cpal.
//! Clips are converted to the device's channel layout and resampled with
//! rubato when the device rate differs from the clip rate.

use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use crossbeam_channel as cb;
use tracing::{debug, error, info};

use super::{AudioSink, Clip, PlaybackError};

/// Extra wait past the clip length before giving up on the device.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Plays clips on the system default output device.
pub struct DeviceSink;

impl DeviceSink {
    /// Probe for an output device. Fails if none is available.
    pub fn new() -> Result<Self, PlaybackError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("no output device available".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        info!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            "audio output ready"
        );
        Ok(Self)
    }
}

impl AudioSink for DeviceSink {
    fn play(&self, clip: &Clip) -> Result<(), PlaybackError> {
        if clip.is_empty() {
            return Ok(());
        }

        // Re-open per clip so a device change between lines is picked up.
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Device("no output device".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        let config: cpal::StreamConfig = supported.config();
        let device_channels = config.channels;
        let device_rate = config.sample_rate.0;

        let converted = remix(clip, device_channels);
        let samples = if clip.sample_rate == device_rate {
            converted
        } else {
            resample(&converted, device_channels, clip.sample_rate, device_rate)?
        };

        match supported.sample_format() {
            SampleFormat::F32 => play_blocking::<f32>(&device, &config, samples),
            SampleFormat::I16 => play_blocking::<i16>(&device, &config, samples),
            SampleFormat::U16 => play_blocking::<u16>(&device, &config, samples),
            other => Err(PlaybackError::Device(format!(
                "unsupported sample format: {other:?}"
            ))),
        }
    }
}

/// Build a stream, feed it `samples` (already in device layout) and wait
/// until the callback has consumed all of them.
fn play_blocking<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: Vec<f32>,
) -> Result<(), PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let total = samples.len();
    let frames = total / config.channels.max(1) as usize;
    let expected = Duration::from_secs_f64(frames as f64 / config.sample_rate.0 as f64);

    let feed = samples;
    let (done_tx, done_rx) = cb::bounded::<()>(1);
    let mut pos = 0usize;
    let mut signalled = false;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    let s = feed.get(pos).copied().unwrap_or(0.0);
                    *out = T::from_sample(s);
                    pos += 1;
                }
                if pos >= feed.len() && !signalled {
                    signalled = true;
                    let _ = done_tx.try_send(());
                }
            },
            |err| {
                error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| PlaybackError::Device(format!("build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| PlaybackError::Device(format!("start output stream: {e}")))?;

    if done_rx.recv_timeout(expected + DRAIN_GRACE).is_err() {
        debug!(samples = total, "playback drain timed out");
    }
    // let the device flush its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    debug!(samples = total, duration_ms = expected.as_millis() as u64, "playback complete");
    Ok(())
}

/// Convert interleaved `clip` samples to `out_channels`.
/// Mono fans out; multi-channel to mono averages; otherwise channels wrap.
pub fn remix(clip: &Clip, out_channels: u16) -> Vec<f32> {
    let in_ch = clip.channels.max(1) as usize;
    let out_ch = out_channels.max(1) as usize;
    if in_ch == out_ch {
        return clip.samples.clone();
    }

    let mut out = Vec::with_capacity(clip.frames() * out_ch);
    for frame in clip.samples.chunks_exact(in_ch) {
        if out_ch == 1 {
            out.push(frame.iter().sum::<f32>() / in_ch as f32);
        } else {
            out.extend((0..out_ch).map(|c| frame[c % in_ch]));
        }
    }
    out
}

/// Resample interleaved audio with rubato's FFT resampler.
pub fn resample(
    interleaved: &[f32],
    channels: u16,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, PlaybackError> {
    use rubato::{FftFixedIn, Resampler};

    let channels = channels.max(1) as usize;
    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, channels)
            .map_err(|e| PlaybackError::Device(format!("resampler init failed: {e}")))?;

    // de-interleave
    let frames = interleaved.len() / channels;
    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (c, &s) in frame.iter().enumerate() {
            planar[c].push(s);
        }
    }

    let expected = (frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    if expected == 0 {
        return Ok(Vec::new());
    }
    // the filter shifts output by this many frames; keep feeding zeros past
    // the input until the tail has come out
    let delay = resampler.output_delay();

    let mut out: Vec<Vec<f32>> = vec![Vec::new(); channels];
    let mut start = 0;
    while out[0].len() < delay + expected {
        let end = (start + chunk_size).min(frames);
        // partial and flush chunks are zero-padded to the fixed input size
        let chunk: Vec<Vec<f32>> = planar
            .iter()
            .map(|ch| {
                let mut block = ch[start..end].to_vec();
                block.resize(chunk_size, 0.0);
                block
            })
            .collect();
        let result = resampler
            .process(&chunk, None)
            .map_err(|e| PlaybackError::Device(format!("resample failed: {e}")))?;
        for (c, block) in result.into_iter().enumerate() {
            out[c].extend(block);
        }
        start = end;
    }

    let mut interleaved_out = Vec::with_capacity(expected * channels);
    for i in delay..delay + expected {
        for ch in &out {
            interleaved_out.push(ch[i]);
        }
    }
    Ok(interleaved_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remix_mono_to_stereo() {
        let clip = Clip {
            samples: vec![0.1, 0.2],
            channels: 1,
            sample_rate: 8000,
        };
        assert_eq!(remix(&clip, 2), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_remix_stereo_to_mono() {
        let clip = Clip {
            samples: vec![0.2, 0.4, -0.5, 0.5],
            channels: 2,
            sample_rate: 8000,
        };
        let mono = remix(&clip, 1);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn test_resample_length() {
        let input = vec![0.0f32; 2 * 22_050];
        let out = resample(&input, 2, 22_050, 44_100).unwrap();
        assert_eq!(out.len(), 2 * 44_100);
    }

    #[test]
    fn test_resample_keeps_alignment_and_tail() {
        let mut input = vec![0.0f32; 4000];
        input[1000] = 0.5;
        input[3990] = 1.0;
        let out = resample(&input, 1, 22_050, 44_100).unwrap();
        assert_eq!(out.len(), 8000);

        let peak_near = |from: usize, to: usize| {
            (from..to)
                .max_by(|&a, &b| out[a].abs().total_cmp(&out[b].abs()))
                .unwrap()
        };
        let early = peak_near(1500, 2500) as i64;
        assert!((early - 2000).abs() <= 3, "early click at {early}");
        let late = peak_near(7500, 8000) as i64;
        assert!((late - 7980).abs() <= 3, "late click at {late}");
        assert!(out[late as usize].abs() > 0.5);
    }

    #[test]
    fn test_resample_empty_input() {
        assert!(resample(&[], 2, 22_050, 48_000).unwrap().is_empty());
    }
}
