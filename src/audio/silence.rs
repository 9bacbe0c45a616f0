//! Leading-silence trimming.
//! A window is silent when its RMS is at or below the clip's average loudness
//! minus a fixed margin. The leading silent run (at least one full window)
//! is dropped up to where the last silent window ends.

use std::time::Duration;

use super::Clip;

/// RMS over a slice of f32 samples.
#[inline]
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = s as f64;
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Loudness relative to full scale. Digital silence is `-inf`.
#[inline]
pub fn dbfs(rms: f32) -> f32 {
    if rms <= 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * rms.log10()
}

/// Silence detection parameters.
#[derive(Debug, Clone)]
pub struct SilenceTrim {
    /// Shortest run that counts as silence.
    pub min_silence: Duration,
    /// Threshold below the clip's average dBFS.
    pub margin_db: f32,
    /// Window advance while scanning.
    pub seek_step: Duration,
}

impl Default for SilenceTrim {
    fn default() -> Self {
        Self {
            min_silence: Duration::from_millis(100),
            margin_db: 16.0,
            seek_step: Duration::from_millis(1),
        }
    }
}

/// Number of frames of leading silence in `clip` (0 if it starts audible).
pub fn leading_silence_frames(clip: &Clip, trim: &SilenceTrim) -> usize {
    let channels = clip.channels.max(1) as usize;
    let frames = clip.frames();
    let window = frames_for(trim.min_silence, clip.sample_rate).max(1);
    let step = frames_for(trim.seek_step, clip.sample_rate).max(1);
    if frames < window {
        return 0;
    }

    let threshold_db = dbfs(compute_rms(&clip.samples)) - trim.margin_db;
    let threshold = 10f64.powf(threshold_db as f64 / 20.0);

    // prefix sums of per-frame energy so each window is O(1)
    let mut energy = Vec::with_capacity(frames + 1);
    energy.push(0.0f64);
    for frame in clip.samples.chunks_exact(channels) {
        let e: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
        energy.push(energy[energy.len() - 1] + e);
    }
    let window_rms = |start: usize| {
        let sum = energy[start + window] - energy[start];
        (sum / (window * channels) as f64).sqrt()
    };

    let mut last_silent = None;
    let mut pos = 0;
    while pos + window <= frames && window_rms(pos) <= threshold {
        last_silent = Some(pos);
        pos += step;
    }

    match last_silent {
        Some(start) => (start + window).min(frames),
        None => 0,
    }
}

/// Drop leading silence from `clip`. Returns the clip untouched if none.
pub fn trim_leading_silence(mut clip: Clip, trim: &SilenceTrim) -> Clip {
    let cut = leading_silence_frames(&clip, trim);
    if cut > 0 {
        let channels = clip.channels.max(1) as usize;
        clip.samples.drain(..cut * channels);
    }
    clip
}

fn frames_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}
