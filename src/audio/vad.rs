//! Energy-based voice activity detection.
//!
//! Splits 16kHz audio into speech chunks so silence can be dropped before
//! decoding. Frames of 512 samples (32ms) are classified by RMS level; the
//! chunking rules (minimum speech length, minimum silence to end a chunk,
//! padding around each chunk) follow the usual Silero-style defaults.
//!
//! ## Speech threshold:
//! The cutoff is derived per clip rather than fixed, so quiet recordings keep
//! their speech:
//! - the noise floor is a low percentile of the frame levels
//! - a frame is speech when it is `noise_margin_db` above that floor
//! - the cutoff never rises above `peak_headroom_db` below the loudest frame,
//!   so a clip with no pauses is kept whole
//! - the cutoff never falls below `min_threshold_db`, so digital silence and
//!   dither are still dropped

use std::ops::Range;

use super::{samples_to_seconds, SAMPLE_RATE};

/// Voice activity detection options.
#[derive(Debug, Clone, PartialEq)]
pub struct VadOptions {
    /// Frames below this RMS level (dBFS) are never speech
    pub min_threshold_db: f32,
    /// Percentile of frame levels taken as the clip's noise floor
    pub noise_percentile: f32,
    /// How far above the noise floor a frame must be to count as speech
    pub noise_margin_db: f32,
    /// The cutoff stays at least this far below the loudest frame
    pub peak_headroom_db: f32,
    /// Speech chunks shorter than this are discarded
    pub min_speech_duration_ms: u32,
    /// Chunks longer than this are split
    pub max_speech_duration_s: f32,
    /// Silence needed before a chunk is closed
    pub min_silence_duration_ms: u32,
    /// Audio kept on each side of a chunk
    pub speech_pad_ms: u32,
    /// Frame size in samples (32ms at 16kHz)
    pub frame_size: usize,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            min_threshold_db: -70.0,
            noise_percentile: 0.1,
            noise_margin_db: 12.0,
            peak_headroom_db: 6.0,
            min_speech_duration_ms: 250,
            max_speech_duration_s: f32::INFINITY,
            min_silence_duration_ms: 2000,
            speech_pad_ms: 400,
            frame_size: 512,
        }
    }
}

fn ms_to_samples(ms: u32) -> usize {
    (SAMPLE_RATE as usize * ms as usize) / 1000
}

/// RMS level of a frame in dBFS; silence maps to a large negative value.
pub fn frame_level_db(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
    10.0 * mean_square.max(1e-12).log10()
}

/// Speech cutoff in dBFS for a clip with the given frame levels.
pub fn speech_threshold_db(levels: &[f32], options: &VadOptions) -> f32 {
    if levels.is_empty() {
        return options.min_threshold_db;
    }
    let mut sorted = levels.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let percentile = options.noise_percentile.clamp(0.0, 1.0);
    let floor_index = ((sorted.len() - 1) as f32 * percentile).round() as usize;
    let noise_floor = sorted[floor_index];
    let peak = sorted[sorted.len() - 1];

    (noise_floor + options.noise_margin_db)
        .min(peak - options.peak_headroom_db)
        .max(options.min_threshold_db)
}

/// Find speech chunks in `samples`, as sample ranges in ascending order.
pub fn speech_chunks(samples: &[f32], options: &VadOptions) -> Vec<Range<usize>> {
    let frame_size = options.frame_size.max(1);
    let levels: Vec<f32> = samples.chunks(frame_size).map(frame_level_db).collect();
    let threshold_db = speech_threshold_db(&levels, options);
    let min_speech = ms_to_samples(options.min_speech_duration_ms);
    let min_silence = ms_to_samples(options.min_silence_duration_ms);
    let pad = ms_to_samples(options.speech_pad_ms);
    let max_speech = if options.max_speech_duration_s.is_finite() {
        ((SAMPLE_RATE as f32 * options.max_speech_duration_s) as usize)
            .saturating_sub(frame_size + 2 * pad)
            .max(frame_size)
    } else {
        usize::MAX
    };

    let mut chunks: Vec<Range<usize>> = Vec::new();
    let mut start: Option<usize> = None;
    let mut silence_start: Option<usize> = None;

    for (index, (frame, level)) in samples.chunks(frame_size).zip(&levels).enumerate() {
        let position = index * frame_size;
        let is_speech = *level >= threshold_db;

        match (start, is_speech) {
            (None, true) => {
                start = Some(position);
                silence_start = None;
            }
            (Some(chunk_start), true) => {
                silence_start = None;
                if position - chunk_start >= max_speech {
                    chunks.push(chunk_start..position);
                    start = Some(position);
                }
            }
            (Some(chunk_start), false) => {
                let quiet_from = *silence_start.get_or_insert(position);
                if position + frame.len() - quiet_from >= min_silence {
                    if quiet_from - chunk_start >= min_speech {
                        chunks.push(chunk_start..quiet_from);
                    }
                    start = None;
                    silence_start = None;
                }
            }
            (None, false) => {}
        }
    }

    if let Some(chunk_start) = start {
        let end = silence_start.unwrap_or(samples.len());
        if end - chunk_start >= min_speech {
            chunks.push(chunk_start..end);
        }
    }

    pad_chunks(&mut chunks, pad, samples.len());
    chunks
}

/// Widen each chunk by `pad` samples, splitting shorter gaps evenly so
/// neighbouring chunks never overlap.
fn pad_chunks(chunks: &mut [Range<usize>], pad: usize, total: usize) {
    let count = chunks.len();
    for i in 0..count {
        if i == 0 {
            chunks[i].start = chunks[i].start.saturating_sub(pad);
        }
        if i + 1 < count {
            let gap = chunks[i + 1].start - chunks[i].end;
            if gap < 2 * pad {
                chunks[i].end += gap / 2;
                chunks[i + 1].start -= gap - gap / 2;
            } else {
                chunks[i].end = (chunks[i].end + pad).min(total);
                chunks[i + 1].start = chunks[i + 1].start.saturating_sub(pad);
            }
        } else {
            chunks[i].end = (chunks[i].end + pad).min(total);
        }
    }
}

/// Concatenate the samples covered by `chunks`.
pub fn collect_chunks(samples: &[f32], chunks: &[Range<usize>]) -> Vec<f32> {
    chunks
        .iter()
        .flat_map(|chunk| samples[chunk.clone()].iter().copied())
        .collect()
}

/// Maps positions in VAD-filtered audio back to the original audio.
#[derive(Debug, Clone)]
pub struct SpeechTimeline {
    /// (original start, filtered start, length) per chunk, in samples
    spans: Vec<(usize, usize, usize)>,
}

impl SpeechTimeline {
    /// Timeline for unfiltered audio: positions map to themselves.
    pub fn identity(len: usize) -> Self {
        Self {
            spans: vec![(0, 0, len)],
        }
    }

    pub fn from_chunks(chunks: &[Range<usize>]) -> Self {
        let mut filtered_start = 0;
        let spans = chunks
            .iter()
            .map(|chunk| {
                let span = (chunk.start, filtered_start, chunk.len());
                filtered_start += chunk.len();
                span
            })
            .collect();
        Self { spans }
    }

    /// Convert a time in the filtered audio (seconds) to original time.
    pub fn original_time(&self, filtered_seconds: f64) -> f64 {
        let position = (filtered_seconds.max(0.0) * SAMPLE_RATE as f64).round() as usize;
        let span = self
            .spans
            .iter()
            .find(|(_, filtered_start, len)| position < filtered_start + len)
            .or_else(|| self.spans.last());

        match span {
            Some(&(original_start, filtered_start, len)) => {
                let offset = position.saturating_sub(filtered_start).min(len);
                samples_to_seconds(original_start + offset)
            }
            None => filtered_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (i as f32 * 0.1).sin())
            .collect()
    }

    fn silence(len: usize) -> Vec<f32> {
        vec![0.0; len]
    }

    #[test]
    fn test_frame_level_db() {
        assert!(frame_level_db(&silence(512)) < -100.0);
        let full_scale = vec![1.0; 512];
        assert!(frame_level_db(&full_scale).abs() < 1e-4);
    }

    #[test]
    fn test_silence_has_no_speech() {
        assert!(speech_chunks(&silence(SAMPLE_RATE as usize * 3), &VadOptions::default()).is_empty());
    }

    #[test]
    fn test_speech_surrounded_by_silence_is_padded() {
        let options = VadOptions::default();
        let second = SAMPLE_RATE as usize;
        let mut audio = silence(3 * second);
        audio.extend(tone(second, 0.5));
        audio.extend(silence(3 * second));

        let chunks = speech_chunks(&audio, &options);
        assert_eq!(chunks.len(), 1);

        let pad = ms_to_samples(options.speech_pad_ms);
        let speech_start = 3 * second;
        assert!(chunks[0].start <= speech_start.saturating_sub(pad) + options.frame_size);
        assert!(chunks[0].end >= 4 * second + pad - options.frame_size);
        assert!(chunks[0].end <= audio.len());
    }

    #[test]
    fn test_short_pause_does_not_split_speech() {
        let second = SAMPLE_RATE as usize;
        let mut audio = tone(second, 0.5);
        audio.extend(silence(second / 2));
        audio.extend(tone(second, 0.5));

        let chunks = speech_chunks(&audio, &VadOptions::default());
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_long_pause_splits_speech_without_overlap() {
        let second = SAMPLE_RATE as usize;
        let mut audio = tone(second, 0.5);
        audio.extend(silence(3 * second));
        audio.extend(tone(second, 0.5));

        let chunks = speech_chunks(&audio, &VadOptions::default());
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].end <= chunks[1].start);
    }

    #[test]
    fn test_blips_shorter_than_min_speech_are_dropped() {
        let mut audio = silence(SAMPLE_RATE as usize);
        audio.extend(tone(512, 0.5));
        audio.extend(silence(3 * SAMPLE_RATE as usize));

        assert!(speech_chunks(&audio, &VadOptions::default()).is_empty());
    }

    #[test]
    fn test_long_speech_is_split_at_max_duration() {
        let options = VadOptions {
            max_speech_duration_s: 2.0,
            speech_pad_ms: 0,
            ..Default::default()
        };
        let audio = tone(5 * SAMPLE_RATE as usize, 0.5);

        let chunks = speech_chunks(&audio, &options);
        assert!(chunks.len() >= 2);
        assert!(chunks
            .iter()
            .all(|c| c.len() <= 2 * SAMPLE_RATE as usize));
    }

    #[test]
    fn test_quiet_speech_is_kept() {
        let second = SAMPLE_RATE as usize;
        let mut audio = silence(second);
        audio.extend(tone(3 * second, 0.005));
        audio.extend(silence(second));

        let level = frame_level_db(&tone(second, 0.005));
        assert!(level < -45.0);

        let chunks = speech_chunks(&audio, &VadOptions::default());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].start <= second);
        assert!(chunks[0].end >= 4 * second);
    }

    #[test]
    fn test_steady_background_noise_is_not_speech() {
        let second = SAMPLE_RATE as usize;
        let hum = |len: usize| -> Vec<f32> {
            (0..len).map(|i| 0.01 * (i as f32 * 0.37).sin()).collect()
        };
        let mut audio = hum(3 * second);
        audio.extend(tone(second, 0.3));
        audio.extend(hum(3 * second));

        let options = VadOptions {
            speech_pad_ms: 0,
            ..Default::default()
        };
        let chunks = speech_chunks(&audio, &options);
        assert_eq!(chunks.len(), 1);
        let speech = 3 * second..4 * second;
        assert!(chunks[0].start + options.frame_size >= speech.start);
        assert!(chunks[0].end <= speech.end + options.frame_size);
    }

    #[test]
    fn test_threshold_tracks_the_clip() {
        let options = VadOptions::default();
        assert_eq!(speech_threshold_db(&[], &options), options.min_threshold_db);
        // all silence: clamped to the absolute floor
        assert_eq!(speech_threshold_db(&[-120.0; 10], &options), -70.0);
        // noise floor plus margin
        let mut levels = vec![-60.0; 5];
        levels.extend([-20.0; 5]);
        assert_eq!(speech_threshold_db(&levels, &options), -48.0);
        // no pauses: capped below the peak
        assert_eq!(speech_threshold_db(&[-10.0; 10], &options), -16.0);
    }

    #[test]
    fn test_collect_chunks_and_timeline() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let chunks = vec![10..20, 50..60];

        let collected = collect_chunks(&samples, &chunks);
        assert_eq!(collected.len(), 20);
        assert_eq!(collected[0], 10.0);
        assert_eq!(collected[10], 50.0);

        let second = SAMPLE_RATE as usize;
        let timeline = SpeechTimeline::from_chunks(&[second..2 * second, 5 * second..6 * second]);
        assert!((timeline.original_time(0.0) - 1.0).abs() < 1e-9);
        assert!((timeline.original_time(0.5) - 1.5).abs() < 1e-9);
        assert!((timeline.original_time(1.5) - 5.5).abs() < 1e-9);
        assert!((timeline.original_time(2.0) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_identity_timeline() {
        let timeline = SpeechTimeline::identity(10 * SAMPLE_RATE as usize);
        assert!((timeline.original_time(3.25) - 3.25).abs() < 1e-9);
    }
}
