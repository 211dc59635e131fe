//! Mel filter bank for Whisper's log-mel spectrogram.
//!
//! Whisper was trained on features from librosa's default filter bank
//! (Slaney mel scale, Slaney area normalisation). The bank is computed here
//! instead of shipped as a binary blob, for whatever mel-bin count the
//! loaded model declares (80 for most checkpoints, 128 for large-v3).

use super::SAMPLE_RATE;

/// FFT size used by Whisper's STFT (25ms at 16kHz).
pub const N_FFT: usize = 400;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Slaney mel scale: linear below 1kHz, logarithmic above.
pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}

/// Build a `n_mels x (N_FFT / 2 + 1)` filter bank, row-major, covering
/// 0Hz to the Nyquist frequency.
///
/// The layout matches what `candle_transformers::models::whisper::audio::pcm_to_mel`
/// expects for its `filters` argument.
pub fn filter_bank(n_mels: usize) -> Vec<f32> {
    let n_freqs = N_FFT / 2 + 1;
    let sample_rate = SAMPLE_RATE as f64;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate / N_FFT as f64)
        .collect();

    let max_mel = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let enorm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_freqs + k] = (weight * enorm) as f32;
        }
    }
    filters
}
