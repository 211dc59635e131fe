//! Audio file decoding and resampling to 16kHz mono f32.

use anyhow::{anyhow, Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::SAMPLE_RATE;

const RESAMPLE_CHUNK: usize = 1024;

/// Decode the audio file at `path` into 16kHz mono samples.
///
/// The file extension is only a probing hint; the container is detected from
/// its content. Packets that fail to decode are skipped, as long as at least
/// one packet decodes.
pub fn decode_file(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| anyhow!("unsupported audio format: {}", e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no audio track found"))?;

    let codec_params = track.codec_params.clone();
    let track_id = track.id;
    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("audio track has no sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("unsupported audio codec: {}", e))?;

    let mut mono: Vec<f32> = Vec::new();
    let mut decoded_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(anyhow!("reading audio packet: {}", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(anyhow!("decoding audio: {}", e)),
        };
        decoded_packets += 1;

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        mix_to_mono(sample_buf.samples(), channels, &mut mono);
    }

    if decoded_packets == 0 {
        return Err(anyhow!("no audio samples decoded"));
    }

    tracing::debug!(
        "Decoded {} samples at {}Hz from {}",
        mono.len(),
        source_rate,
        path.display()
    );

    if source_rate != SAMPLE_RATE {
        mono = resample(&mono, source_rate, SAMPLE_RATE)?;
    }

    Ok(mono)
}

/// Average interleaved frames into `out`.
fn mix_to_mono(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

fn resample_chunk(
    resampler: &mut SincFixedIn<f32>,
    chunk: Vec<f32>,
    output: &mut Vec<f32>,
) -> Result<()> {
    let resampled = resampler
        .process(&[chunk], None)
        .map_err(|e| anyhow!("resampling: {}", e))?;
    if let Some(channel) = resampled.first() {
        output.extend_from_slice(channel);
    }
    Ok(())
}

/// Resample mono audio from `from_rate` to `to_rate`.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if samples.is_empty() || from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| anyhow!("resampler init: {}", e))?;

    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected_len + delay + RESAMPLE_CHUNK);

    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut chunk = chunk.to_vec();
        chunk.resize(RESAMPLE_CHUNK, 0.0);
        resample_chunk(&mut resampler, chunk, &mut output)?;
    }
    // flush the filter delay
    while output.len() < expected_len + delay {
        resample_chunk(&mut resampler, vec![0.0; RESAMPLE_CHUNK], &mut output)?;
    }

    Ok(output[delay..delay + expected_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    /// Build a 16-bit PCM WAV file in memory.
    fn wav_bytes(sample_rate: u32, channels: u16, frames: &[Vec<i16>]) -> Vec<u8> {
        let data_len = (frames.len() * channels as usize * 2) as u32;
        let mut buf = Vec::new();
        buf.write_all(b"RIFF").unwrap();
        buf.write_u32::<LittleEndian>(36 + data_len).unwrap();
        buf.write_all(b"WAVEfmt ").unwrap();
        buf.write_u32::<LittleEndian>(16).unwrap();
        buf.write_u16::<LittleEndian>(1).unwrap();
        buf.write_u16::<LittleEndian>(channels).unwrap();
        buf.write_u32::<LittleEndian>(sample_rate).unwrap();
        buf.write_u32::<LittleEndian>(sample_rate * channels as u32 * 2).unwrap();
        buf.write_u16::<LittleEndian>(channels * 2).unwrap();
        buf.write_u16::<LittleEndian>(16).unwrap();
        buf.write_all(b"data").unwrap();
        buf.write_u32::<LittleEndian>(data_len).unwrap();
        for frame in frames {
            for &sample in frame {
                buf.write_i16::<LittleEndian>(sample).unwrap();
            }
        }
        buf
    }

    fn write_temp(bytes: &[u8], suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_decode_mono_wav_at_target_rate() {
        let frames: Vec<Vec<i16>> = (0..1600).map(|_| vec![8192]).collect();
        let file = write_temp(&wav_bytes(16_000, 1, &frames), ".wav");

        let samples = decode_file(file.path()).unwrap();
        assert_eq!(samples.len(), 1600);
        assert!(samples.iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn test_decode_stereo_wav_is_mixed_to_mono() {
        let frames: Vec<Vec<i16>> = (0..800).map(|_| vec![16384, 0]).collect();
        let file = write_temp(&wav_bytes(16_000, 2, &frames), ".wav");

        let samples = decode_file(file.path()).unwrap();
        assert_eq!(samples.len(), 800);
        assert!(samples.iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn test_decode_resamples_to_16khz() {
        let frames: Vec<Vec<i16>> = (0..48_000)
            .map(|i| vec![((i as f32 * 0.05).sin() * 10_000.0) as i16])
            .collect();
        let file = write_temp(&wav_bytes(48_000, 1, &frames), ".wav");

        let samples = decode_file(file.path()).unwrap();
        assert_eq!(samples.len(), 16_000);
    }

    #[test]
    fn test_decode_ignores_misleading_extension() {
        let frames: Vec<Vec<i16>> = (0..160).map(|_| vec![0]).collect();
        let file = write_temp(&wav_bytes(16_000, 1, &frames), ".mp3");

        assert_eq!(decode_file(file.path()).unwrap().len(), 160);
    }

    #[test]
    fn test_decode_invalid_audio_returns_error() {
        let file = write_temp(b"definitely not audio", ".wav");
        assert!(decode_file(file.path()).is_err());
    }

    #[test]
    fn test_decode_missing_file_returns_error() {
        assert!(decode_file(Path::new("/nonexistent/clip.wav")).is_err());
    }

    #[test]
    fn test_mix_to_mono_averages_frames() {
        let mut out = Vec::new();
        mix_to_mono(&[1.0, 0.0, 0.5, 0.5], 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }
}
