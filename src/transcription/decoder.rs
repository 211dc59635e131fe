//! # Whisper Decoding
//!
//! Turns a log-mel spectrogram into text segments, one 30-second window at a
//! time.
//!
//! ## Key Components:
//! - **SpecialTokens**: ids of the control tokens, looked up in the tokenizer
//! - **Suppression**: tokens that may never be sampled as text
//! - **Beam search**: batched over the live hypotheses, ranked by average
//!   log-probability
//! - **SegmentStream**: lazy iterator that decodes a window per `next()`
//!
//! ## Window Decoding:
//! 1. Encode the window's mel frames
//! 2. Build the prompt: `<|startofprev|>` + previous text, then
//!    `<|startoftranscript|>`, language, task and `<|notimestamps|>`
//! 3. Beam search until end-of-text or half the decoder context
//! 4. Drop the window if it looks like silence (high no-speech probability
//!    and low average log-probability)

use anyhow::{anyhow, Result};
use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::models::whisper as m;
use std::sync::MutexGuard;
use tokenizers::Tokenizer;

use super::languages::{self, LANGUAGES};
use super::model::LoadedModel;
use super::Segment;
use crate::audio::vad::SpeechTimeline;
use crate::audio::SAMPLE_RATE;

const START_OF_PREV_TOKEN: &str = "<|startofprev|>";
/// Byte-level BPE token for a lone space
const BLANK_TOKEN: &str = "Ġ";

/// A window is silence if no-speech probability is above this...
const NO_SPEECH_THRESHOLD: f32 = 0.6;
/// ...and the average log-probability of its tokens is below this.
const LOG_PROB_THRESHOLD: f32 = -1.0;

/// Ids of Whisper's control tokens.
#[derive(Debug, Clone)]
pub struct SpecialTokens {
    pub sot: u32,
    pub eot: u32,
    pub transcribe: u32,
    pub translate: Option<u32>,
    pub no_timestamps: u32,
    pub start_of_prev: Option<u32>,
    pub no_speech: Option<u32>,
    pub blank: Option<u32>,
    /// Language code and token id, in tokenizer order
    pub languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let required = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", token))
        };

        Ok(Self {
            sot: required(m::SOT_TOKEN)?,
            eot: required(m::EOT_TOKEN)?,
            transcribe: required(m::TRANSCRIBE_TOKEN)?,
            translate: tokenizer.token_to_id(m::TRANSLATE_TOKEN),
            no_timestamps: required(m::NO_TIMESTAMPS_TOKEN)?,
            start_of_prev: tokenizer.token_to_id(START_OF_PREV_TOKEN),
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
            blank: tokenizer.token_to_id(BLANK_TOKEN),
            languages: LANGUAGES
                .iter()
                .filter_map(|(code, _)| {
                    tokenizer
                        .token_to_id(&languages::token(code))
                        .map(|id| (*code, id))
                })
                .collect(),
        })
    }

    pub fn language(&self, code: &str) -> Option<u32> {
        self.languages
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, id)| *id)
    }
}

/// Build the additive logit mask for text decoding.
///
/// Suppresses the checkpoint's own `suppress_tokens`, every control token
/// and every timestamp token (all ids after `<|notimestamps|>`).
pub fn suppression_mask(vocab_size: usize, suppress_tokens: &[u32], special: &SpecialTokens) -> Vec<f32> {
    let mut mask = vec![0f32; vocab_size];
    let mut suppress = |id: u32| {
        if let Some(slot) = mask.get_mut(id as usize) {
            *slot = f32::NEG_INFINITY;
        }
    };

    suppress_tokens.iter().copied().for_each(&mut suppress);
    [special.sot, special.transcribe, special.no_timestamps]
        .into_iter()
        .chain(special.translate)
        .chain(special.start_of_prev)
        .chain(special.no_speech)
        .chain(special.languages.iter().map(|(_, id)| *id))
        .for_each(&mut suppress);
    (special.no_timestamps as usize + 1..vocab_size).for_each(|id| suppress(id as u32));

    mask
}

/// Numerically stable log-softmax.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let log_sum = logits.iter().map(|l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|l| l - log_sum).collect()
}

/// The `k` highest finite values as `(index, value)`, best first.
fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, &v)| (i as u32, v))
        .collect();
    let k = k.min(indexed.len());
    if k == 0 {
        return Vec::new();
    }
    indexed.select_nth_unstable_by(k - 1, |a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed
}

/// A partial or finished token sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Sampled tokens, excluding the prompt and end-of-text
    pub tokens: Vec<u32>,
    pub sum_logprob: f32,
}

impl Hypothesis {
    fn score(&self) -> f32 {
        self.sum_logprob / self.tokens.len().max(1) as f32
    }
}

/// Extend every live beam by its best tokens and keep the `beam_size` best
/// distinct continuations. Returns the next live beams and the hypotheses
/// that ended with `eot` in this step.
pub fn advance_beams(
    beams: &[Hypothesis],
    logprobs: &[Vec<f32>],
    beam_size: usize,
    eot: u32,
) -> (Vec<Hypothesis>, Vec<Hypothesis>) {
    let mut candidates: Vec<(f32, usize, u32)> = beams
        .iter()
        .zip(logprobs)
        .enumerate()
        .flat_map(|(beam, (hypothesis, row))| {
            top_k(row, beam_size + 1)
                .into_iter()
                .map(move |(token, logprob)| (hypothesis.sum_logprob + logprob, beam, token))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut next: Vec<Hypothesis> = Vec::with_capacity(beam_size);
    let mut finished = Vec::new();

    for (sum_logprob, beam, token) in candidates {
        let mut tokens = beams[beam].tokens.clone();
        if token == eot {
            finished.push(Hypothesis { tokens, sum_logprob });
        } else {
            tokens.push(token);
            if !next.iter().any(|h| h.tokens == tokens) {
                next.push(Hypothesis { tokens, sum_logprob });
            }
        }
        if next.len() >= beam_size {
            break;
        }
    }

    (next, finished)
}

/// Highest-scoring hypothesis by length-normalised log-probability.
pub fn best(hypotheses: Vec<Hypothesis>) -> Option<Hypothesis> {
    hypotheses
        .into_iter()
        .max_by(|a, b| a.score().total_cmp(&b.score()))
}

/// Assemble the decoder prompt and the position of `<|startoftranscript|>`.
///
/// Only the most recent `max_previous` previous tokens are kept.
pub fn build_prompt(
    special: &SpecialTokens,
    previous: &[u32],
    task: &[u32],
    max_previous: usize,
) -> (Vec<u32>, usize) {
    let mut prompt = Vec::with_capacity(max_previous + task.len() + 3);
    if let (Some(start_of_prev), false) = (special.start_of_prev, previous.is_empty()) {
        prompt.push(start_of_prev);
        let keep = previous.len().min(max_previous);
        prompt.extend_from_slice(&previous[previous.len() - keep..]);
    }
    let sot_index = prompt.len();
    prompt.push(special.sot);
    prompt.extend_from_slice(task);
    prompt.push(special.no_timestamps);
    (prompt, sot_index)
}

/// Outcome of decoding one window.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeResult {
    pub tokens: Vec<u32>,
    pub avg_logprob: f32,
    pub no_speech_prob: f32,
}

impl DecodeResult {
    pub fn is_silence(&self) -> bool {
        self.no_speech_prob > NO_SPEECH_THRESHOLD && self.avg_logprob < LOG_PROB_THRESHOLD
    }
}

fn logits_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    Ok(logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

/// Beam-search one window of encoded audio.
fn decode_window(
    model: &mut LoadedModel,
    audio_features: &Tensor,
    prompt: &[u32],
    sot_index: usize,
    beam_size: usize,
) -> Result<DecodeResult> {
    let max_positions = model.config.max_target_positions;
    let sample_len = max_positions / 2;
    let eot = model.special.eot;

    let mut beams = vec![Hypothesis {
        tokens: Vec::new(),
        sum_logprob: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();
    let mut no_speech_prob = 0.0;
    let mut cached_batch = None;

    for step in 0..sample_len {
        let seq_len = prompt.len() + step;
        if seq_len >= max_positions {
            break;
        }

        let batch = beams.len();
        let rows: Vec<u32> = beams
            .iter()
            .flat_map(|beam| prompt.iter().chain(&beam.tokens).copied())
            .collect();
        let input = Tensor::from_vec(rows, (batch, seq_len), &model.device)?;
        let xa = if batch == 1 {
            audio_features.clone()
        } else {
            audio_features.repeat((batch, 1, 1))?
        };

        // cross-attention keys are cached per batch shape
        let flush = step == 0 || cached_batch != Some(batch);
        cached_batch = Some(batch);
        let hidden = model.model.decoder.forward(&input, &xa, flush)?;

        if step == 0 {
            if let Some(no_speech) = model.special.no_speech {
                let at_sot = hidden.i((..1, sot_index..sot_index + 1))?;
                let logits = logits_to_vec(&model.model.decoder.final_linear(&at_sot)?)?;
                no_speech_prob = log_softmax(&logits)
                    .get(no_speech as usize)
                    .map_or(0.0, |lp| lp.exp());
            }
        }

        let last = hidden.i((.., seq_len - 1..seq_len))?;
        let logits = model
            .model
            .decoder
            .final_linear(&last)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        let logprobs: Vec<Vec<f32>> = logits
            .into_iter()
            .map(|mut row| {
                for (logit, mask) in row.iter_mut().zip(&model.suppress) {
                    *logit += mask;
                }
                if step == 0 {
                    // the first token can be neither blank nor end-of-text
                    for id in model.special.blank.into_iter().chain([eot]) {
                        if let Some(logit) = row.get_mut(id as usize) {
                            *logit = f32::NEG_INFINITY;
                        }
                    }
                }
                log_softmax(&row)
            })
            .collect();

        let (next, done) = advance_beams(&beams, &logprobs, beam_size, eot);
        finished.extend(done);
        beams = next;
        if finished.len() >= beam_size || beams.is_empty() {
            break;
        }
    }

    if finished.len() < beam_size {
        finished.extend(beams);
    }
    let best = best(finished).unwrap_or(Hypothesis {
        tokens: Vec::new(),
        sum_logprob: 0.0,
    });

    Ok(DecodeResult {
        avg_logprob: best.sum_logprob / (best.tokens.len() + 1) as f32,
        tokens: best.tokens,
        no_speech_prob,
    })
}

/// Detect the spoken language from the first window of `mel`.
///
/// Returns the language code and its probability among all languages.
pub fn detect_language(model: &mut LoadedModel, mel: &Tensor) -> Result<(&'static str, f32)> {
    let frames = mel.dim(2)?.min(m::N_FRAMES);
    let window = mel.narrow(2, 0, frames)?;
    let features = model.model.encoder.forward(&window, true)?;

    let input = Tensor::new(&[[model.special.sot]], &model.device)?;
    let hidden = model.model.decoder.forward(&input, &features, true)?;
    let logits = logits_to_vec(&model.model.decoder.final_linear(&hidden.i((..1, 0..1))?)?)?;

    let language_logits: Vec<f32> = model
        .special
        .languages
        .iter()
        .map(|(_, id)| logits.get(*id as usize).copied().unwrap_or(f32::NEG_INFINITY))
        .collect();
    let logprobs = log_softmax(&language_logits);

    model
        .special
        .languages
        .iter()
        .zip(logprobs)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|((code, _), logprob)| (*code, logprob.exp()))
        .ok_or_else(|| anyhow!("Tokenizer has no language tokens"))
}

fn frames_to_seconds(frames: usize) -> f64 {
    (frames * m::HOP_LENGTH) as f64 / SAMPLE_RATE as f64
}

/// Per-transcription decoding settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Language and task tokens placed after `<|startoftranscript|>`
    pub task_tokens: Vec<u32>,
    /// Tokens of the caller's initial prompt, if any
    pub prompt_tokens: Vec<u32>,
    pub beam_size: usize,
    pub condition_on_previous_text: bool,
}

/// Lazily decoded segments.
///
/// Holds the model lock for as long as it lives, so other transcriptions
/// wait until this one is drained or dropped.
pub struct SegmentStream<'a> {
    model: MutexGuard<'a, LoadedModel>,
    mel: Tensor,
    content_frames: usize,
    seek: usize,
    settings: StreamSettings,
    previous: Vec<u32>,
    timeline: SpeechTimeline,
    next_id: usize,
    failed: bool,
}

impl<'a> SegmentStream<'a> {
    /// `mel` is `(1, n_mels, frames)`; only the first `content_frames`
    /// frames hold audio, the rest is padding.
    pub fn new(
        model: MutexGuard<'a, LoadedModel>,
        mel: Tensor,
        content_frames: usize,
        settings: StreamSettings,
        timeline: SpeechTimeline,
    ) -> Self {
        let previous = settings.prompt_tokens.clone();
        Self {
            model,
            mel,
            content_frames,
            seek: 0,
            settings,
            previous,
            timeline,
            next_id: 0,
            failed: false,
        }
    }

    /// Decode the window at `seek`; `None` if it held no speech.
    fn decode_next_window(&mut self) -> Result<Option<Segment>> {
        let total_frames = self.mel.dim(2)?;
        let segment_size = (self.content_frames - self.seek).min(m::N_FRAMES);
        let window = self
            .mel
            .narrow(2, self.seek, (total_frames - self.seek).min(m::N_FRAMES))?;
        let start = frames_to_seconds(self.seek);
        let end = frames_to_seconds(self.seek + segment_size);
        self.seek += segment_size;

        let model = &mut *self.model;
        let features = model.model.encoder.forward(&window, true)?;
        let max_previous = model.config.max_target_positions / 2 - 1;
        let (prompt, sot_index) = build_prompt(
            &model.special,
            &self.previous,
            &self.settings.task_tokens,
            max_previous,
        );
        let result = decode_window(model, &features, &prompt, sot_index, self.settings.beam_size)?;

        if result.is_silence() {
            tracing::debug!(
                "Skipping window {:.2}s-{:.2}s: no_speech_prob={:.3} avg_logprob={:.3}",
                start,
                end,
                result.no_speech_prob,
                result.avg_logprob
            );
            return Ok(None);
        }

        if self.settings.condition_on_previous_text {
            self.previous.extend_from_slice(&result.tokens);
        } else {
            self.previous.clear();
        }

        if result.tokens.is_empty() {
            return Ok(None);
        }

        let text = model
            .tokenizer
            .decode(&result.tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        let segment = Segment {
            id: self.next_id,
            start: self.timeline.original_time(start),
            end: self.timeline.original_time(end),
            text,
            tokens: result.tokens,
            avg_logprob: result.avg_logprob,
            no_speech_prob: result.no_speech_prob,
        };
        self.next_id += 1;
        Ok(Some(segment))
    }
}

impl Iterator for SegmentStream<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.seek < self.content_frames {
            match self.decode_next_window() {
                Ok(Some(segment)) => {
                    tracing::debug!(
                        "Segment {} [{:.2}s - {:.2}s]: '{}'",
                        segment.id,
                        segment.start,
                        segment.end,
                        segment.text
                    );
                    return Some(Ok(segment));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 20;

    fn special() -> SpecialTokens {
        SpecialTokens {
            sot: 10,
            eot: 9,
            transcribe: 15,
            translate: Some(14),
            no_timestamps: 17,
            start_of_prev: Some(13),
            no_speech: Some(16),
            blank: Some(1),
            languages: vec![("en", 11), ("ko", 12)],
        }
    }

    fn hypothesis(tokens: &[u32], sum_logprob: f32) -> Hypothesis {
        Hypothesis {
            tokens: tokens.to_vec(),
            sum_logprob,
        }
    }

    /// Log-probabilities with the given tokens likely and everything else not.
    fn row(entries: &[(u32, f32)]) -> Vec<f32> {
        let mut logits = vec![-20.0; VOCAB];
        for &(token, logit) in entries {
            logits[token as usize] = logit;
        }
        log_softmax(&logits)
    }

    #[test]
    fn test_log_softmax_normalises() {
        let logprobs = log_softmax(&[1.0, 2.0, 3.0, f32::NEG_INFINITY]);
        let total: f32 = logprobs.iter().map(|lp| lp.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(logprobs[3], f32::NEG_INFINITY);
        assert!(logprobs[2] > logprobs[1]);
    }

    #[test]
    fn test_log_softmax_all_suppressed() {
        assert!(log_softmax(&[f32::NEG_INFINITY; 3])
            .iter()
            .all(|lp| *lp == f32::NEG_INFINITY));
    }

    #[test]
    fn test_top_k_skips_suppressed() {
        let top = top_k(&[0.1, f32::NEG_INFINITY, 0.5, 0.3], 3);
        assert_eq!(top.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![2, 3, 0]);
        assert!(top_k(&[f32::NEG_INFINITY], 2).is_empty());
    }

    #[test]
    fn test_suppression_mask() {
        let special = special();
        let mask = suppression_mask(VOCAB, &[3], &special);
        assert_eq!(mask.len(), VOCAB);

        for allowed in [0, 1, 2, 4, 9] {
            assert_eq!(mask[allowed], 0.0, "token {} should be allowed", allowed);
        }
        for suppressed in [3, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19] {
            assert_eq!(mask[suppressed], f32::NEG_INFINITY, "token {} should be suppressed", suppressed);
        }
    }

    #[test]
    fn test_greedy_step_picks_most_likely_token() {
        let beams = vec![hypothesis(&[], 0.0)];
        let (next, finished) = advance_beams(&beams, &[row(&[(4, 5.0), (5, 1.0)])], 1, 9);
        assert!(finished.is_empty());
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].tokens, vec![4]);
    }

    #[test]
    fn test_end_of_text_finishes_hypothesis() {
        let beams = vec![hypothesis(&[4], -0.1)];
        let (next, finished) = advance_beams(&beams, &[row(&[(9, 5.0), (5, 1.0)])], 1, 9);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].tokens, vec![4]);
        assert!(finished[0].sum_logprob < -0.1);
        assert_eq!(next[0].tokens, vec![4, 5]);
    }

    #[test]
    fn test_beam_step_keeps_best_across_beams() {
        let beams = vec![hypothesis(&[4], -0.1), hypothesis(&[5], -3.0)];
        let rows = vec![row(&[(6, 5.0), (7, 4.0)]), row(&[(6, 5.0), (8, 4.9)])];
        let (next, _) = advance_beams(&beams, &rows, 2, 9);
        assert_eq!(next.len(), 2);
        assert!(next.iter().all(|h| h.tokens[0] == 4));
    }

    #[test]
    fn test_best_uses_length_normalised_score() {
        let short = hypothesis(&[4], -1.0);
        let long = hypothesis(&[4, 5, 6, 7], -2.0);
        assert_eq!(best(vec![short, long.clone()]), Some(long));
        assert_eq!(best(Vec::new()), None);
    }

    #[test]
    fn test_prompt_without_history() {
        let (prompt, sot_index) = build_prompt(&special(), &[], &[12, 15], 10);
        assert_eq!(prompt, vec![10, 12, 15, 17]);
        assert_eq!(sot_index, 0);
    }

    #[test]
    fn test_prompt_keeps_most_recent_history() {
        let (prompt, sot_index) = build_prompt(&special(), &[1, 2, 3, 4, 5], &[], 3);
        assert_eq!(prompt, vec![13, 3, 4, 5, 10, 17]);
        assert_eq!(sot_index, 4);
    }

    #[test]
    fn test_silence_needs_both_conditions() {
        let result = |no_speech_prob, avg_logprob| DecodeResult {
            tokens: vec![4],
            avg_logprob,
            no_speech_prob,
        };
        assert!(result(0.9, -1.5).is_silence());
        assert!(!result(0.9, -0.5).is_silence());
        assert!(!result(0.3, -1.5).is_silence());
    }

    #[test]
    fn test_frames_to_seconds() {
        assert!((frames_to_seconds(m::N_FRAMES) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_language_lookup() {
        let special = special();
        assert_eq!(special.language("ko"), Some(12));
        assert_eq!(special.language("fr"), None);
    }
}
