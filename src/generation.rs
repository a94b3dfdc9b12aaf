// src/generation.rs

use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use log::warn;
use ndarray::{Array1, ArrayView1};
use ndarray_stats::QuantileExt;
use serde::{Deserialize, Serialize};

use crate::model::{CausalLm, ModelError};

// 1. GenerationError Enum
#[derive(Debug)]
pub enum GenerationError {
    Model(ModelError),
    Sampling(candle_core::Error),
    InvalidConfig(String),
    InvalidLogits(String),
    EmptyPrompt,
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationError::Model(e) => write!(f, "Model error: {}", e),
            GenerationError::Sampling(e) => write!(f, "Sampling error: {}", e),
            GenerationError::InvalidConfig(s) => write!(f, "Invalid generation config: {}", s),
            GenerationError::InvalidLogits(s) => write!(f, "Invalid logits: {}", s),
            GenerationError::EmptyPrompt => write!(f, "Prompt encodes to zero tokens"),
        }
    }
}

impl std::error::Error for GenerationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GenerationError::Model(ref e) => Some(e),
            GenerationError::Sampling(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModelError> for GenerationError {
    fn from(err: ModelError) -> GenerationError {
        GenerationError::Model(err)
    }
}

impl From<candle_core::Error> for GenerationError {
    fn from(err: candle_core::Error) -> GenerationError {
        GenerationError::Sampling(err)
    }
}

/// Decoding settings. Defaults follow the command-line defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub num_beams: usize,
    pub top_k: usize,
    pub top_p: f64,
    pub temperature: f64,
    pub do_sample: bool,
    pub seed: u64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub length_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            num_beams: 4,
            top_k: 40,
            top_p: 0.75,
            temperature: 0.1,
            do_sample: false,
            seed: 299_792_458,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            length_penalty: 1.0,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.num_beams == 0 {
            return Err(GenerationError::InvalidConfig("num_beams must be at least 1".to_string()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(GenerationError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.temperature < 0.0 {
            return Err(GenerationError::InvalidConfig(format!(
                "temperature must not be negative, got {}",
                self.temperature
            )));
        }
        if self.repeat_penalty <= 0.0 {
            return Err(GenerationError::InvalidConfig(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    fn sampling(&self) -> Sampling {
        if self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        match (self.top_k, self.top_p) {
            (0, p) if p >= 1.0 => Sampling::All { temperature },
            (0, p) => Sampling::TopP { p, temperature },
            (k, p) if p >= 1.0 => Sampling::TopK { k, temperature },
            (k, p) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

fn argmax(logits: &[f32]) -> Result<u32, GenerationError> {
    ArrayView1::from(logits)
        .argmax()
        .map(|idx| idx as u32)
        .map_err(|e| GenerationError::InvalidLogits(format!("argmax failed: {}", e)))
}

fn log_softmax(logits: &[f32]) -> Result<Array1<f32>, GenerationError> {
    let view = ArrayView1::from(logits);
    let max = *view
        .max()
        .map_err(|e| GenerationError::InvalidLogits(format!("max failed: {}", e)))?;
    let shifted = view.mapv(|v| v - max);
    let log_sum = shifted.mapv(f32::exp).sum().ln();
    Ok(shifted.mapv(|v| v - log_sum))
}

/// Indices of the `k` largest entries, largest first.
fn top_k(values: &Array1<f32>, k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = values.iter().enumerate().map(|(i, &v)| (i as u32, v)).collect();
    let by_score_desc = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1);
    let k = k.min(indexed.len());
    if k == 0 {
        return Vec::new();
    }
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, by_score_desc);
        indexed.truncate(k);
    }
    indexed.sort_by(by_score_desc);
    indexed
}

/// Applies the repetition penalty over the last `repeat_last_n` context tokens.
fn penalize(logits: Vec<f32>, config: &GenerationConfig, context: &[u32]) -> Result<Vec<f32>, GenerationError> {
    if config.repeat_penalty == 1.0 || config.repeat_last_n == 0 {
        return Ok(logits);
    }
    let start = context.len().saturating_sub(config.repeat_last_n);
    let tensor = Tensor::new(logits.as_slice(), &Device::Cpu)?;
    let tensor = candle_transformers::utils::apply_repeat_penalty(&tensor, config.repeat_penalty, &context[start..])?;
    Ok(tensor.to_vec1::<f32>()?)
}

/// Generates a continuation of `prompt`. Returns only the new tokens; an
/// end-of-sequence token stops generation and is not included.
pub fn generate(
    model: &mut dyn CausalLm,
    prompt: &[u32],
    eos_token_ids: &[u32],
    config: &GenerationConfig,
) -> Result<Vec<u32>, GenerationError> {
    config.validate()?;
    if prompt.is_empty() {
        return Err(GenerationError::EmptyPrompt);
    }
    if config.max_new_tokens == 0 {
        return Ok(Vec::new());
    }

    if config.num_beams > 1 {
        if config.do_sample {
            warn!("Beam sampling is not supported; running deterministic beam search");
        }
        return beam_search(model, prompt, eos_token_ids, config);
    }
    if config.do_sample {
        let mut processor = LogitsProcessor::from_sampling(config.seed, config.sampling());
        return decode_single(model, prompt, eos_token_ids, config, |logits| {
            let tensor = Tensor::new(logits, &Device::Cpu)?;
            Ok(processor.sample(&tensor)?)
        });
    }
    decode_single(model, prompt, eos_token_ids, config, argmax)
}

// Greedy and sampled decoding share this loop; only the token choice differs.
fn decode_single<F>(
    model: &mut dyn CausalLm,
    prompt: &[u32],
    eos_token_ids: &[u32],
    config: &GenerationConfig,
    mut pick: F,
) -> Result<Vec<u32>, GenerationError>
where
    F: FnMut(&[f32]) -> Result<u32, GenerationError>,
{
    model.reset()?;
    let mut context = prompt.to_vec();
    let mut logits = model.forward(prompt, 0)?;
    let mut generated = Vec::new();

    loop {
        let next = pick(&penalize(logits, config, &context)?)?;
        if eos_token_ids.contains(&next) {
            break;
        }
        generated.push(next);
        context.push(next);
        if generated.len() >= config.max_new_tokens {
            break;
        }
        logits = model.forward(&[next], context.len() - 1)?;
    }
    Ok(generated)
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    sum_logprobs: f32,
}

/// Finished hypotheses, keeping the best `num_beams` by length-normalised score.
struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f32,
    hyps: Vec<(f32, Vec<u32>)>,
}

impl BeamHypotheses {
    fn new(num_beams: usize, length_penalty: f32) -> Self {
        Self { num_beams, length_penalty, hyps: Vec::with_capacity(num_beams + 1) }
    }

    fn normalized(&self, sum_logprobs: f32, generated_len: usize) -> f32 {
        sum_logprobs / (generated_len.max(1) as f32).powf(self.length_penalty)
    }

    fn worst_score(&self) -> f32 {
        self.hyps.iter().map(|(score, _)| *score).fold(f32::INFINITY, f32::min)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = self.normalized(sum_logprobs, tokens.len());
        if self.hyps.len() < self.num_beams || score > self.worst_score() {
            self.hyps.push((score, tokens));
            if self.hyps.len() > self.num_beams {
                let worst = self
                    .hyps
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
                    .map(|(idx, _)| idx);
                if let Some(idx) = worst {
                    self.hyps.remove(idx);
                }
            }
        }
    }

    /// True once no running beam can still beat the worst kept hypothesis.
    fn is_done(&self, best_sum_logprobs: f32, generated_len: usize) -> bool {
        self.hyps.len() >= self.num_beams
            && self.worst_score() >= self.normalized(best_sum_logprobs, generated_len)
    }

    fn best(self) -> Option<Vec<u32>> {
        self.hyps
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, tokens)| tokens)
    }
}

// Each beam is re-run from the full prompt after a reset; the models keep a
// single cache so beams cannot share one.
fn beam_search(
    model: &mut dyn CausalLm,
    prompt: &[u32],
    eos_token_ids: &[u32],
    config: &GenerationConfig,
) -> Result<Vec<u32>, GenerationError> {
    let num_beams = config.num_beams;
    let pool = 2 * num_beams;
    let mut hypotheses = BeamHypotheses::new(num_beams, config.length_penalty);
    let mut running = vec![Beam { tokens: Vec::new(), sum_logprobs: 0.0 }];
    let mut done = false;

    for step in 0..config.max_new_tokens {
        // (total score, beam index, token)
        let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(running.len() * pool);
        for (beam_idx, beam) in running.iter().enumerate() {
            let mut sequence = prompt.to_vec();
            sequence.extend_from_slice(&beam.tokens);
            model.reset()?;
            let logits = penalize(model.forward(&sequence, 0)?, config, &sequence)?;
            let logprobs = log_softmax(&logits)?;
            for (token, logprob) in top_k(&logprobs, pool) {
                candidates.push((beam.sum_logprobs + logprob, beam_idx, token));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates.truncate(pool);

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, &(score, beam_idx, token)) in candidates.iter().enumerate() {
            if eos_token_ids.contains(&token) {
                if rank < num_beams {
                    hypotheses.add(running[beam_idx].tokens.clone(), score);
                }
            } else {
                let mut tokens = running[beam_idx].tokens.clone();
                tokens.push(token);
                next_beams.push(Beam { tokens, sum_logprobs: score });
            }
            if next_beams.len() == num_beams {
                break;
            }
        }

        let best_score = candidates.first().map(|c| c.0).unwrap_or(f32::NEG_INFINITY);
        running = next_beams;
        if running.is_empty() || hypotheses.is_done(best_score, step + 1) {
            done = true;
            break;
        }
    }

    if !done {
        for beam in running {
            hypotheses.add(beam.tokens, beam.sum_logprobs);
        }
    }
    hypotheses
        .best()
        .ok_or_else(|| GenerationError::InvalidLogits("beam search produced no hypothesis".to_string()))
}
