//! Token sampling: temperature, nucleus (top-p) and greedy decoding

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use meshlm_core::GenerationConfig;

/// Softmax of `logits / temperature`
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| ((l - max) / t).exp()).collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }
    probs
}

/// Numerically stable log-softmax
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|&l| l - log_sum).collect()
}

/// Index of the largest value (first on ties)
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Nucleus sampling
///
/// Sorts probabilities in descending order and keeps tokens while the mass
/// before them is at most `p`, so the most likely token always survives.
/// The kept mass is renormalised before drawing.
pub fn sample_top_p<R: Rng>(probs: &[f32], p: f32, rng: &mut R) -> usize {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut kept = Vec::with_capacity(order.len());
    let mut cumsum = 0.0f32;
    for &idx in &order {
        if cumsum > p {
            break;
        }
        cumsum += probs[idx];
        kept.push(idx);
    }

    let total: f32 = kept.iter().map(|&i| probs[i]).sum();
    let mut target = rng.gen::<f32>() * total;
    for &idx in &kept {
        target -= probs[idx];
        if target <= 0.0 {
            return idx;
        }
    }
    kept.last().copied().unwrap_or(0)
}

/// Seeded sampler for one generation request
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: ChaCha20Rng,
}

impl Sampler {
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::new(config.temperature, config.top_p, config.seed)
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Pick the next token from a row of logits
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if self.is_greedy() {
            return argmax(logits) as u32;
        }
        let probs = softmax(logits, self.temperature);
        sample_top_p(&probs, self.top_p, &mut self.rng) as u32
    }
}
