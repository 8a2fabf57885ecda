use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::types::TokenId;

/// Sampling parameters carried by every request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SamplingConfig {
    /// Softmax temperature; 0 selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens; 0 disables the filter.
    #[serde(default)]
    pub top_k: u32,
    /// Nucleus sampling mass; 1.0 disables the filter.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Seed for reproducible sampling. Defaults to the request id.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Keep generating past the EOS token.
    #[serde(default)]
    pub ignore_eos: bool,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: 0,
            top_p: default_top_p(),
            random_seed: None,
            ignore_eos: false,
        }
    }
}

/// Applies a `SamplingConfig` to a logits row and draws the next token.
///
/// One sampler lives on each request so draws are reproducible per
/// request regardless of batch composition.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self, logits: &[f32], config: &SamplingConfig) -> TokenId {
        debug_assert!(!logits.is_empty());
        if config.temperature <= 0.0 {
            return argmax(logits);
        }

        let mut candidates: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(token, logit)| (token as TokenId, *logit / config.temperature))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if config.top_k > 0 {
            candidates.truncate(config.top_k as usize);
        }

        // Softmax over the surviving candidates, in sorted order so the
        // nucleus cut-off is a simple prefix.
        let max_logit = candidates[0].1;
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|(_, logit)| (logit - max_logit).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        if config.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= config.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
            probs.truncate(keep);
        }

        let total: f32 = probs.iter().sum();
        let mut draw = self.rng.gen::<f32>() * total;
        for ((token, _), p) in candidates.iter().zip(probs.iter()) {
            if draw < *p {
                return *token;
            }
            draw -= p;
        }
        candidates[candidates.len() - 1].0
    }
}

fn argmax(logits: &[f32]) -> TokenId {
    let mut best = 0usize;
    for (i, logit) in logits.iter().enumerate() {
        if *logit > logits[best] {
            best = i;
        }
    }
    best as TokenId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_the_argmax() {
        let mut sampler = Sampler::new(42);
        let config = SamplingConfig {
            temperature: 0.0,
            ..Default::default()
        };
        let logits = vec![0.1, 3.0, -1.0, 2.9];
        assert_eq!(sampler.sample(&logits, &config), 1);
    }

    #[test]
    fn top_k_one_is_greedy() {
        let mut sampler = Sampler::new(7);
        let config = SamplingConfig {
            temperature: 0.7,
            top_k: 1,
            ..Default::default()
        };
        let logits = vec![-2.0, 0.5, 4.0, 1.0];
        for _ in 0..16 {
            assert_eq!(sampler.sample(&logits, &config), 2);
        }
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let config = SamplingConfig::default();
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32 * 0.3).collect();
        let a: Vec<TokenId> = {
            let mut s = Sampler::new(99);
            (0..8).map(|_| s.sample(&logits, &config)).collect()
        };
        let b: Vec<TokenId> = {
            let mut s = Sampler::new(99);
            (0..8).map(|_| s.sample(&logits, &config)).collect()
        };
        assert_eq!(a, b);
    }
}
