//! Token sampling
//!
//! A pure function from logits plus per-slot state to the next token. The
//! chain follows the completion API's knobs: repetition penalties, then
//! the truncation samplers in a configurable order, then temperature and
//! the final draw (or mirostat, which replaces the truncation chain).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ringlm_model::Token;

/// Seed value meaning "pick one at process entropy"
pub const SEED_RANDOM: i64 = -1;

/// Everything a request can say about sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub seed: i64,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub repeat_last_n: i32,
    pub penalize_nl: bool,
    pub n_probs: usize,
    pub logit_bias: Vec<(Token, f32)>,
    /// Byte-allowlist grammar; empty means unconstrained
    pub grammar: String,
    /// Truncation sampler order; empty means the default chain
    pub samplers: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: SEED_RANDOM,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            tfs_z: 1.0,
            typical_p: 1.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repeat_last_n: 64,
            penalize_nl: false,
            n_probs: 0,
            logit_bias: Vec::new(),
            grammar: String::new(),
            samplers: Vec::new(),
        }
    }
}

fn get_f32(data: &Value, key: &str, default: f32) -> f32 {
    data.get(key).and_then(Value::as_f64).map(|v| v as f32).unwrap_or(default)
}

fn get_i32(data: &Value, key: &str, default: i32) -> i32 {
    data.get(key).and_then(Value::as_i64).map(|v| v as i32).unwrap_or(default)
}

impl SamplingParams {
    /// Pull sampling fields out of a request body, falling back to
    /// `defaults` for anything absent
    pub fn from_json(data: &Value, defaults: &SamplingParams) -> Self {
        let mut params = Self {
            seed: data.get("seed").and_then(Value::as_i64).unwrap_or(defaults.seed),
            temperature: get_f32(data, "temperature", defaults.temperature),
            top_k: get_i32(data, "top_k", defaults.top_k),
            top_p: get_f32(data, "top_p", defaults.top_p),
            min_p: get_f32(data, "min_p", defaults.min_p),
            tfs_z: get_f32(data, "tfs_z", defaults.tfs_z),
            typical_p: get_f32(data, "typical_p", defaults.typical_p),
            mirostat: get_i32(data, "mirostat", defaults.mirostat),
            mirostat_tau: get_f32(data, "mirostat_tau", defaults.mirostat_tau),
            mirostat_eta: get_f32(data, "mirostat_eta", defaults.mirostat_eta),
            repeat_penalty: get_f32(data, "repeat_penalty", defaults.repeat_penalty),
            frequency_penalty: get_f32(data, "frequency_penalty", defaults.frequency_penalty),
            presence_penalty: get_f32(data, "presence_penalty", defaults.presence_penalty),
            repeat_last_n: get_i32(data, "repeat_last_n", defaults.repeat_last_n),
            penalize_nl: data
                .get("penalize_nl")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.penalize_nl),
            n_probs: get_i32(data, "n_probs", defaults.n_probs as i32).max(0) as usize,
            logit_bias: defaults.logit_bias.clone(),
            grammar: data
                .get("grammar")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.grammar)
                .to_string(),
            samplers: data
                .get("samplers")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| defaults.samplers.clone()),
        };

        if let Some(bias) = data.get("logit_bias").and_then(Value::as_array) {
            params.logit_bias = bias
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    let token = pair.first()?.as_u64()? as Token;
                    let value = pair.get(1)?.as_f64()? as f32;
                    Some((token, value))
                })
                .collect();
        }

        params
    }
}

/// One scored vocabulary entry during the chain
#[derive(Debug, Clone, Copy)]
struct Candidate {
    token: Token,
    logit: f32,
    prob: f32,
}

/// Per-slot sampler state
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
    seed_used: u64,
    mirostat_mu: f32,
    /// Accepted tokens, newest last; feeds the penalty window
    history: Vec<Token>,
    /// Probabilities of the last sample, for `n_probs` responses
    last_probs: Vec<(Token, f32)>,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let seed_used = if params.seed == SEED_RANDOM {
            rand::thread_rng().gen()
        } else {
            params.seed as u64
        };
        let mirostat_mu = 2.0 * params.mirostat_tau;
        Self {
            rng: StdRng::seed_from_u64(seed_used),
            seed_used,
            mirostat_mu,
            history: Vec::new(),
            last_probs: Vec::new(),
            params,
        }
    }

    /// The seed actually in use (resolved when `seed == -1`)
    pub fn seed(&self) -> u64 {
        self.seed_used
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Record an accepted token (prompt or generated) for the penalty
    /// window
    pub fn accept(&mut self, token: Token) {
        self.history.push(token);
    }

    /// Probabilities recorded for the most recent `sample` call
    pub fn last_probs(&self) -> &[(Token, f32)] {
        &self.last_probs
    }

    /// Whether a token's bytes all pass the grammar allowlist
    pub fn grammar_accepts(&self, bytes: &[u8]) -> bool {
        if self.params.grammar.is_empty() || bytes.is_empty() {
            return true;
        }
        bytes
            .iter()
            .all(|b| self.params.grammar.as_bytes().contains(b))
    }

    /// Draw the next token from a logits row
    pub fn sample(&mut self, logits: &[f32]) -> Token {
        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(t, &logit)| Candidate {
                token: t as Token,
                logit,
                prob: 0.0,
            })
            .collect();

        for &(token, bias) in &self.params.logit_bias {
            if let Some(c) = candidates.get_mut(token as usize) {
                c.logit += bias;
            }
        }

        self.apply_penalties(&mut candidates);

        if self.params.mirostat > 0 {
            self.sample_mirostat(&mut candidates)
        } else if self.params.temperature <= 0.0 {
            // greedy
            softmax(&mut candidates);
            self.record_probs(&candidates);
            candidates
                .iter()
                .max_by(|a, b| a.logit.total_cmp(&b.logit))
                .map(|c| c.token)
                .unwrap_or(0)
        } else {
            let order: Vec<&str> = if self.params.samplers.is_empty() {
                vec!["top_k", "tfs_z", "typical_p", "top_p", "min_p", "temperature"]
            } else {
                self.params.samplers.iter().map(String::as_str).collect()
            };
            for name in order {
                match name {
                    "top_k" => apply_top_k(&mut candidates, self.params.top_k),
                    "tfs_z" => apply_tfs(&mut candidates, self.params.tfs_z),
                    "typical_p" => apply_typical(&mut candidates, self.params.typical_p),
                    "top_p" => apply_top_p(&mut candidates, self.params.top_p),
                    "min_p" => apply_min_p(&mut candidates, self.params.min_p),
                    "temperature" => apply_temperature(&mut candidates, self.params.temperature),
                    _ => {}
                }
            }
            softmax(&mut candidates);
            self.record_probs(&candidates);
            self.draw(&candidates)
        }
    }

    fn apply_penalties(&self, candidates: &mut [Candidate]) {
        let window = self.params.repeat_last_n.max(0) as usize;
        if window == 0 {
            return;
        }
        let recent = &self.history[self.history.len().saturating_sub(window)..];
        if recent.is_empty() {
            return;
        }

        let mut counts = std::collections::HashMap::new();
        for &t in recent {
            *counts.entry(t).or_insert(0u32) += 1;
        }

        let newline = b'\n' as u32;
        for (&token, &count) in &counts {
            if !self.params.penalize_nl && token == newline {
                continue;
            }
            let Some(c) = candidates.get_mut(token as usize) else {
                continue;
            };
            if self.params.repeat_penalty != 1.0 {
                if c.logit > 0.0 {
                    c.logit /= self.params.repeat_penalty;
                } else {
                    c.logit *= self.params.repeat_penalty;
                }
            }
            c.logit -= count as f32 * self.params.frequency_penalty;
            c.logit -= self.params.presence_penalty;
        }
    }

    fn sample_mirostat(&mut self, candidates: &mut Vec<Candidate>) -> Token {
        apply_temperature(candidates, self.params.temperature.max(f32::EPSILON));
        softmax(candidates);

        // keep candidates whose surprise is below mu
        let mu = self.mirostat_mu;
        candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));
        let cut = candidates
            .iter()
            .position(|c| -c.prob.max(f32::MIN_POSITIVE).log2() > mu)
            .unwrap_or(candidates.len())
            .max(1);
        candidates.truncate(cut);

        softmax_probs_only(candidates);
        self.record_probs(candidates);
        let token = self.draw(candidates);

        let observed = candidates
            .iter()
            .find(|c| c.token == token)
            .map(|c| -c.prob.max(f32::MIN_POSITIVE).log2())
            .unwrap_or(self.params.mirostat_tau);
        self.mirostat_mu = mu - self.params.mirostat_eta * (observed - self.params.mirostat_tau);

        token
    }

    fn record_probs(&mut self, candidates: &[Candidate]) {
        if self.params.n_probs == 0 {
            self.last_probs.clear();
            return;
        }
        let mut sorted: Vec<(Token, f32)> =
            candidates.iter().map(|c| (c.token, c.prob)).collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted.truncate(self.params.n_probs);
        self.last_probs = sorted;
    }

    fn draw(&mut self, candidates: &[Candidate]) -> Token {
        let total: f32 = candidates.iter().map(|c| c.prob).sum();
        let mut point = self.rng.gen::<f32>() * total;
        for c in candidates {
            point -= c.prob;
            if point <= 0.0 {
                return c.token;
            }
        }
        candidates.last().map(|c| c.token).unwrap_or(0)
    }
}

fn softmax(candidates: &mut [Candidate]) {
    let max = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for c in candidates.iter_mut() {
        c.prob = (c.logit - max).exp();
        sum += c.prob;
    }
    if sum > 0.0 {
        for c in candidates.iter_mut() {
            c.prob /= sum;
        }
    }
}

fn softmax_probs_only(candidates: &mut [Candidate]) {
    let sum: f32 = candidates.iter().map(|c| c.prob).sum();
    if sum > 0.0 {
        for c in candidates.iter_mut() {
            c.prob /= sum;
        }
    }
}

fn apply_top_k(candidates: &mut Vec<Candidate>, k: i32) {
    if k <= 0 || (k as usize) >= candidates.len() {
        return;
    }
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
    candidates.truncate(k as usize);
}

fn apply_top_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 {
        return;
    }
    softmax(candidates);
    candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));
    let mut cum = 0.0f32;
    let mut keep = candidates.len();
    for (i, c) in candidates.iter().enumerate() {
        cum += c.prob;
        if cum >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

fn apply_min_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p <= 0.0 {
        return;
    }
    softmax(candidates);
    let max_prob = candidates.iter().map(|c| c.prob).fold(0.0f32, f32::max);
    let floor = max_prob * p;
    let before = candidates.len();
    candidates.retain(|c| c.prob >= floor);
    if candidates.is_empty() && before > 0 {
        candidates.push(Candidate {
            token: 0,
            logit: 0.0,
            prob: 1.0,
        });
    }
}

fn apply_tfs(candidates: &mut Vec<Candidate>, z: f32) {
    if z >= 1.0 || candidates.len() <= 2 {
        return;
    }
    softmax(candidates);
    candidates.sort_by(|a, b| b.prob.total_cmp(&a.prob));

    // curvature of the probability curve
    let first: Vec<f32> = candidates.windows(2).map(|w| w[0].prob - w[1].prob).collect();
    let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
    let sum: f32 = second.iter().sum();
    if sum > 0.0 {
        for s in second.iter_mut() {
            *s /= sum;
        }
    }

    let mut cum = 0.0f32;
    let mut keep = candidates.len();
    for (i, s) in second.iter().enumerate() {
        cum += s;
        if cum > z {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

fn apply_typical(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 {
        return;
    }
    softmax(candidates);

    let entropy: f32 = candidates
        .iter()
        .filter(|c| c.prob > 0.0)
        .map(|c| -c.prob * c.prob.ln())
        .sum();

    let mut scored: Vec<(f32, Candidate)> = candidates
        .iter()
        .map(|c| {
            let shifted = (-c.prob.max(f32::MIN_POSITIVE).ln() - entropy).abs();
            (shifted, *c)
        })
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cum = 0.0f32;
    let mut keep = scored.len();
    for (i, (_, c)) in scored.iter().enumerate() {
        cum += c.prob;
        if cum >= p {
            keep = i + 1;
            break;
        }
    }
    *candidates = scored
        .into_iter()
        .take(keep.max(1))
        .map(|(_, c)| c)
        .collect();
}

fn apply_temperature(candidates: &mut [Candidate], temperature: f32) {
    if temperature <= 0.0 {
        return;
    }
    for c in candidates.iter_mut() {
        c.logit /= temperature;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn greedy_params() -> SamplingParams {
        SamplingParams {
            temperature: 0.0,
            repeat_penalty: 1.0,
            ..SamplingParams::default()
        }
    }

    #[test]
    fn test_greedy_is_argmax() {
        let mut sampler = Sampler::new(greedy_params());
        let logits = vec![0.1, 2.0, -1.0, 0.5];
        assert_eq!(sampler.sample(&logits), 1);
    }

    #[test]
    fn test_same_seed_same_draws() {
        let params = SamplingParams {
            seed: 42,
            temperature: 1.0,
            repeat_penalty: 1.0,
            ..SamplingParams::default()
        };
        let logits: Vec<f32> = (0..64).map(|i| (i % 7) as f32 * 0.3).collect();

        let run = || {
            let mut s = Sampler::new(params.clone());
            (0..16).map(|_| s.sample(&logits)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_repeat_penalty_discourages_history() {
        let mut params = greedy_params();
        params.repeat_penalty = 10.0;
        let mut sampler = Sampler::new(params);

        let logits = vec![0.0, 1.0, 0.9];
        assert_eq!(sampler.sample(&logits), 1);
        sampler.accept(1);
        // token 1 now heavily penalised, runner-up wins
        assert_eq!(sampler.sample(&logits), 2);
    }

    #[test]
    fn test_top_k_truncates() {
        let mut candidates: Vec<Candidate> = (0..10)
            .map(|i| Candidate {
                token: i,
                logit: i as f32,
                prob: 0.0,
            })
            .collect();
        apply_top_k(&mut candidates, 3);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].token, 9);
    }

    #[test]
    fn test_top_p_keeps_mass() {
        let mut candidates: Vec<Candidate> = vec![
            Candidate { token: 0, logit: 10.0, prob: 0.0 },
            Candidate { token: 1, logit: 1.0, prob: 0.0 },
            Candidate { token: 2, logit: 0.0, prob: 0.0 },
        ];
        apply_top_p(&mut candidates, 0.9);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].token, 0);
    }

    #[test]
    fn test_min_p_floor() {
        let mut candidates: Vec<Candidate> = vec![
            Candidate { token: 0, logit: 5.0, prob: 0.0 },
            Candidate { token: 1, logit: 4.9, prob: 0.0 },
            Candidate { token: 2, logit: -10.0, prob: 0.0 },
        ];
        apply_min_p(&mut candidates, 0.5);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_grammar_allowlist() {
        let params = SamplingParams {
            grammar: "0123456789".to_string(),
            ..greedy_params()
        };
        let sampler = Sampler::new(params);
        assert!(sampler.grammar_accepts(b"42"));
        assert!(!sampler.grammar_accepts(b"4a"));
        assert!(sampler.grammar_accepts(b""));
    }

    #[test]
    fn test_params_from_json() {
        let defaults = SamplingParams::default();
        let body = json!({
            "temperature": 0.2,
            "top_k": 5,
            "seed": 7,
            "logit_bias": [[65, 2.5]],
            "samplers": ["top_k", "temperature"],
        });

        let params = SamplingParams::from_json(&body, &defaults);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_k, 5);
        assert_eq!(params.seed, 7);
        assert_eq!(params.logit_bias, vec![(65, 2.5)]);
        assert_eq!(params.samplers, vec!["top_k", "temperature"]);
        assert_eq!(params.top_p, defaults.top_p);
    }

    #[test]
    fn test_mirostat_runs() {
        let params = SamplingParams {
            mirostat: 2,
            temperature: 1.0,
            seed: 3,
            repeat_penalty: 1.0,
            ..SamplingParams::default()
        };
        let mut sampler = Sampler::new(params);
        let logits: Vec<f32> = (0..32).map(|i| -(i as f32) * 0.1).collect();
        for _ in 0..8 {
            let t = sampler.sample(&logits);
            assert!((t as usize) < 32);
            sampler.accept(t);
        }
    }
}
