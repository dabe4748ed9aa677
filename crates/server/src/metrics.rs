//! Aggregate serving metrics and their Prometheus rendering

use std::time::Instant;

use crate::slot::Slot;

/// Counters the scheduler maintains; bucketed values reset on every
/// `/metrics` scrape, totals never do
#[derive(Debug)]
pub struct ServerMetrics {
    pub t_start: Instant,

    pub n_prompt_tokens_processed_total: u64,
    pub t_prompt_processing_total_ms: f64,
    pub n_tokens_predicted_total: u64,
    pub t_tokens_generation_total_ms: f64,

    pub n_prompt_tokens_processed: u64,
    pub t_prompt_processing_ms: f64,
    pub n_tokens_predicted: u64,
    pub t_tokens_generation_ms: f64,

    pub n_decode_total: u64,
    pub n_busy_slots_total: u64,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            t_start: Instant::now(),
            n_prompt_tokens_processed_total: 0,
            t_prompt_processing_total_ms: 0.0,
            n_tokens_predicted_total: 0,
            t_tokens_generation_total_ms: 0.0,
            n_prompt_tokens_processed: 0,
            t_prompt_processing_ms: 0.0,
            n_tokens_predicted: 0,
            t_tokens_generation_ms: 0.0,
            n_decode_total: 0,
            n_busy_slots_total: 0,
        }
    }
}

impl ServerMetrics {
    pub fn on_prompt_eval(&mut self, slot: &Slot) {
        self.n_prompt_tokens_processed_total += slot.n_prompt_tokens_processed as u64;
        self.n_prompt_tokens_processed += slot.n_prompt_tokens_processed as u64;
        self.t_prompt_processing_total_ms += slot.t_prompt_processing_ms;
        self.t_prompt_processing_ms += slot.t_prompt_processing_ms;
    }

    pub fn on_prediction(&mut self, slot: &Slot) {
        self.n_tokens_predicted_total += slot.n_decoded.max(0) as u64;
        self.n_tokens_predicted += slot.n_decoded.max(0) as u64;
        self.t_tokens_generation_total_ms += slot.t_token_generation_ms;
        self.t_tokens_generation_ms += slot.t_token_generation_ms;
    }

    pub fn on_decoded(&mut self, busy_slots: usize) {
        self.n_decode_total += 1;
        self.n_busy_slots_total += busy_slots as u64;
    }

    pub fn reset_bucket(&mut self) {
        self.n_prompt_tokens_processed = 0;
        self.t_prompt_processing_ms = 0.0;
        self.n_tokens_predicted = 0;
        self.t_tokens_generation_ms = 0.0;
    }

    /// Render the Prometheus text exposition
    pub fn render_prometheus(&self, idle_slots: usize, processing_slots: usize, queued: usize) -> String {
        let mut out = String::new();

        let counters: &[(&str, &str, f64)] = &[
            (
                "prompt_tokens_total",
                "Number of prompt tokens processed.",
                self.n_prompt_tokens_processed_total as f64,
            ),
            (
                "prompt_seconds_total",
                "Prompt process time.",
                self.t_prompt_processing_total_ms / 1e3,
            ),
            (
                "tokens_predicted_total",
                "Number of generation tokens processed.",
                self.n_tokens_predicted_total as f64,
            ),
            (
                "tokens_predicted_seconds_total",
                "Predict process time.",
                self.t_tokens_generation_total_ms / 1e3,
            ),
            (
                "n_decode_total",
                "Total number of decode calls.",
                self.n_decode_total as f64,
            ),
            (
                "n_busy_slots_per_decode",
                "Average number of busy slots per decode call.",
                self.n_busy_slots_total as f64 / self.n_decode_total.max(1) as f64,
            ),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP ringlm:{name} {help}\n# TYPE ringlm:{name} counter\nringlm:{name} {value}\n"
            ));
        }

        let gauges: &[(&str, &str, f64)] = &[
            (
                "prompt_tokens_seconds",
                "Average prompt throughput in tokens/s.",
                if self.t_prompt_processing_ms > 0.0 {
                    1e3 / self.t_prompt_processing_ms * self.n_prompt_tokens_processed as f64
                } else {
                    0.0
                },
            ),
            (
                "predicted_tokens_seconds",
                "Average generation throughput in tokens/s.",
                if self.t_tokens_generation_ms > 0.0 {
                    1e3 / self.t_tokens_generation_ms * self.n_tokens_predicted as f64
                } else {
                    0.0
                },
            ),
            (
                "slots_idle",
                "Number of idle slots.",
                idle_slots as f64,
            ),
            (
                "slots_processing",
                "Number of slots processing.",
                processing_slots as f64,
            ),
            (
                "requests_deferred",
                "Number of requests deferred.",
                queued as f64,
            ),
        ];
        for (name, help, value) in gauges {
            out.push_str(&format!(
                "# HELP ringlm:{name} {help}\n# TYPE ringlm:{name} gauge\nringlm:{name} {value}\n"
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_reset_keeps_totals() {
        let mut metrics = ServerMetrics::default();
        let mut slot = Slot::new(0, 1, 512);
        slot.n_prompt_tokens_processed = 10;
        slot.t_prompt_processing_ms = 50.0;

        metrics.on_prompt_eval(&slot);
        assert_eq!(metrics.n_prompt_tokens_processed, 10);

        metrics.reset_bucket();
        assert_eq!(metrics.n_prompt_tokens_processed, 0);
        assert_eq!(metrics.n_prompt_tokens_processed_total, 10);
    }

    #[test]
    fn test_prometheus_shape() {
        let metrics = ServerMetrics::default();
        let text = metrics.render_prometheus(3, 1, 0);
        assert!(text.contains("# TYPE ringlm:prompt_tokens_total counter"));
        assert!(text.contains("ringlm:slots_idle 3"));
        assert!(text.contains("# HELP ringlm:requests_deferred"));
    }
}
