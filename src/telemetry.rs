//! Telemetry metric name constants and bucket tables.
//!
//! Centralised metric names for the proxy. Names carry the `vllm:` prefix
//! so dashboards and alerts written against vLLM's own exporter work against
//! the proxy unchanged.
//!
//! The [`Recorder`](crate::Recorder) is the source of truth for these
//! metrics. Every update is also emitted through the `metrics` facade under
//! the same names; without a facade recorder installed those calls are no-ops.
//!
//! # Metric naming conventions
//!
//! Counters end in `_total`, latency histograms use `_seconds`.
//!
//! # Common labels
//!
//! - `model_name`: served model name (from configuration)
//! - `engine`: engine label (from configuration, e.g. "vllm")
//! - `status`: request outcome: "success", "error", "canceled" or "rejected"

/// Requests currently holding a concurrency slot.
///
/// Labels: `model_name`, `engine`.
pub const NUM_REQUESTS_RUNNING: &str = "vllm:num_requests_running";

/// Requests suspended in the admission queue.
///
/// Labels: `model_name`, `engine`.
pub const NUM_REQUESTS_WAITING: &str = "vllm:num_requests_waiting";

/// Time spent waiting for a concurrency slot, in seconds.
///
/// Labels: `model_name`, `engine`.
pub const REQUEST_QUEUE_TIME_SECONDS: &str = "vllm:request_queue_time_seconds";

/// Time from admission to the first streamed chunk, in seconds.
///
/// Labels: `model_name`, `engine`.
pub const TIME_TO_FIRST_TOKEN_SECONDS: &str = "vllm:time_to_first_token_seconds";

/// Time from admission to finalization, in seconds.
///
/// Labels: `model_name`, `engine`.
pub const REQUEST_INFERENCE_TIME_SECONDS: &str = "vllm:request_inference_time_seconds";

/// Time from arrival to finalization, in seconds.
///
/// Labels: `model_name`, `engine`.
pub const E2E_REQUEST_LATENCY_SECONDS: &str = "vllm:e2e_request_latency_seconds";

/// Finalized requests by outcome.
///
/// Labels: `model_name`, `engine`, `status`.
pub const REQUEST_SUCCESS_TOTAL: &str = "vllm:request_success_total";

/// Prompt tokens reported by the upstream.
///
/// Labels: `model_name`, `engine`.
pub const PROMPT_TOKENS_TOTAL: &str = "vllm:prompt_tokens_total";

/// Completion tokens reported by the upstream.
///
/// Labels: `model_name`, `engine`.
pub const GENERATION_TOKENS_TOTAL: &str = "vllm:generation_tokens_total";

/// Prompt tokens per request.
///
/// Labels: `model_name`, `engine`.
pub const REQUEST_PROMPT_TOKENS: &str = "vllm:request_prompt_tokens";

/// Completion tokens per request.
///
/// Labels: `model_name`, `engine`.
pub const REQUEST_GENERATION_TOKENS: &str = "vllm:request_generation_tokens";

/// Label carrying the served model name.
pub const LABEL_MODEL_NAME: &str = "model_name";

/// Label carrying the engine name.
pub const LABEL_ENGINE: &str = "engine";

/// Label carrying the request outcome.
pub const LABEL_STATUS: &str = "status";

/// Queue-time buckets (seconds).
pub const QUEUE_TIME_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
    300.0,
];

/// Time-to-first-token buckets (seconds).
pub const TTFT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.02, 0.04, 0.06, 0.08, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
    20.0, 40.0, 80.0, 160.0, 640.0, 2560.0,
];

/// Whole-request latency buckets (seconds), used for inference and e2e time.
pub const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.3, 0.5, 0.8, 1.0, 1.5, 2.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0, 40.0, 50.0, 60.0, 120.0,
    240.0, 480.0, 960.0, 1920.0, 7680.0,
];

/// Bucket bounds following the 1-2-5 series up to and including `max_value`.
///
/// `build_1_2_5_buckets(100)` → `[1, 2, 5, 10, 20, 50, 100]`.
pub fn build_1_2_5_buckets(max_value: u64) -> Vec<f64> {
    let mut buckets = Vec::new();
    let mut magnitude: u64 = 1;
    loop {
        for mantissa in [1, 2, 5] {
            let Some(value) = magnitude.checked_mul(mantissa) else {
                return buckets;
            };
            if value > max_value {
                return buckets;
            }
            buckets.push(value as f64);
        }
        match magnitude.checked_mul(10) {
            Some(next) => magnitude = next,
            None => return buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_two_five_series() {
        assert_eq!(
            build_1_2_5_buckets(100),
            vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]
        );
        assert_eq!(build_1_2_5_buckets(8192).last(), Some(&5000.0));
        assert_eq!(build_1_2_5_buckets(1), vec![1.0]);
        assert!(build_1_2_5_buckets(0).is_empty());
    }

    #[test]
    fn one_two_five_series_does_not_overflow() {
        let buckets = build_1_2_5_buckets(u64::MAX);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn default_tables_are_ascending() {
        for table in [QUEUE_TIME_BUCKETS, TTFT_BUCKETS, REQUEST_LATENCY_BUCKETS] {
            assert!(table.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
