//! The metrics recorder: one proxy instance's full telemetry catalog.
//!
//! [`Recorder`] owns every metric family (see [`telemetry`] for the names)
//! and exposes the request lifecycle hooks the admission controller and
//! forwarding pipeline call at each transition:
//!
//! ```text
//! on_request_queued ──► on_request_admitted ─┬─► on_first_token ──► on_request_finalized
//!        │             on_request_started ───┘   (streams only)
//!        │             (free slot, no queueing)
//!        └──────────────► on_queue_abandoned (canceled / timed out while queued)
//! ```
//!
//! Hooks take [`Duration`]s and unsigned token counts, so negative inputs
//! cannot reach the primitives; the primitives still reject malformed raw
//! values themselves. [`snapshot()`](Recorder::snapshot) may be called at any
//! time from any thread without coordinating with in-flight requests.
//!
//! Each update is mirrored to the `metrics` facade so an application that
//! installs its own exporter sees the same series.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::Result;
use crate::primitives::{
    Buckets, Counter, Family, Gauge, Histogram, HistogramSnapshot, LabeledSnapshot,
};
use crate::telemetry::{self, LABEL_ENGINE, LABEL_MODEL_NAME, LABEL_STATUS};

/// Default engine label.
pub const DEFAULT_ENGINE: &str = "vllm";

/// Default maximum context length used for token histogram buckets.
pub const DEFAULT_MAX_MODEL_LEN: u64 = 8192;

/// Outcome a request is finalized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Upstream answered with a 2xx and the body was fully relayed.
    Success,
    /// Upstream failure: transport error, timeout, or non-2xx response.
    Error,
    /// The caller went away before the request finished.
    Canceled,
    /// No concurrency slot became free within the queue timeout.
    Rejected,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Success,
        RequestStatus::Error,
        RequestStatus::Canceled,
        RequestStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Canceled => "canceled",
            RequestStatus::Rejected => "rejected",
        }
    }

    fn index(self) -> usize {
        match self {
            RequestStatus::Success => 0,
            RequestStatus::Error => 1,
            RequestStatus::Canceled => 2,
            RequestStatus::Rejected => 3,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a [`Recorder`].
///
/// ```rust
/// # use huginn::RecorderConfig;
/// let config = RecorderConfig::new()
///     .model_name("llama-3-8b")
///     .engine("vllm")
///     .max_model_len(32_768);
/// ```
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Value of the `model_name` label. Default: "unknown".
    pub model_name: String,
    /// Value of the `engine` label. Default: "vllm".
    pub engine: String,
    /// Maximum context length; bounds the token-count histogram buckets.
    /// Default: 8192.
    pub max_model_len: u64,
    /// Override for the inference/e2e latency buckets (seconds).
    pub latency_buckets: Option<Vec<f64>>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            model_name: "unknown".to_string(),
            engine: DEFAULT_ENGINE.to_string(),
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            latency_buckets: None,
        }
    }
}

impl RecorderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn max_model_len(mut self, len: u64) -> Self {
        self.max_model_len = len;
        self
    }

    pub fn latency_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.latency_buckets = Some(buckets);
        self
    }
}

/// Everything [`Recorder::on_request_finalized`] records for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedRequest {
    pub status: RequestStatus,
    /// Admission to completion.
    pub inference_time: Duration,
    /// Arrival to completion.
    pub e2e_latency: Duration,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Pre-resolved instances for this recorder's `(model_name, engine)` tuple.
struct Handles {
    running: Arc<Gauge>,
    waiting: Arc<Gauge>,
    queue_time: Arc<Histogram>,
    ttft: Arc<Histogram>,
    inference_time: Arc<Histogram>,
    e2e_latency: Arc<Histogram>,
    request_prompt_tokens: Arc<Histogram>,
    request_generation_tokens: Arc<Histogram>,
    prompt_tokens: Arc<Counter>,
    generation_tokens: Arc<Counter>,
    by_status: [Arc<Counter>; 4],
}

/// Single source of truth for the proxy's telemetry.
pub struct Recorder {
    model_name: String,
    engine: String,
    running: Family<Gauge>,
    waiting: Family<Gauge>,
    queue_time: Family<Histogram>,
    ttft: Family<Histogram>,
    inference_time: Family<Histogram>,
    e2e_latency: Family<Histogram>,
    request_prompt_tokens: Family<Histogram>,
    request_generation_tokens: Family<Histogram>,
    request_success: Family<Counter>,
    prompt_tokens: Family<Counter>,
    generation_tokens: Family<Counter>,
    handles: Handles,
    facade_labels: Vec<metrics::Label>,
}

const BASE_LABELS: &[&str] = &[LABEL_MODEL_NAME, LABEL_ENGINE];
const STATUS_LABELS: &[&str] = &[LABEL_MODEL_NAME, LABEL_ENGINE, LABEL_STATUS];

fn histogram_family(buckets: &Buckets) -> Family<Histogram> {
    let buckets = buckets.clone();
    Family::with_constructor(BASE_LABELS, move || Histogram::new(buckets.clone()))
}

impl Recorder {
    /// Build the metric catalog.
    ///
    /// Bucket layouts are derived from `config` here and fixed afterwards.
    /// Fails with `InvalidArgument` for a zero `max_model_len` or a malformed
    /// latency bucket override.
    pub fn new(config: RecorderConfig) -> Result<Self> {
        if config.max_model_len == 0 {
            return Err(crate::HuginnError::InvalidArgument(
                "max_model_len must be at least 1".to_string(),
            ));
        }
        let latency = Buckets::new(
            config
                .latency_buckets
                .clone()
                .unwrap_or_else(|| telemetry::REQUEST_LATENCY_BUCKETS.to_vec()),
        )?;
        let queue = Buckets::new(telemetry::QUEUE_TIME_BUCKETS)?;
        let ttft = Buckets::new(telemetry::TTFT_BUCKETS)?;
        let tokens = Buckets::new(telemetry::build_1_2_5_buckets(config.max_model_len))?;

        let running = Family::<Gauge>::new(BASE_LABELS);
        let waiting = Family::<Gauge>::new(BASE_LABELS);
        let queue_time = histogram_family(&queue);
        let ttft = histogram_family(&ttft);
        let inference_time = histogram_family(&latency);
        let e2e_latency = histogram_family(&latency);
        let request_prompt_tokens = histogram_family(&tokens);
        let request_generation_tokens = histogram_family(&tokens);
        let request_success = Family::<Counter>::new(STATUS_LABELS);
        let prompt_tokens = Family::<Counter>::new(BASE_LABELS);
        let generation_tokens = Family::<Counter>::new(BASE_LABELS);

        let base = [config.model_name.as_str(), config.engine.as_str()];
        let status = |s: RequestStatus| {
            request_success.for_labels(&[base[0], base[1], s.as_str()])
        };
        let handles = Handles {
            running: running.for_labels(&base)?,
            waiting: waiting.for_labels(&base)?,
            queue_time: queue_time.for_labels(&base)?,
            ttft: ttft.for_labels(&base)?,
            inference_time: inference_time.for_labels(&base)?,
            e2e_latency: e2e_latency.for_labels(&base)?,
            request_prompt_tokens: request_prompt_tokens.for_labels(&base)?,
            request_generation_tokens: request_generation_tokens.for_labels(&base)?,
            prompt_tokens: prompt_tokens.for_labels(&base)?,
            generation_tokens: generation_tokens.for_labels(&base)?,
            by_status: [
                status(RequestStatus::Success)?,
                status(RequestStatus::Error)?,
                status(RequestStatus::Canceled)?,
                status(RequestStatus::Rejected)?,
            ],
        };

        let facade_labels = vec![
            metrics::Label::new(LABEL_MODEL_NAME, config.model_name.clone()),
            metrics::Label::new(LABEL_ENGINE, config.engine.clone()),
        ];

        Ok(Self {
            model_name: config.model_name,
            engine: config.engine,
            running,
            waiting,
            queue_time,
            ttft,
            inference_time,
            e2e_latency,
            request_prompt_tokens,
            request_generation_tokens,
            request_success,
            prompt_tokens,
            generation_tokens,
            handles,
            facade_labels,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    // ========================================================================
    // Lifecycle hooks
    // ========================================================================

    /// A request started waiting for a concurrency slot.
    pub fn on_request_queued(&self) {
        self.handles.waiting.inc();
        self.mirror_gauges();
    }

    /// A queued request was granted a slot after waiting `queue_duration`.
    pub fn on_request_admitted(&self, queue_duration: Duration) {
        self.handles.waiting.dec();
        self.handles.running.inc();
        self.handles.queue_time.observe_duration(queue_duration);
        self.mirror_gauges();
        metrics::histogram!(telemetry::REQUEST_QUEUE_TIME_SECONDS, self.facade_labels.clone())
            .record(queue_duration.as_secs_f64());
    }

    /// A request took a free slot without queueing.
    ///
    /// Counts as admitted with zero queue time; the waiting gauge is never
    /// touched.
    pub fn on_request_started(&self) {
        self.handles.running.inc();
        self.handles.queue_time.observe_duration(Duration::ZERO);
        self.mirror_gauges();
        metrics::histogram!(telemetry::REQUEST_QUEUE_TIME_SECONDS, self.facade_labels.clone())
            .record(0.0);
    }

    /// First chunk of a streaming response arrived `ttft` after admission.
    ///
    /// Callers invoke this at most once per request; the pipeline's request
    /// timings enforce that.
    pub fn on_first_token(&self, ttft: Duration) {
        self.handles.ttft.observe_duration(ttft);
        metrics::histogram!(telemetry::TIME_TO_FIRST_TOKEN_SECONDS, self.facade_labels.clone())
            .record(ttft.as_secs_f64());
    }

    /// An admitted request finished, by whatever exit path.
    pub fn on_request_finalized(&self, request: &FinalizedRequest) {
        let h = &self.handles;
        h.running.dec();
        h.by_status[request.status.index()].inc();
        h.inference_time.observe_duration(request.inference_time);
        h.e2e_latency.observe_duration(request.e2e_latency);
        h.prompt_tokens.inc_by(request.prompt_tokens);
        h.generation_tokens.inc_by(request.completion_tokens);
        h.request_prompt_tokens
            .observe_count(request.prompt_tokens);
        h.request_generation_tokens
            .observe_count(request.completion_tokens);

        self.mirror_gauges();
        self.mirror_status(request.status);
        let labels = || self.facade_labels.clone();
        metrics::histogram!(telemetry::REQUEST_INFERENCE_TIME_SECONDS, labels())
            .record(request.inference_time.as_secs_f64());
        metrics::histogram!(telemetry::E2E_REQUEST_LATENCY_SECONDS, labels())
            .record(request.e2e_latency.as_secs_f64());
        metrics::counter!(telemetry::PROMPT_TOKENS_TOTAL, labels())
            .increment(request.prompt_tokens);
        metrics::counter!(telemetry::GENERATION_TOKENS_TOTAL, labels())
            .increment(request.completion_tokens);
        metrics::histogram!(telemetry::REQUEST_PROMPT_TOKENS, labels())
            .record(request.prompt_tokens as f64);
        metrics::histogram!(telemetry::REQUEST_GENERATION_TOKENS, labels())
            .record(request.completion_tokens as f64);
    }

    /// A queued request left the queue without ever being admitted.
    ///
    /// Counts the outcome but leaves the running gauge and the latency
    /// histograms alone.
    pub fn on_queue_abandoned(&self, status: RequestStatus) {
        self.handles.waiting.dec();
        self.handles.by_status[status.index()].inc();
        self.mirror_gauges();
        self.mirror_status(status);
    }

    fn mirror_gauges(&self) {
        metrics::gauge!(telemetry::NUM_REQUESTS_RUNNING, self.facade_labels.clone())
            .set(self.handles.running.get());
        metrics::gauge!(telemetry::NUM_REQUESTS_WAITING, self.facade_labels.clone())
            .set(self.handles.waiting.get());
    }

    fn mirror_status(&self, status: RequestStatus) {
        let mut labels = self.facade_labels.clone();
        labels.push(metrics::Label::new(LABEL_STATUS, status.as_str()));
        metrics::counter!(telemetry::REQUEST_SUCCESS_TOTAL, labels).increment(1);
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Current value of the running gauge.
    pub fn running(&self) -> f64 {
        self.handles.running.get()
    }

    /// Current value of the waiting gauge.
    pub fn waiting(&self) -> f64 {
        self.handles.waiting.get()
    }

    /// Immutable structured view of every metric family.
    ///
    /// Each value is read atomically; the snapshot as a whole is not a
    /// transaction across families.
    pub fn snapshot(&self) -> RecorderSnapshot {
        let families = vec![
            scalar_family(
                telemetry::NUM_REQUESTS_RUNNING,
                "Number of requests currently holding a concurrency slot.",
                MetricKind::Gauge,
                BASE_LABELS,
                self.running.snapshot(),
            ),
            scalar_family(
                telemetry::NUM_REQUESTS_WAITING,
                "Number of requests waiting for a concurrency slot.",
                MetricKind::Gauge,
                BASE_LABELS,
                self.waiting.snapshot(),
            ),
            histogram_snapshot(
                telemetry::REQUEST_QUEUE_TIME_SECONDS,
                "Time spent waiting for a concurrency slot in seconds.",
                self.queue_time.snapshot(),
            ),
            histogram_snapshot(
                telemetry::TIME_TO_FIRST_TOKEN_SECONDS,
                "Time from admission to the first streamed chunk in seconds.",
                self.ttft.snapshot(),
            ),
            histogram_snapshot(
                telemetry::REQUEST_INFERENCE_TIME_SECONDS,
                "Time from admission to completion in seconds.",
                self.inference_time.snapshot(),
            ),
            histogram_snapshot(
                telemetry::E2E_REQUEST_LATENCY_SECONDS,
                "Time from arrival to completion in seconds.",
                self.e2e_latency.snapshot(),
            ),
            scalar_family(
                telemetry::REQUEST_SUCCESS_TOTAL,
                "Count of finalized requests by status.",
                MetricKind::Counter,
                STATUS_LABELS,
                self.request_success.snapshot(),
            ),
            scalar_family(
                telemetry::PROMPT_TOKENS_TOTAL,
                "Number of prompt tokens processed.",
                MetricKind::Counter,
                BASE_LABELS,
                self.prompt_tokens.snapshot(),
            ),
            scalar_family(
                telemetry::GENERATION_TOKENS_TOTAL,
                "Number of generation tokens processed.",
                MetricKind::Counter,
                BASE_LABELS,
                self.generation_tokens.snapshot(),
            ),
            histogram_snapshot(
                telemetry::REQUEST_PROMPT_TOKENS,
                "Number of prefill tokens processed per request.",
                self.request_prompt_tokens.snapshot(),
            ),
            histogram_snapshot(
                telemetry::REQUEST_GENERATION_TOKENS,
                "Number of generation tokens processed per request.",
                self.request_generation_tokens.snapshot(),
            ),
        ];
        RecorderSnapshot { families }
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("model_name", &self.model_name)
            .field("engine", &self.engine)
            .field("running", &self.running())
            .field("waiting", &self.waiting())
            .finish()
    }
}

fn label_map(names: &[&str], values: Vec<String>) -> BTreeMap<String, String> {
    names
        .iter()
        .map(|n| (*n).to_string())
        .zip(values)
        .collect()
}

fn scalar_family(
    name: &'static str,
    help: &'static str,
    kind: MetricKind,
    label_names: &[&str],
    members: Vec<LabeledSnapshot<f64>>,
) -> FamilySnapshot {
    FamilySnapshot {
        name,
        help,
        kind,
        samples: members
            .into_iter()
            .map(|m| Sample {
                labels: label_map(label_names, m.labels),
                value: SampleValue::Scalar(m.value),
            })
            .collect(),
    }
}

fn histogram_snapshot(
    name: &'static str,
    help: &'static str,
    members: Vec<LabeledSnapshot<HistogramSnapshot>>,
) -> FamilySnapshot {
    FamilySnapshot {
        name,
        help,
        kind: MetricKind::Histogram,
        samples: members
            .into_iter()
            .map(|m| Sample {
                labels: label_map(BASE_LABELS, m.labels),
                value: SampleValue::Histogram(m.value),
            })
            .collect(),
    }
}

// ============================================================================
// Snapshot types
// ============================================================================

/// Kind of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Value of one labeled series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleValue {
    Scalar(f64),
    Histogram(HistogramSnapshot),
}

/// One labeled series within a family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: SampleValue,
}

impl Sample {
    fn matches(&self, labels: &[(&str, &str)]) -> bool {
        labels
            .iter()
            .all(|(k, v)| self.labels.get(*k).is_some_and(|actual| actual == v))
    }
}

/// One metric family with all its series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilySnapshot {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

/// Immutable point-in-time copy of a [`Recorder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderSnapshot {
    pub families: Vec<FamilySnapshot>,
}

impl RecorderSnapshot {
    pub fn family(&self, name: &str) -> Option<&FamilySnapshot> {
        self.families.iter().find(|f| f.name == name)
    }

    /// Value of the first counter/gauge series of `name` carrying all `labels`.
    pub fn scalar(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.family(name)?
            .samples
            .iter()
            .filter(|s| s.matches(labels))
            .find_map(|s| match s.value {
                SampleValue::Scalar(v) => Some(v),
                SampleValue::Histogram(_) => None,
            })
    }

    /// The first histogram series of `name` carrying all `labels`.
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<&HistogramSnapshot> {
        self.family(name)?
            .samples
            .iter()
            .filter(|s| s.matches(labels))
            .find_map(|s| match &s.value {
                SampleValue::Histogram(h) => Some(h),
                SampleValue::Scalar(_) => None,
            })
    }

    /// Requests finalized with `status`.
    pub fn requests_with_status(&self, status: RequestStatus) -> f64 {
        self.scalar(
            telemetry::REQUEST_SUCCESS_TOTAL,
            &[(LABEL_STATUS, status.as_str())],
        )
        .unwrap_or(0.0)
    }
}
