//! Builder for assembling a proxy instance

use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::admission::AdmissionController;
use crate::pipeline::Forwarder;
use crate::recorder::{Recorder, RecorderConfig};
use crate::upstream::{HttpUpstream, Upstream, UpstreamConfig};

/// Default concurrency limit.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Default deadline from admission to the end of the response body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Main entry point for creating proxy instances.
pub struct Huginn;

impl Huginn {
    /// Create a new builder for configuring the proxy.
    pub fn builder() -> HuginnBuilder {
        HuginnBuilder::new()
    }
}

/// Builder for configuring proxy instances.
///
/// ```rust,no_run
/// # use huginn::Huginn;
/// # fn main() -> huginn::Result<()> {
/// let forwarder = Huginn::builder()
///     .upstream_url("http://127.0.0.1:8001")
///     .model_name("llama-3-8b")
///     .max_concurrency(16)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct HuginnBuilder {
    upstream_config: UpstreamConfig,
    upstream: Option<Arc<dyn Upstream>>,
    recorder_config: RecorderConfig,
    max_concurrency: usize,
    queue_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl HuginnBuilder {
    pub fn new() -> Self {
        Self {
            upstream_config: UpstreamConfig::default(),
            upstream: None,
            recorder_config: RecorderConfig::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENT_REQUESTS,
            queue_timeout: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Base URL of the upstream inference server.
    pub fn upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_config.base_url = url.into();
        self
    }

    /// Full upstream connection settings (replaces `upstream_url`).
    pub fn upstream_config(mut self, config: UpstreamConfig) -> Self {
        self.upstream_config = config;
        self
    }

    /// Use a custom upstream instead of the HTTP client.
    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Full recorder settings (labels and bucket sizing).
    pub fn recorder_config(mut self, config: RecorderConfig) -> Self {
        self.recorder_config = config;
        self
    }

    /// `model_name` label attached to every metric.
    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.recorder_config.model_name = name.into();
        self
    }

    /// `engine` label attached to every metric.
    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.recorder_config.engine = engine.into();
        self
    }

    /// Maximum requests in flight to the upstream. Zero fails at build.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Give up waiting for a slot after this long (default: wait forever).
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    /// Overall deadline per request, or `None` to disable it.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the forwarder.
    pub fn build(self) -> Result<Forwarder> {
        let recorder = Arc::new(Recorder::new(self.recorder_config)?);
        let controller = AdmissionController::new(recorder, self.max_concurrency)?;

        let upstream: Arc<dyn Upstream> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(HttpUpstream::new(self.upstream_config)?),
        };

        Ok(Forwarder::new(controller, upstream)
            .queue_timeout(self.queue_timeout)
            .request_timeout(self.request_timeout))
    }
}

impl Default for HuginnBuilder {
    fn default() -> Self {
        Self::new()
    }
}
