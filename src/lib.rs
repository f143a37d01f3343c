//! Huginn - metrics-recording reverse proxy for chat-completion APIs
//!
//! Huginn sits between clients and an OpenAI-compatible inference server.
//! Every request is relayed unchanged while the proxy records vLLM-style
//! telemetry from the forwarding lifecycle: queue time, time-to-first-token,
//! running/waiting request counts, token counts and per-status totals.
//!
//! The core pieces are:
//! - [`Recorder`]: the metric catalog and its lifecycle hooks
//! - [`AdmissionController`]: bounded, FIFO concurrency slots
//! - [`Forwarder`]: the pipeline tying admission, upstream and recorder together
//!
//! # Example
//!
//! ```rust,no_run
//! use huginn::{ForwardRequest, Huginn, ResponseBody};
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let forwarder = Huginn::builder()
//!         .upstream_url("http://127.0.0.1:8001")
//!         .model_name("llama-3-8b")
//!         .max_concurrency(8)
//!         .build()?;
//!
//!     let request = ForwardRequest::new(
//!         "/v1/chat/completions",
//!         r#"{"model":"llama-3-8b","messages":[{"role":"user","content":"hi"}]}"#,
//!     );
//!     let response = forwarder.forward(request).await?;
//!     if let ResponseBody::Complete(body) = response.body {
//!         println!("{}", String::from_utf8_lossy(&body));
//!     }
//!
//!     print!("{}", huginn::exposition::render(&forwarder.recorder().snapshot()));
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod builder;
pub mod error;
pub mod exposition;
pub mod pipeline;
pub mod primitives;
pub mod recorder;
#[cfg(feature = "server")]
pub mod server;
pub mod telemetry;
pub mod upstream;
pub mod version;

// Re-export main types at crate root
pub use admission::{AdmissionController, Permit};
pub use builder::{Huginn, HuginnBuilder};
pub use error::{HuginnError, Result};
pub use pipeline::{ForwardResponse, Forwarder, RelayStream, ResponseBody, Usage};
pub use recorder::{
    FinalizedRequest, MetricKind, Recorder, RecorderConfig, RecorderSnapshot, RequestStatus,
};
pub use upstream::{ForwardRequest, HttpUpstream, Upstream, UpstreamConfig, UpstreamResponse};
pub use version::{PKG_VERSION, version_string};
