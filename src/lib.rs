#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # labrinth-rest
//!
//! Rate-limit aware REST dispatch core for the Modrinth Labrinth API.
//!
//! ## Features
//!
//! - **Per-bucket sequential queues**: requests sharing a rate-limit bucket run one at a time,
//!   in arrival order
//! - **Local and global quota** tracked from `x-ratelimit-*` headers, with pre-emptive waits
//! - **Reject-on-rate-limit** policies (route prefixes or predicates) instead of waiting
//! - **Retries** for 5xx responses and local timeouts; 429 paced outside the retry budget
//! - **Structured errors** with flattened field-level validation messages
//! - **Pluggable transport, clock, sleeper, and event sinks** for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use labrinth_rest::{RequestData, Rest, RestError, RestOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RestError> {
//!     let rest = Rest::new(RestOptions::default()).expect("valid options");
//!     rest.set_token("mrp_...");
//!
//!     let project = rest.get("/project/AANobbMI", RequestData::new()).await?;
//!     println!("{:?}", project.body);
//!
//!     let result = rest
//!         .patch("/project/AANobbMI", RequestData::new().json(json!({ "title": "" })))
//!         .await;
//!     if let Err(RestError::Api(e)) = result {
//!         for line in e.field_errors() {
//!             eprintln!("{}", line);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api_error;
mod bucket;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod invalid;
mod manager;
pub mod prelude;
pub mod request;
pub mod rest;
pub mod retry;
pub mod route;
pub mod sleeper;
pub mod telemetry;
pub mod timeout;
pub mod transport;

// Re-exports
pub use api_error::{ApiError, ApiErrorCode, ErrorBody, ErrorNode};
pub use bucket::BucketSnapshot;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::ResponseBody;
pub use config::{ConfigError, RejectOnRateLimit, RestOptions, RestOptionsBuilder};
pub use error::{RateLimitError, RestError, Result, TransportError, TransportFailure};
pub use invalid::InvalidRequestTracker;
pub use request::{Method, RawFile, Request, RequestBody, RequestData};
pub use rest::{Rest, RestBuilder, RestResponse};
pub use route::RouteDescriptor;
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    EventSink, InvalidRequestWarning, LogSink, MemorySink, NullSink, RateLimitInfo, ResponseInfo,
    RestEvent, StreamingSink,
};
pub use timeout::TimeoutPolicy;
pub use transport::{RawResponse, ReqwestTransport, ScriptedReply, ScriptedTransport, Transport};
