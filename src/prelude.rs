//! Convenient re-exports for common client types.
pub use crate::{
    config::{RejectOnRateLimit, RestOptions},
    error::{RestError, Result},
    request::{Method, RawFile, Request, RequestData},
    rest::{Rest, RestResponse},
    telemetry::{LogSink, MemorySink, RestEvent},
    transport::{RawResponse, Transport},
};
