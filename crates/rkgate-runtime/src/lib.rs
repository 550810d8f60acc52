//! Transport-agnostic JSON-RPC runtime for the rkgate inference server.
//!
//! Exposes envelope parsing, NDJSON framing, method routing, streaming session
//! management, the HTTP polling buffer manager and its cleanup sweeper. The
//! native model engine is reached only through the `NativeEngine` trait.

pub mod buffer_sweeper_runtime;
pub mod http_buffer_runtime;
pub mod native_engine;
pub mod ndjson_framer;
pub mod rpc_diagnostics_runtime;
pub mod rpc_protocol_runtime;
pub mod runtime_lifecycle;
pub mod simulated_engine;
pub mod stream_session_runtime;

pub use buffer_sweeper_runtime::*;
pub use http_buffer_runtime::*;
pub use native_engine::*;
pub use ndjson_framer::*;
pub use rpc_diagnostics_runtime::*;
pub use rpc_protocol_runtime::*;
pub use runtime_lifecycle::*;
pub use simulated_engine::*;
pub use stream_session_runtime::*;
