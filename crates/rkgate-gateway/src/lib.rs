//! Transport listeners for the rkgate JSON-RPC server.
pub mod gateway_server;

pub use gateway_server::*;
