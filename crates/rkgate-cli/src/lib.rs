//! Command-line surface for the rkgate server.
pub mod cli_args;

pub use cli_args::*;
