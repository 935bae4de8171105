//! Command implementations
//!
//! One module per CLI subcommand. A bare `mcprep` invocation uses [`run`].

pub mod bump;
pub mod extract_configs;
pub mod run;
pub mod update_plugins;
