//! Core library for mcprep
//!
//! Provisions short-lived Minecraft server containers to generate worlds and
//! plugin configuration, then patches the results on the host and removes the
//! containers again. The [`pipeline`] module ties the stages together.

pub mod artifact;
pub mod bump;
pub mod config;
pub mod console;
pub mod errors;
pub mod git;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod patch;
pub mod permissions;
pub mod pipeline;
pub mod plugin_configs;
pub mod plugin_registry;
pub mod plugin_sources;
pub mod plugin_update;
pub mod readiness;
pub mod runtime;
