//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (configuration, container runtime, remote console, patching, git) that are
//! then wrapped in the main [`PrepError`] enum for unified error handling.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Container runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime binary is not installed or not accessible
    #[error("Container runtime is not installed or not accessible")]
    NotInstalled,

    /// Runtime CLI command error
    #[error("Runtime CLI error: {0}")]
    CLIError(String),

    /// Container not found
    #[error("Container not found: {name}")]
    ContainerNotFound { name: String },
}

/// Remote console (RCON) errors
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// TCP connection could not be established
    #[error("Failed to connect to remote console at {address}: {message}")]
    Connect { address: String, message: String },

    /// The server rejected the console password
    #[error("Remote console authentication rejected")]
    AuthRejected,

    /// A command could not be sent or its response not read
    #[error("Remote console I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server sent a packet we cannot interpret
    #[error("Malformed remote console packet: {message}")]
    Protocol { message: String },

    /// No response within the configured I/O timeout
    #[error("Remote console timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The server answered with one of the configured rejection markers
    #[error("Command rejected by server: {response}")]
    Rejected { response: String },

    /// Command text exceeds the protocol's payload limit
    #[error("Command too long for remote console ({len} bytes, max {max})")]
    CommandTooLong { len: usize, max: usize },
}

/// Config patch errors
#[derive(Error, Debug)]
pub enum PatchError {
    /// The document could not be parsed in its declared format
    #[error("Failed to parse {path}: {message}")]
    Malformed { path: String, message: String },

    /// A field path walks through a node that is not a mapping
    #[error("Field path '{field}' in {path} crosses a non-mapping node at '{segment}'")]
    NotAMapping {
        path: String,
        field: String,
        segment: String,
    },

    /// Extending a field that holds something other than a sequence
    #[error("Field '{field}' in {path} is not a list")]
    NotAList { path: String, field: String },

    /// Line pattern is not a valid regular expression
    #[error("Invalid line pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Empty or otherwise unusable field path
    #[error("Invalid field path '{field}'")]
    InvalidField { field: String },

    /// Reading or writing the target file failed
    #[error("Failed to access {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Plugin registry, lookup and download errors
#[derive(Error, Debug)]
pub enum PluginError {
    /// The registry file could not be parsed
    #[error("Invalid plugin registry {path}: {message}")]
    Registry { path: String, message: String },

    /// `--only` named a plugin the registry does not know
    #[error("No such plugin in registry: {name}")]
    UnknownPlugin { name: String },

    /// The HTTP client could not be constructed
    #[error("HTTP client error: {message}")]
    Client { message: String },

    /// Request failed before a response arrived
    #[error("Request to {url} failed: {message}")]
    Http { url: String, message: String },

    /// Non-success HTTP status
    #[error("HTTP {status} for URL: {url}")]
    Status { url: String, status: u16 },

    /// An upstream API answered with something we cannot read
    #[error("Unexpected response from {url}: {message}")]
    Response { url: String, message: String },
}

/// Git-related errors
#[derive(Error, Debug)]
pub enum GitError {
    /// Git is not installed or not accessible
    #[error("Git is not installed or not accessible")]
    NotInstalled,

    /// Git CLI command error
    #[error("Git CLI error: {0}")]
    CLIError(String),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum PrepError {
    /// Operation invoked before a required state was reached
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// Readiness condition never observed within its bound
    #[error("Timed out after {elapsed_secs}s waiting for {what}")]
    Timeout { what: String, elapsed_secs: u64 },

    /// Remote console command rejected or connection failed
    #[error("Remote command error: {0}")]
    RemoteCommand(#[from] ConsoleError),

    /// Config patch errors
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    /// Container runtime errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Git errors
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    /// Plugin registry and update errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Host filesystem errors
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PrepError {
    /// Shorthand for a precondition failure
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Convenience type alias for Results with PrepError
pub type Result<T> = std::result::Result<T, PrepError>;
