//! Unified infrastructure error type.

use thiserror::Error as ThisError;

/// The error type returned by portico's fallible setup and serving operations.
///
/// Request-level failures are not `Error`s. Handlers report them as a
/// [`Fault`](crate::Fault), and the pipeline turns those into responses. This
/// type surfaces infrastructure failures: binding to a port, accepting a
/// connection, or loading configuration at startup.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config: {0}")]
    Config(String),
}
