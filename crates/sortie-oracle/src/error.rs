//! Setup errors for oracle clients
//!
//! Call-time failures are reported as [`sortie_core::OracleError`]; this
//! enum only covers building clients from configuration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid oracle configuration: {0}")]
    Parse(String),

    #[error("Provider '{provider}' needs an API key: environment variable {variable} is not set")]
    MissingApiKey { provider: String, variable: String },

    #[error("Provider '{0}' is referenced but not configured")]
    UnknownProvider(String),

    #[error("No oracle providers configured")]
    Empty,

    #[error("HTTP client error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
