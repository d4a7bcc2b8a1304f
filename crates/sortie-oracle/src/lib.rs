//! Sortie Oracle - reasoning oracle backends
//!
//! Concrete [`ReasoningOracle`](sortie_core::ReasoningOracle) implementations
//! for the intent resolver:
//!
//! - [`OpenAiCompatibleOracle`]: any `/chat/completions` endpoint
//! - [`OllamaOracle`]: a local Ollama server
//! - [`OracleChain`]: ordered fallback across providers, each guarded by a
//!   [`CircuitBreaker`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sortie_oracle::{OracleChain, OracleConfig};
//!
//! let config = OracleConfig::from_file("oracle.toml")?;
//! let oracle = Arc::new(OracleChain::from_config(&config)?);
//! let session = sortie_core::Session::builder().with_oracle(oracle);
//! # let _ = session;
//! # Ok::<(), sortie_oracle::ConfigError>(())
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod chain;
pub mod circuit_breaker;
pub mod config;
pub mod error;
mod http;
pub mod ollama;
pub mod openai_compatible;

#[cfg(test)]
mod testing;

pub use chain::OracleChain;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, GuardedOracle};
pub use config::{OracleConfig, ProviderConfig};
pub use error::{ConfigError, Result};
pub use ollama::OllamaOracle;
pub use openai_compatible::OpenAiCompatibleOracle;
