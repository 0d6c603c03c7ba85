#![forbid(unsafe_code)]

//! Shared building blocks for the tubegrab binaries: configuration, the
//! extraction tool driver, and the request-scoped download orchestrator.

pub mod config;
pub mod error;
pub mod extractor;
pub mod metadata;
pub mod orchestrator;
pub mod progress;
pub mod sanitize;
pub mod scratch;
pub mod security;

/// Installs the `tracing` subscriber used by every binary. `RUST_LOG` wins
/// over the built-in default filter.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("tubegrab=info,server=info,grab=info")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
