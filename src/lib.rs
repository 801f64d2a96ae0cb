//! Consent Gateway Library
//!
//! A transparent OAuth 2.0 authorization gateway that sits between a client
//! application and an upstream identity provider, pauses the authorization
//! code flow after the provider redirects back, collects per-user capability
//! preferences, and then resumes the flow so the client receives a valid
//! code and token as if no interruption occurred.
//!
//! # Subsystems
//!
//! - [`flow`]: the interception/resumption state machine and its stores
//! - [`upstream`]: the provider code-exchange adapter boundary
//! - [`issue`]: downstream code and session-token issuance
//! - [`prefs`]: the per-subject capability preference store
//! - [`gate`]: the per-call capability access gate
//! - [`gateway`]: HTTP surface and server lifecycle

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod gate;
pub mod gateway;
pub mod issue;
pub mod prefs;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
