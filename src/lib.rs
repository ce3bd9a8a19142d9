//! Outbound Guard Library
//!
//! Resilient outbound calls to third-party platform APIs (social networks,
//! ad platforms, messaging and LLM providers).
//!
//! # Features
//!
//! - **Sliding-window rate limiting**: a burst window plus any number of
//!   named sustained windows per platform, tracked per endpoint and user
//! - **Circuit breaking**: Closed / Open / Half-Open with lazy transitions
//!   and a bounded number of recovery probes
//! - **Retry**: exponential backoff with ±10% jitter for transient errors
//! - **Shared state**: all per-key state lives in a pluggable [`store::Store`]
//!   and every read-modify-write is atomic per key
//!
//! # Example
//!
//! ```no_run
//! use outbound_guard::{CallRequest, Config, Failsafe};
//!
//! # async fn run() -> outbound_guard::Result<()> {
//! let failsafe = Failsafe::from_config(&Config::default())?;
//! let response = failsafe
//!     .call(CallRequest::new("linkedin", "share", "POST", "https://api.linkedin.com/v2/ugcPosts"))
//!     .await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod key;
pub mod profiles;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use failsafe::{CallRequest, CallStats, CircuitState, Failsafe, Weighted};
pub use key::CallKey;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Tracing already initialised: {e}")))
}
