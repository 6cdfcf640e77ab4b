//! Historical comparison and trend analysis for medical reports.
//!
//! A newly submitted report is compared against the same patient's prior
//! reports of the same kind. The outcome, including degraded outcomes when
//! the reasoning engine is unavailable, is appended to an audit table.

pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;

pub use pipeline::comparison::{CancellationToken, ComparisonError, ComparisonPipeline};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber, filtered by `RUST_LOG` or the crate default.
/// Later calls are no-ops.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} v{} logging initialised", config::APP_NAME, config::APP_VERSION);
    }
}
