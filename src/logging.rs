// SPDX-License-Identifier: MPL-2.0

//! Logging setup.
//!
//! Installs a `tracing` fmt subscriber filtered by `RUST_LOG`. Initialization
//! is guarded by `OnceLock` so repeated calls (tests, embedders) are harmless.

use crate::config::IS_DEVEL;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_logging() {
    LOG_INIT.get_or_init(|| {
        let default_level = if IS_DEVEL { "debug" } else { "info" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init();
    });
}
