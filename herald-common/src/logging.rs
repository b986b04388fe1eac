//! Logging initialisation.
//!
//! Respects `HERALD_LOG` (falling back to `RUST_LOG`) for per-target filter
//! directives; defaults to `info` in release builds.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let default_directive = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = std::env::var("HERALD_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map_or_else(
            |_| EnvFilter::new(default_directive),
            |directives| EnvFilter::new(directives),
        );

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(filter)
        .init();
}
