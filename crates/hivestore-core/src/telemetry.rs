//! Tracing bootstrap for programs embedding a store.
//!
//! The engine logs through `tracing` (bucket lifecycle at `info`,
//! per-message detail at `debug`, swallowed failures at `warn`/`error`)
//! but never installs a subscriber itself. Hosts that do not bring their
//! own call [`init_tracing`] once before [`crate::Store::start`].
//!
//! Filter precedence: `HIVESTORE_LOG` (store-only scoping for embedding
//! applications), then `RUST_LOG`, then a default that enables the
//! hivestore crates at the requested level and leaves everything else
//! quiet.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Shape of emitted log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Text,
    /// Newline-delimited JSON with flattened fields, for log pipelines
    Json,
}

/// Install the global subscriber for a store host.
///
/// `level` is the verbosity for the hivestore crates when neither
/// `HIVESTORE_LOG` nor `RUST_LOG` is set; other crates stay at `warn` so
/// actor-level `debug` output can be enabled without drowning in the
/// host's dependencies.
///
/// Calling this more than once is fine; only the first call takes
/// effect (the global subscriber is process-wide).
pub fn init_tracing(format: LogFormat, level: Level) {
    let filter = std::env::var("HIVESTORE_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| {
            EnvFilter::new(format!(
                "warn,hivestore_core={level},hivestore_fs={level}",
                level = level.as_str().to_ascii_lowercase()
            ))
        });

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().flatten_event(true))
            .try_init()
            .ok(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .ok(),
    };
}
