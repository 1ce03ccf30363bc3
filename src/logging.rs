//! Tracing subscriber setup and the runtime verbosity toggle

use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

static FILTER: OnceCell<FilterState> = OnceCell::new();

struct FilterState {
    handle: reload::Handle<EnvFilter, Registry>,
    base: Level,
}

pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(level.into())
}

/// Install the global subscriber. Called once per process.
pub fn init(level: &str, json: bool) -> Result<()> {
    let base = parse_level(level);
    let (filter, handle) = reload::Layer::new(build_filter(base));

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("failed to install logger: {}", e)))?;

    let _ = FILTER.set(FilterState { handle, base });
    Ok(())
}

/// Switch between debug output and the configured base level.
/// No-op when no subscriber was installed through [`init`].
pub fn set_verbose(on: bool) {
    let Some(state) = FILTER.get() else {
        return;
    };
    let level = if on { Level::DEBUG } else { state.base };
    if let Err(e) = state.handle.reload(build_filter(level)) {
        tracing::warn!("failed to change log level: {}", e);
    }
}
