//! Tracing setup for controller binaries and worker programs.
//!
//! Output always goes to stderr: in a subprocess worker stdout is the frame
//! channel.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var selecting the crate's log level when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "TETHER_LOG";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_filter(level: &str) -> String {
    format!("tether={level},tether_echo_worker={level}", level = level)
}

/// Initialize tracing with RUST_LOG / TETHER_LOG and LOG_FORMAT support.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(default_filter(base_level(level.as_deref())))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_filter_levels() {
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("bogus")), "info");
        assert_eq!(base_level(None), "info");
    }

    #[test]
    fn default_filter_covers_library_and_worker_binary() {
        assert_eq!(
            default_filter("warn"),
            "tether=warn,tether_echo_worker=warn"
        );
    }
}
