//! Tracing setup for skill processes.
//!
//! Logs go to stderr: the skill server owns the child's stdout.
//!
//! - `RUST_LOG` set: used as-is.
//! - Otherwise `HSS_LOG` (`debug`, `warn`, `error`, default `info`) sets the
//!   level for the skill crates, raised to `debug` by `--debug`.
//! - `HSS_LOG_FORMAT=json` switches to JSON lines.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init_tracing(debug: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("HSS_LOG").ok();
        EnvFilter::new(default_directives(level.as_deref(), debug))
    };

    let use_json = std::env::var("HSS_LOG_FORMAT").as_deref() == Ok("json");

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

fn default_directives(level: Option<&str>, debug: bool) -> String {
    let level = match level {
        _ if debug => "debug",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("hss_rpc={level},hss_skill={level},hss_echo_skill={level}")
}
