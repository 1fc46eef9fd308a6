pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a terminal logger writing to stderr. Intended for binaries and
/// examples; libraries should accept a parent `Logger` instead.
pub fn terminal() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Malformed logger config");

    config.build_logger().expect("Failed to build logger")
}

/// Root logger that drops every record. Used by tests and as the fallback
/// when no parent logger is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives a child logger from an optional parent, falling back to the
/// discarding root.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
