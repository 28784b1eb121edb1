//! Thin facade over `slog` so the rest of the crate can do
//! `use crate::logging;` and call the macros through one path.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Root logger that swallows everything. Used wherever construction receives
/// no logger, so instrumented code stays zero-cost in tests.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Terminal logger for hosts that do not bring their own slog hierarchy.
/// Accepts the usual sloggers severity names ("trace", "debug", "info", ...).
pub fn term(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error building the logger configuration");

    config.build_logger().expect("Error building the logger")
}

/// Resolves an optional parent logger into a child, falling back to the
/// discard root.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_logger_discards() {
        let log = null();
        trace!(log, "never rendered"; "key" => 1);
    }

    #[test]
    fn test_child_falls_back_to_null() {
        let log = child(None);
        debug!(log, "still discarded");
    }
}
