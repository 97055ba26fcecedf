//! Tracing integration for structured logging.
//!
//! Provides logging setup for embedding programs and the `spool-get` binary:
//! - Verbosity levels mapped onto the spool crates
//! - `RUST_LOG` override
//! - Plain text output to stderr

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Map a verbosity count to a level name (0=error, 1=warn, 2=info, 3=debug, 4+=trace).
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Initialize the logging system.
///
/// # Arguments
///
/// * `verbosity` - Verbosity level (0=error, 1=warn, 2=info, 3=debug, 4+=trace)
///
/// # Example
///
/// ```ignore
/// use spool::logging::init_logging;
///
/// init_logging(3).unwrap();
/// ```
pub fn init_logging(verbosity: u8) -> Result<()> {
    let level = level_for(verbosity);

    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "spool={level},spool_common={level},spool_get={level},spool_test_utils={level}"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
}

/// Initialize logging with defaults for testing.
///
/// Uses debug level. Silently ignores errors (logging may already be
/// initialized by another test).
pub fn init_test_logging() {
    let _ = init_logging(3);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(1), "warn");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(3), "debug");
        assert_eq!(level_for(4), "trace");
        assert_eq!(level_for(200), "trace");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_test_logging();
        init_test_logging();
    }
}
