//! Logging setup.
//!
//! Filters come from the `SPOOL_LOG` environment variable (same syntax as
//! `RUST_LOG`), defaulting to `info`. Set `SPOOL_LOG_JSONL=1` for one JSON
//! object per line instead of the human-readable format.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "SPOOL_LOG";

/// Default log level when `SPOOL_LOG` is unset.
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV switching the output format to JSONL.
const JSONL_ENV: &str = "SPOOL_LOG_JSONL";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);

        if jsonl {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
