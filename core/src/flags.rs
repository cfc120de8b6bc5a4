//! Environment-variable overrides recognized by the core, per § External
//! Interfaces. These are the highest-precedence layer of [`crate::config`]'s
//! resolution: defaults < `config.toml` < these env vars < explicit
//! constructor args.

use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    pub OPENAI_API_KEY: Option<&str> = None;
    pub OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

    pub OPENAI_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Base delay for rate-limit backoff; overridden per-attempt by a
    /// server-provided "retry after" hint when present.
    pub OPENAI_RATE_LIMIT_RETRY_WAIT_MS: Duration = Duration::from_millis(2_500), |value| {
        value.parse().map(Duration::from_millis)
    };
}

/// Whether diagnostic (`DEBUG`-gated) logging is enabled. Re-read on every
/// call, unlike the `env_flags!` values above, because tests flip this
/// env var at runtime and `env_flags!` caches its values for the life of
/// the process.
pub fn debug_logging_enabled() -> bool {
    std::env::var_os("DEBUG").is_some_and(|v| !v.is_empty() && v != "0")
}
