//! Environment-driven configuration.
//!
//! Every config type has a `Default` and a `from_env()` constructor. The
//! env readers go through a lookup function so they can be exercised
//! without touching the process environment.

use std::time::Duration;

use log::LevelFilter;

/// Default maximum size of one encoded message (10MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default number of items per page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Default idle time before an unused cursor is evicted.
pub const DEFAULT_CURSOR_IDLE: Duration = Duration::from_secs(300);

/// Default name of the handler worker thread.
pub const DEFAULT_HANDLER_THREAD: &str = "fastacp-handlers";

/// Protocol engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Deadline applied to every outgoing request (None = caller-managed).
    pub request_timeout: Option<Duration>,
    /// Maximum size of one encoded line or frame in bytes.
    pub max_message_size: usize,
    /// Name of the thread that runs request handlers.
    pub handler_thread_name: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handler_thread_name: DEFAULT_HANDLER_THREAD.to_owned(),
        }
    }
}

impl ProtocolConfig {
    /// Create engine config from environment variables.
    ///
    /// Respects:
    /// - `FASTACP_REQUEST_TIMEOUT_MS`: per-request deadline (0 or unset disables)
    /// - `FASTACP_MAX_MESSAGE_SIZE`: maximum line/frame size in bytes
    /// - `FASTACP_HANDLER_THREAD`: handler worker thread name
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let request_timeout = lookup("FASTACP_REQUEST_TIMEOUT_MS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let max_message_size = lookup("FASTACP_MAX_MESSAGE_SIZE")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|size| *size > 0)
            .unwrap_or(defaults.max_message_size);

        let handler_thread_name = lookup("FASTACP_HANDLER_THREAD")
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.handler_thread_name);

        Self {
            request_timeout,
            max_message_size,
            handler_thread_name,
        }
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Cursor paginator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Maximum items per page (at least 1).
    pub batch_size: usize,
    /// Idle time after which an unconsumed cursor is evicted (non-zero).
    pub idle_timeout: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PAGE_SIZE,
            idle_timeout: DEFAULT_CURSOR_IDLE,
        }
    }
}

impl PaginationConfig {
    /// Create paginator config from environment variables.
    ///
    /// Respects:
    /// - `FASTACP_PAGE_SIZE`: items per page
    /// - `FASTACP_CURSOR_IDLE_SECS`: cursor idle eviction delay
    ///
    /// Out-of-range values fall back to the defaults; the paginator
    /// constructor enforces the bounds for programmatic configs.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let batch_size = lookup("FASTACP_PAGE_SIZE")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|n| *n >= 1)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let idle_timeout = lookup("FASTACP_CURSOR_IDLE_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CURSOR_IDLE);

        Self {
            batch_size,
            idle_timeout,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Maximum level emitted (default: INFO).
    pub level: LevelFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
        }
    }
}

impl LoggingConfig {
    /// Create logging config from `FASTACP_LOG` (off, error, warn, info, debug, trace).
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("FASTACP_LOG")
            .and_then(|s| match s.to_lowercase().as_str() {
                "off" => Some(LevelFilter::Off),
                "error" => Some(LevelFilter::Error),
                "warn" | "warning" => Some(LevelFilter::Warn),
                "info" => Some(LevelFilter::Info),
                "debug" => Some(LevelFilter::Debug),
                "trace" => Some(LevelFilter::Trace),
                _ => None,
            })
            .unwrap_or(LevelFilter::Info);
        Self { level }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn protocol_defaults_have_no_timeout() {
        let config = ProtocolConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ProtocolConfig::default());
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn protocol_reads_timeout_and_size() {
        let config = ProtocolConfig::from_lookup(lookup(&[
            ("FASTACP_REQUEST_TIMEOUT_MS", "1500"),
            ("FASTACP_MAX_MESSAGE_SIZE", "4096"),
            ("FASTACP_HANDLER_THREAD", "acp-worker"),
        ]));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.handler_thread_name, "acp-worker");
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let config = ProtocolConfig::from_lookup(lookup(&[("FASTACP_REQUEST_TIMEOUT_MS", "0")]));
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn pagination_rejects_out_of_range_values() {
        let config = PaginationConfig::from_lookup(lookup(&[
            ("FASTACP_PAGE_SIZE", "0"),
            ("FASTACP_CURSOR_IDLE_SECS", "0"),
        ]));
        assert_eq!(config, PaginationConfig::default());

        let config = PaginationConfig::from_lookup(lookup(&[
            ("FASTACP_PAGE_SIZE", "3"),
            ("FASTACP_CURSOR_IDLE_SECS", "12"),
        ]));
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(12));
    }

    #[test]
    fn logging_level_parsing() {
        let config = LoggingConfig::from_lookup(lookup(&[("FASTACP_LOG", "Warning")]));
        assert_eq!(config.level, LevelFilter::Warn);
        let config = LoggingConfig::from_lookup(lookup(&[("FASTACP_LOG", "nonsense")]));
        assert_eq!(config.level, LevelFilter::Info);
    }
}
