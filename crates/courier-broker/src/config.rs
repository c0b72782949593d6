// Broker tuning knobs with environment overrides.
use anyhow::Result;

const DEFAULT_QUEUE_PREFIX: &str = "/courier";
const DEFAULT_BROKER_ID: &str = "courier://localhost:1097/courier";
const DEFAULT_MAX_MESSAGE_BACKLOG: usize = 100_000;
const DEFAULT_WARN_QUEUE_BACKLOG: usize = 50_000;
const DEFAULT_REJECT_QUEUE_BACKLOG: usize = 100_000;

/// Broker configuration.
///
/// Mailboxes are served only under `queue_prefix`. `max_message_backlog`
/// caps pending messages broker-wide; the two queue backlog thresholds act
/// per mailbox at delivery time.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub queue_prefix: String,
    pub broker_id: String,
    pub max_message_backlog: usize,
    pub warn_queue_backlog: usize,
    pub reject_queue_backlog: usize,
    // Whether a poll also asks peers to republish their state.
    pub poll_sends_query: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            broker_id: DEFAULT_BROKER_ID.to_string(),
            max_message_backlog: DEFAULT_MAX_MESSAGE_BACKLOG,
            warn_queue_backlog: DEFAULT_WARN_QUEUE_BACKLOG,
            reject_queue_backlog: DEFAULT_REJECT_QUEUE_BACKLOG,
            poll_sends_query: false,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from `COURIER_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            queue_prefix: std::env::var("COURIER_QUEUE_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.queue_prefix),
            broker_id: std::env::var("COURIER_BROKER_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.broker_id),
            max_message_backlog: env_limit(
                "COURIER_MAX_MESSAGE_BACKLOG",
                defaults.max_message_backlog,
            ),
            warn_queue_backlog: env_limit("COURIER_WARN_QUEUE_BACKLOG", defaults.warn_queue_backlog),
            reject_queue_backlog: env_limit(
                "COURIER_REJECT_QUEUE_BACKLOG",
                defaults.reject_queue_backlog,
            ),
            poll_sends_query: std::env::var("COURIER_POLL_SENDS_QUERY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.poll_sends_query),
        })
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn with_broker_id(mut self, broker_id: impl Into<String>) -> Self {
        self.broker_id = broker_id.into();
        self
    }

    pub fn with_max_message_backlog(mut self, limit: usize) -> Self {
        self.max_message_backlog = limit;
        self
    }

    pub fn with_queue_backlog(mut self, warn: usize, reject: usize) -> Self {
        self.warn_queue_backlog = warn;
        self.reject_queue_backlog = reject;
        self
    }

    pub fn with_poll_sends_query(mut self, enabled: bool) -> Self {
        self.poll_sends_query = enabled;
        self
    }
}

// Positive numeric override or the default.
fn env_limit(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
