use std::env;
use std::time::Duration;

const DEFAULT_TARGET: &str = "127.0.0.1:5672";
const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_LINK_CREDIT: u32 = 50;
const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Broker host:port the connection manager dials.
    pub target: String,
    /// Upper bound on a single publish attempt.
    pub cancel_timeout: Duration,
    /// Sleep between dial attempts during a reconnect episode.
    pub retry_interval: Duration,
    /// Flow-control credit granted to each receiver link.
    pub link_credit: u32,
    /// Capacity of the command, result, and replay queues.
    pub channel_capacity: usize,
}

impl RouterConfig {
    /// Load configuration from `BUS_ROUTER_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            target: env::var("BUS_ROUTER_TARGET").unwrap_or(defaults.target),
            cancel_timeout: env_millis("BUS_ROUTER_CANCEL_TIMEOUT_MS")
                .unwrap_or(defaults.cancel_timeout),
            retry_interval: env_millis("BUS_ROUTER_RETRY_INTERVAL_MS")
                .unwrap_or(defaults.retry_interval),
            link_credit: env_parse("BUS_ROUTER_LINK_CREDIT").unwrap_or(defaults.link_credit),
            channel_capacity: env_parse("BUS_ROUTER_CHANNEL_CAPACITY")
                .unwrap_or(defaults.channel_capacity),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_link_credit(mut self, credit: u32) -> Self {
        self.link_credit = credit;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            link_credit: DEFAULT_LINK_CREDIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env_parse(var).map(Duration::from_millis)
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "BUS_ROUTER_TARGET",
        "BUS_ROUTER_CANCEL_TIMEOUT_MS",
        "BUS_ROUTER_RETRY_INTERVAL_MS",
        "BUS_ROUTER_LINK_CREDIT",
        "BUS_ROUTER_CHANNEL_CAPACITY",
    ];

    fn clear_vars() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.target, "127.0.0.1:5672");
        assert_eq!(config.cancel_timeout, Duration::from_millis(100));
        assert_eq!(config.retry_interval, Duration::from_millis(500));
        assert_eq!(config.link_credit, 50);
        assert_eq!(config.channel_capacity, 10);
    }

    #[test]
    fn from_env_defaults_when_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let config = RouterConfig::from_env();
        assert_eq!(config.target, "127.0.0.1:5672");
        assert_eq!(config.link_credit, 50);
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        env::set_var("BUS_ROUTER_TARGET", "broker.example.com:5672");
        env::set_var("BUS_ROUTER_CANCEL_TIMEOUT_MS", "250");
        env::set_var("BUS_ROUTER_LINK_CREDIT", "not-a-number");

        let config = RouterConfig::from_env();
        assert_eq!(config.target, "broker.example.com:5672");
        assert_eq!(config.cancel_timeout, Duration::from_millis(250));
        // Unparsable values fall back to the default.
        assert_eq!(config.link_credit, 50);

        clear_vars();
    }

    #[test]
    fn builder_setters() {
        let config = RouterConfig::default()
            .with_target("10.0.0.1:5672")
            .with_retry_interval(Duration::from_millis(20))
            .with_channel_capacity(0);
        assert_eq!(config.target, "10.0.0.1:5672");
        assert_eq!(config.retry_interval, Duration::from_millis(20));
        // Capacity is clamped to keep the bounded queues usable.
        assert_eq!(config.channel_capacity, 1);
    }
}
