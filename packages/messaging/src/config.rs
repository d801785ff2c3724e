use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Default timeout for request/reply operations.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff for reconnection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Broker-side queue options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue survives a broker restart.
    pub durable: bool,
}

/// Server facade configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Destination the server consumes from.
    pub queue: String,
    pub queue_options: QueueOptions,
    /// Where fire-and-forget handler outputs are published. `None` drops them.
    pub event_destination: Option<String>,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
    pub disconnect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Requeue messages whose handlers failed.
    pub requeue_on_error: bool,
    /// Spawn the status logger on `run()`.
    pub log_status: bool,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            queue: queue.into(),
            queue_options: QueueOptions::default(),
            event_destination: None,
            max_in_flight: 16,
            shutdown_grace: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            requeue_on_error: false,
            log_status: true,
        }
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn with_event_destination(mut self, destination: impl Into<String>) -> Self {
        self.event_destination = Some(destination.into());
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }

    pub fn with_status_logging(mut self, enabled: bool) -> Self {
        self.log_status = enabled;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut config = Self::new(
            env::var("MESSAGING_HOST").unwrap_or_else(|_| "amqp://localhost:5672".to_string()),
            env::var("MESSAGING_QUEUE").context("MESSAGING_QUEUE must be set")?,
        );
        config.queue_options.durable = env_or("MESSAGING_QUEUE_DURABLE", false)?;
        config.event_destination = env::var("MESSAGING_EVENT_DESTINATION").ok();
        config.max_in_flight = env_or::<usize>("MESSAGING_MAX_IN_FLIGHT", 16)?.max(1);
        config.shutdown_grace = env_millis("MESSAGING_SHUTDOWN_GRACE_MS", config.shutdown_grace)?;
        config.disconnect_timeout =
            env_millis("MESSAGING_DISCONNECT_TIMEOUT_MS", config.disconnect_timeout)?;
        config.reconnect = reconnect_from_env()?;
        Ok(config)
    }
}

/// Client facade configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub reply_timeout: Duration,
    /// How often expired requests are swept.
    pub sweep_interval: Duration,
    pub disconnect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Channel label used on status events.
    pub channel: String,
    pub log_status: bool,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            channel: "client".to_string(),
            log_status: false,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_status_logging(mut self, enabled: bool) -> Self {
        self.log_status = enabled;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let mut config = Self::new(
            env::var("MESSAGING_HOST").unwrap_or_else(|_| "amqp://localhost:5672".to_string()),
        );
        config.reply_timeout = env_millis("MESSAGING_REPLY_TIMEOUT_MS", config.reply_timeout)?;
        config.disconnect_timeout =
            env_millis("MESSAGING_DISCONNECT_TIMEOUT_MS", config.disconnect_timeout)?;
        config.reconnect = reconnect_from_env()?;
        Ok(config)
    }
}

fn reconnect_from_env() -> Result<ReconnectPolicy> {
    let defaults = ReconnectPolicy::default();
    Ok(ReconnectPolicy {
        base_delay: env_millis("MESSAGING_RECONNECT_BASE_MS", defaults.base_delay)?,
        multiplier: env_or("MESSAGING_RECONNECT_MULTIPLIER", defaults.multiplier)?,
        max_delay: env_millis("MESSAGING_RECONNECT_MAX_MS", defaults.max_delay)?,
    })
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    let millis = env_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
