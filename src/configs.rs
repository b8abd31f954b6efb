// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Settings
//!
//! Plain, deserializable settings for the connection, consumers and producers.
//! Durations are expressed in milliseconds so the structs can be loaded from any
//! serde source (environment adapters, JSON/TOML files).

use serde::Deserialize;
use std::time::Duration;

/// Default delay between a failed (re)configuration attempt and the next one
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 10_000;

/// Connection level settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfigs {
    /// Connection name reported to the broker and default app id of published messages
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Delay between recovery attempts of channels and topologies
    pub recovery_interval_ms: u64,
}

impl Default for LinkConfigs {
    fn default() -> Self {
        LinkConfigs {
            app_name: "rabbitlink".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
        }
    }
}

impl LinkConfigs {
    /// Formats the AMQP URI for these settings.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

/// Pull consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfigs {
    /// Maximum unacknowledged deliveries, 0 means no limit
    pub prefetch_count: u16,
    /// Let the broker consider messages acknowledged as soon as they are delivered
    pub auto_ack: bool,
    /// Consumer priority, see https://www.rabbitmq.com/consumer-priority.html
    pub priority: i32,
    /// Whether the consumer is cancelled (and recovered) on HA failover
    pub cancel_on_ha_failover: bool,
    pub exclusive: bool,
    /// Timeout of `get_message`, 0 means wait indefinitely
    pub get_message_timeout_ms: u64,
    /// Overrides the connection recovery interval
    pub recovery_interval_ms: Option<u64>,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        ConsumerConfigs {
            prefetch_count: 0,
            auto_ack: false,
            priority: 0,
            cancel_on_ha_failover: false,
            exclusive: false,
            get_message_timeout_ms: 0,
            recovery_interval_ms: None,
        }
    }
}

impl ConsumerConfigs {
    pub fn get_message_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.get_message_timeout_ms)
    }

    pub fn recovery_interval(&self, link: &LinkConfigs) -> Duration {
        self.recovery_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| link.recovery_interval())
    }
}

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProducerConfigs {
    /// Enable publisher confirms and wait for them on every publish
    pub confirm_mode: bool,
    /// Timeout of `publish`, 0 means wait indefinitely
    pub publish_timeout_ms: u64,
    /// Overrides the connection recovery interval
    pub recovery_interval_ms: Option<u64>,
    /// Stamp the connection user on outgoing messages
    pub set_user_id: bool,
}

impl Default for ProducerConfigs {
    fn default() -> Self {
        ProducerConfigs {
            confirm_mode: true,
            publish_timeout_ms: 0,
            recovery_interval_ms: None,
            set_user_id: false,
        }
    }
}

impl ProducerConfigs {
    pub fn publish_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.publish_timeout_ms)
    }

    pub fn recovery_interval(&self, link: &LinkConfigs) -> Duration {
        self.recovery_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| link.recovery_interval())
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    match ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}
