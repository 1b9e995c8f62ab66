// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Configuration
//!
//! Loads the per-environment YAML document describing broker connections,
//! exchanges and queues. The document is keyed by environment name, each
//! environment mapping a logical connection name to its connection options and
//! the exchanges and queues declared on it:
//!
//! ```yaml
//! development:
//!   crm:
//!     connection:
//!       host: localhost
//!       vhost: crm
//!     exchange:
//!       - name: alert
//!         type: direct
//!         options:
//!           durable: true
//!     queue:
//!       - name: alert
//!         bind: alert
//!         routing_key: alert
//!         options:
//!           durable: true
//! ```
//!
//! Connection options are merged field by field over a fixed default set at
//! load time. The resulting `Configuration` is immutable.

use crate::errors::MqError;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::{collections::BTreeMap, fs, path::Path};
use tracing::{debug, error};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USERNAME: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";

/// Queue argument holding the per-message time-to-live in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument holding the maximum number of ready messages
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument holding the maximum size of ready messages in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Options used to build a broker connection.
///
/// Every field is optional in the document. `with_defaults` fills the unset
/// ones from `ConnectionOptions::defaults()`. Keys the schema does not know
/// are kept in `extra` and handed to the broker client untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(alias = "user")]
    pub username: Option<String>,
    #[serde(alias = "pass")]
    pub password: Option<String>,
    #[serde(alias = "virtual_host")]
    pub vhost: Option<String>,
    /// Heartbeat interval in seconds, `0` disables heartbeats
    pub heartbeat: Option<u16>,
    /// Connection timeout in milliseconds
    pub connection_timeout: Option<u64>,
    pub frame_max: Option<u32>,
    pub channel_max: Option<u16>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ConnectionOptions {
    /// The fixed default set: `localhost:5672`, `guest`/`guest`, vhost `/`.
    pub fn defaults() -> ConnectionOptions {
        ConnectionOptions {
            host: Some(DEFAULT_HOST.to_owned()),
            port: Some(DEFAULT_PORT),
            username: Some(DEFAULT_USERNAME.to_owned()),
            password: Some(DEFAULT_PASSWORD.to_owned()),
            vhost: Some(DEFAULT_VHOST.to_owned()),
            ..ConnectionOptions::default()
        }
    }

    /// Merges these options over `base`. Explicit values win, unset fields
    /// take the value from `base`, and `extra` keys are unioned.
    pub fn merge_over(self, base: &ConnectionOptions) -> ConnectionOptions {
        let mut extra = base.extra.clone();
        extra.extend(self.extra);

        ConnectionOptions {
            host: self.host.or_else(|| base.host.clone()),
            port: self.port.or(base.port),
            username: self.username.or_else(|| base.username.clone()),
            password: self.password.or_else(|| base.password.clone()),
            vhost: self.vhost.or_else(|| base.vhost.clone()),
            heartbeat: self.heartbeat.or(base.heartbeat),
            connection_timeout: self.connection_timeout.or(base.connection_timeout),
            frame_max: self.frame_max.or(base.frame_max),
            channel_max: self.channel_max.or(base.channel_max),
            extra,
        }
    }

    /// Merges these options over the default set. Idempotent.
    pub fn with_defaults(self) -> ConnectionOptions {
        self.merge_over(&ConnectionOptions::defaults())
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(DEFAULT_USERNAME)
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_PASSWORD)
    }

    pub fn vhost(&self) -> &str {
        self.vhost.as_deref().unwrap_or(DEFAULT_VHOST)
    }
}

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: routes on an exact match of the routing key
/// - Fanout: broadcasts to every bound queue
/// - Topic: routes on wildcard pattern matching of the routing key
/// - Headers: routes on message header values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Flags and arguments used when declaring an exchange.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub passive: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, Value>,
}

/// An exchange declared on a logical connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: ExchangeOptions,
}

impl ExchangeSpec {
    /// Creates a non-durable exchange definition of the given kind.
    pub fn new(name: &str, kind: ExchangeKind) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            kind,
            options: ExchangeOptions::default(),
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Deletes the exchange once its last binding is removed.
    pub fn auto_delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }
}

/// Flags, limits and arguments used when declaring a queue.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
    pub no_wait: bool,
    /// Message TTL in milliseconds
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
    pub arguments: BTreeMap<String, Value>,
}

impl QueueOptions {
    /// Declaration arguments: the free-form `arguments` plus the typed limits
    /// under their `x-` names. Typed limits take precedence.
    pub fn declare_arguments(&self) -> BTreeMap<String, Value> {
        let mut args = self.arguments.clone();

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.message_ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, limit) in limits {
            if let Some(limit) = limit {
                args.insert(key.to_owned(), Value::from(limit));
            }
        }

        args
    }
}

/// A queue declared on a logical connection and bound to one of its exchanges.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSpec {
    pub name: String,
    /// Name of an exchange declared on the same connection
    pub bind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub routing_key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: QueueOptions,
}

impl QueueSpec {
    /// Creates a non-durable queue bound to `bind` with an empty routing key.
    pub fn new(name: &str, bind: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            bind: bind.to_owned(),
            routing_key: String::new(),
            options: QueueOptions::default(),
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }
}

/// Everything declared for one logical connection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VhostConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection: ConnectionOptions,
    #[serde(rename = "exchange", default, deserialize_with = "null_as_default")]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(rename = "queue", default, deserialize_with = "null_as_default")]
    pub queues: Vec<QueueSpec>,
}

impl VhostConfig {
    pub fn new(connection: ConnectionOptions) -> VhostConfig {
        VhostConfig {
            connection,
            ..VhostConfig::default()
        }
    }

    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }
}

/// The validated configuration of one environment, keyed by logical
/// connection name.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    environment: String,
    connections: BTreeMap<String, VhostConfig>,
}

impl Configuration {
    /// Reads `path` and selects the `environment` sub-tree.
    ///
    /// # Errors
    /// * `ConfigFileMissing` if `path` does not exist
    /// * `ConfigParseError` if the document cannot be read or is malformed
    /// * `ConfigMissing` if the environment is absent or empty
    pub fn load(path: impl AsRef<Path>, environment: &str) -> Result<Configuration, MqError> {
        let path = path.as_ref();
        if !path.exists() {
            error!(path = %path.display(), "missing configuration file");
            return Err(MqError::ConfigFileMissing(path.display().to_string()));
        }

        debug!(path = %path.display(), environment, "loading configuration");
        let doc = fs::read_to_string(path).map_err(|err| {
            error!(error = err.to_string(), "failure to read configuration");
            MqError::ConfigParseError(err.to_string())
        })?;

        Configuration::from_yaml_str(&doc, environment)
    }

    /// Parses a YAML document and selects the `environment` sub-tree.
    pub fn from_yaml_str(doc: &str, environment: &str) -> Result<Configuration, MqError> {
        let root: Option<BTreeMap<String, serde_yaml::Value>> =
            serde_yaml::from_str(doc).map_err(|err| {
                error!(error = err.to_string(), "failure to parse configuration");
                MqError::ConfigParseError(err.to_string())
            })?;

        let env_value = match root.and_then(|mut root| root.remove(environment)) {
            Some(serde_yaml::Value::Null) | None => {
                return Err(MqError::ConfigMissing(environment.to_owned()))
            }
            Some(value) => value,
        };

        let connections: BTreeMap<String, VhostConfig> = serde_yaml::from_value(env_value)
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    environment, "failure to parse environment configuration"
                );
                MqError::ConfigParseError(err.to_string())
            })?;

        Configuration::from_connections(environment, connections)
    }

    /// Builds a configuration from already typed connection entries, applying
    /// connection defaults.
    pub fn from_connections(
        environment: &str,
        connections: BTreeMap<String, VhostConfig>,
    ) -> Result<Configuration, MqError> {
        if connections.is_empty() {
            return Err(MqError::ConfigMissing(environment.to_owned()));
        }

        let connections = connections
            .into_iter()
            .map(|(name, mut cfg)| {
                cfg.connection = cfg.connection.with_defaults();
                (name, cfg)
            })
            .collect();

        Ok(Configuration {
            environment: environment.to_owned(),
            connections,
        })
    }

    /// Name of the selected environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the entry of a logical connection.
    ///
    /// # Parameters
    /// * `connection` - Logical connection name as written in the document
    ///
    /// # Returns
    /// The connection's `VhostConfig`, or `None` if it is not configured
    pub fn get(&self, connection: &str) -> Option<&VhostConfig> {
        self.connections.get(connection)
    }

    /// Iterates over the logical connections in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &VhostConfig)> {
        self.connections.iter()
    }

    /// Logical connection names in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// Number of logical connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
