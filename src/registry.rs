// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registry
//!
//! Turns a `Configuration` into live broker handles and indexes them by
//! logical name. Setup happens in explicit steps, expected to run once and
//! single-threaded during startup:
//!
//! 1. `create_connections` builds one connection handle per logical name
//! 2. `start_connections` opens them all, collecting per-connection results
//! 3. `declare_exchanges` declares every exchange on the connection's channel
//! 4. `declare_queues` declares every queue and binds it to its exchange
//!
//! Exactly one channel exists per logical connection. It is created on demand
//! by `ensure_channel` and reused for every declaration and publish on that
//! connection. Lookups are read-only and safe to call concurrently.

use crate::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection, BrokerExchange, BrokerQueue},
    config::{Configuration, VhostConfig},
    errors::{AmqpError, MqError},
};
use futures_util::future::join_all;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Lifecycle of a logical connection inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Unconfigured,
    Constructed,
    Started,
    TopologyDeclared,
}

/// The channel of a logical connection and the lock serializing its writes.
#[derive(Clone)]
struct ChannelSlot {
    channel: Arc<dyn BrokerChannel>,
    publish_lock: Arc<Mutex<()>>,
}

/// Name-indexed store of connection, channel, exchange and queue handles.
pub struct TopologyRegistry {
    client: Arc<dyn BrokerClient>,
    connections: HashMap<String, Arc<dyn BrokerConnection>>,
    states: HashMap<String, ConnectionState>,
    channels: HashMap<String, ChannelSlot>,
    exchanges: HashMap<String, HashMap<String, Arc<dyn BrokerExchange>>>,
    queues: HashMap<String, HashMap<String, Arc<dyn BrokerQueue>>>,
}

impl TopologyRegistry {
    /// Creates an empty registry.
    ///
    /// # Parameters
    /// * `client` - Broker client used to build every connection handle
    ///
    /// # Returns
    /// A registry with no connections, in which every name is `Unconfigured`
    pub fn new(client: Arc<dyn BrokerClient>) -> TopologyRegistry {
        TopologyRegistry {
            client,
            connections: HashMap::default(),
            states: HashMap::default(),
            channels: HashMap::default(),
            exchanges: HashMap::default(),
            queues: HashMap::default(),
        }
    }

    /// Builds one connection handle per logical connection.
    ///
    /// No network I/O happens here. Calling it again replaces the stored
    /// handles; a replaced connection loses its channel and its declared
    /// exchanges and queues.
    pub fn create_connections(&mut self, config: &Configuration) -> Result<(), MqError> {
        for (name, cfg) in config.iter() {
            debug!(connection = name.as_str(), "creating connection");

            let conn = self.client.connect(name, &cfg.connection).map_err(|err| {
                error!(
                    error = err.to_string(),
                    connection = name.as_str(),
                    "failure to create connection"
                );
                MqError::Broker(err)
            })?;

            if self.connections.insert(name.clone(), conn).is_some() {
                debug!(connection = name.as_str(), "replacing connection");
                self.channels.remove(name);
                self.exchanges.remove(name);
                self.queues.remove(name);
            }
            self.states.insert(name.clone(), ConnectionState::Constructed);
        }

        Ok(())
    }

    /// Opens every stored connection concurrently.
    ///
    /// A failing connection does not stop the others from being attempted.
    /// The result for each logical connection is returned, sorted by name.
    pub async fn start_connections(&mut self) -> Vec<(String, Result<(), AmqpError>)> {
        let attempts = self.connections.iter().map(|(name, conn)| {
            let name = name.clone();
            let conn = conn.clone();
            async move {
                debug!(connection = name.as_str(), "starting connection");
                let result = conn.start().await;
                (name, result)
            }
        });

        let mut results = join_all(attempts).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, result) in &results {
            match result {
                Ok(()) => {
                    info!(connection = name.as_str(), "connection started");
                    self.states.insert(name.clone(), ConnectionState::Started);
                }
                Err(err) => warn!(
                    error = err.to_string(),
                    connection = name.as_str(),
                    "failure to start connection"
                ),
            }
        }

        results
    }

    /// Closes every stored connection concurrently, collecting per-connection
    /// results the same way `start_connections` does.
    pub async fn close_connections(&mut self) -> Vec<(String, Result<(), AmqpError>)> {
        let attempts = self.connections.iter().map(|(name, conn)| {
            let name = name.clone();
            let conn = conn.clone();
            async move {
                let result = conn.close().await;
                (name, result)
            }
        });

        let mut results = join_all(attempts).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, result) in &results {
            if let Err(err) = result {
                warn!(
                    error = err.to_string(),
                    connection = name.as_str(),
                    "failure to close connection"
                );
            }
        }

        self.channels.clear();
        self.exchanges.clear();
        self.queues.clear();
        for state in self.states.values_mut() {
            *state = ConnectionState::Constructed;
        }

        results
    }

    /// Returns the channel of `connection`, creating it if absent.
    ///
    /// Idempotent: once created, the same channel is returned on every call.
    pub async fn ensure_channel(
        &mut self,
        connection: &str,
    ) -> Result<Arc<dyn BrokerChannel>, MqError> {
        if let Some(slot) = self.channels.get(connection) {
            return Ok(slot.channel.clone());
        }

        let conn = self.connection(connection)?;

        debug!(connection, "creating channel");
        let channel = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), connection, "failure to create channel");
            MqError::Broker(err)
        })?;

        self.channels.insert(
            connection.to_owned(),
            ChannelSlot {
                channel: channel.clone(),
                publish_lock: Arc::new(Mutex::new(())),
            },
        );

        Ok(channel)
    }

    /// Declares every exchange of every logical connection.
    ///
    /// Handles are stored under `(connection, exchange)`; declaring the same
    /// name twice keeps the last handle.
    pub async fn declare_exchanges(&mut self, config: &Configuration) -> Result<(), MqError> {
        for (conn_name, cfg) in config.iter() {
            self.declare_exchanges_of(conn_name, cfg).await?;
        }

        Ok(())
    }

    async fn declare_exchanges_of(
        &mut self,
        conn_name: &str,
        cfg: &VhostConfig,
    ) -> Result<(), MqError> {
        let channel = self.ensure_channel(conn_name).await?;
        let declared = self.exchanges.entry(conn_name.to_owned()).or_default();

        for spec in &cfg.exchanges {
            debug!(
                connection = conn_name,
                exchange = spec.name.as_str(),
                "declaring exchange"
            );

            let exchange = channel.declare_exchange(spec).await.map_err(|err| {
                error!(
                    error = err.to_string(),
                    connection = conn_name,
                    exchange = spec.name.as_str(),
                    "failure to declare exchange"
                );
                MqError::Broker(err)
            })?;

            declared.insert(spec.name.clone(), exchange);
        }

        Ok(())
    }

    /// Declares every queue of every logical connection and binds it to the
    /// exchange named by its `bind` field.
    ///
    /// `declare_exchanges` must have run first: the bind target is looked up
    /// among the declared exchanges before any queue is declared on that
    /// connection, and a missing one fails with `UnresolvedExchangeBind`.
    pub async fn declare_queues(&mut self, config: &Configuration) -> Result<(), MqError> {
        for (conn_name, cfg) in config.iter() {
            self.declare_queues_of(conn_name, cfg).await?;
        }

        Ok(())
    }

    async fn declare_queues_of(&mut self, conn_name: &str, cfg: &VhostConfig) -> Result<(), MqError> {
        for spec in &cfg.queues {
            let bound = self
                .exchanges
                .get(conn_name)
                .is_some_and(|declared| declared.contains_key(&spec.bind));
            if !bound {
                error!(
                    connection = conn_name,
                    queue = spec.name.as_str(),
                    exchange = spec.bind.as_str(),
                    "queue binds to an undeclared exchange"
                );
                return Err(MqError::UnresolvedExchangeBind {
                    connection: conn_name.to_owned(),
                    queue: spec.name.clone(),
                    exchange: spec.bind.clone(),
                });
            }
        }

        let channel = self.ensure_channel(conn_name).await?;
        let declared = self.queues.entry(conn_name.to_owned()).or_default();

        for spec in &cfg.queues {
            debug!(
                connection = conn_name,
                queue = spec.name.as_str(),
                "declaring queue"
            );
            let queue = channel.declare_queue(spec).await.map_err(|err| {
                error!(
                    error = err.to_string(),
                    connection = conn_name,
                    queue = spec.name.as_str(),
                    "failure to declare queue"
                );
                MqError::Broker(err)
            })?;

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                spec.name, spec.bind, spec.routing_key
            );
            queue.bind(&spec.bind, &spec.routing_key).await?;

            declared.insert(spec.name.clone(), queue);
        }

        self.states
            .insert(conn_name.to_owned(), ConnectionState::TopologyDeclared);

        Ok(())
    }

    /// Declares exchanges, then queues, on the connections that are
    /// `Started`. Connections in any other state are skipped and logged.
    ///
    /// # Parameters
    /// * `config` - Configuration the connections were created from
    ///
    /// # Returns
    /// The names of the skipped connections, sorted by name
    ///
    /// # Errors
    /// The first declaration error on a started connection, as in
    /// `declare_exchanges` and `declare_queues`
    pub async fn declare_started_topology(
        &mut self,
        config: &Configuration,
    ) -> Result<Vec<String>, MqError> {
        let (started, skipped): (Vec<_>, Vec<_>) = config
            .iter()
            .partition(|(name, _)| self.state(name) == ConnectionState::Started);

        for (name, _) in &skipped {
            warn!(
                connection = name.as_str(),
                "skipping topology of a connection that is not started"
            );
        }

        for (name, cfg) in &started {
            self.declare_exchanges_of(name, cfg).await?;
        }
        for (name, cfg) in &started {
            self.declare_queues_of(name, cfg).await?;
        }

        Ok(skipped.into_iter().map(|(name, _)| name.clone()).collect())
    }

    /// Returns the connection handle registered under `name`.
    ///
    /// # Errors
    /// * `UnknownConnection` if `create_connections` never saw `name`
    pub fn connection(&self, name: &str) -> Result<Arc<dyn BrokerConnection>, MqError> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| MqError::UnknownConnection(name.to_owned()))
    }

    /// Returns the exchange `exchange` declared on `connection`.
    ///
    /// # Parameters
    /// * `connection` - Logical connection name
    /// * `exchange` - Exchange name as configured
    ///
    /// # Errors
    /// * `UnknownExchange` if the pair was never declared
    pub fn exchange(
        &self,
        connection: &str,
        exchange: &str,
    ) -> Result<Arc<dyn BrokerExchange>, MqError> {
        self.exchanges
            .get(connection)
            .and_then(|declared| declared.get(exchange))
            .cloned()
            .ok_or_else(|| MqError::UnknownExchange {
                connection: connection.to_owned(),
                exchange: exchange.to_owned(),
            })
    }

    /// Returns the queue `queue` declared on `connection`.
    ///
    /// # Errors
    /// * `UnknownQueue` if the pair was never declared
    pub fn queue(&self, connection: &str, queue: &str) -> Result<Arc<dyn BrokerQueue>, MqError> {
        self.queues
            .get(connection)
            .and_then(|declared| declared.get(queue))
            .cloned()
            .ok_or_else(|| MqError::UnknownQueue {
                connection: connection.to_owned(),
                queue: queue.to_owned(),
            })
    }

    /// Lock guarding writes on the channel of `connection`.
    pub(crate) fn publish_lock(&self, connection: &str) -> Result<Arc<Mutex<()>>, MqError> {
        self.channels
            .get(connection)
            .map(|slot| slot.publish_lock.clone())
            .ok_or_else(|| MqError::UnknownConnection(connection.to_owned()))
    }

    /// Current state of `connection`; names never created are `Unconfigured`.
    pub fn state(&self, connection: &str) -> ConnectionState {
        self.states
            .get(connection)
            .copied()
            .unwrap_or(ConnectionState::Unconfigured)
    }

    pub fn connection_names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }
}
