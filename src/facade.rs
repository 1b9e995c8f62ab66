// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Facade
//!
//! Publish and subscribe addressed by logical names. The facade owns the
//! configuration and the `TopologyRegistry`, forwards the setup steps to it and
//! resolves `(connection, exchange)` and `(connection, queue)` pairs into
//! broker handles.
//!
//! Publishes on one connection are serialized by the lock of its channel, so
//! two publishes never interleave their frames on the same channel. Publishes
//! on different connections proceed independently.

use crate::{
    broker::{BrokerClient, DeliveryHandler, PublishOptions, SubscribeOptions},
    config::Configuration,
    errors::{AmqpError, MqError},
    registry::{ConnectionState, TopologyRegistry},
};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error};

/// Publish and subscribe entry point shared by the whole process.
///
/// Setup steps take the registry's write lock; publishes and subscriptions
/// only read it.
pub struct MessagingFacade {
    config: Configuration,
    registry: RwLock<TopologyRegistry>,
    subscribe_defaults: SubscribeOptions,
}

impl MessagingFacade {
    /// Creates a facade over an empty registry.
    ///
    /// # Parameters
    /// * `config` - Validated configuration of the selected environment
    /// * `client` - Broker client used to build the connections
    ///
    /// # Returns
    /// A facade with subscribe defaults `{manual_ack: true, block: true}`
    pub fn new(config: Configuration, client: Arc<dyn BrokerClient>) -> MessagingFacade {
        MessagingFacade {
            config,
            registry: RwLock::new(TopologyRegistry::new(client)),
            subscribe_defaults: SubscribeOptions::defaults(),
        }
    }

    /// The configuration the facade was built from.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Read access to the underlying registry for handle lookups.
    pub async fn registry(&self) -> RwLockReadGuard<'_, TopologyRegistry> {
        self.registry.read().await
    }

    /// Current lifecycle state of `connection`.
    pub async fn state(&self, connection: &str) -> ConnectionState {
        self.registry.read().await.state(connection)
    }

    /// Builds one connection handle per configured connection, without I/O.
    pub async fn create_connections(&self) -> Result<(), MqError> {
        self.registry.write().await.create_connections(&self.config)
    }

    /// Opens every connection.
    ///
    /// # Returns
    /// The result of each logical connection, sorted by name
    pub async fn start_connections(&self) -> Vec<(String, Result<(), AmqpError>)> {
        self.registry.write().await.start_connections().await
    }

    /// Declares the configured exchanges on every connection.
    pub async fn declare_exchanges(&self) -> Result<(), MqError> {
        self.registry
            .write()
            .await
            .declare_exchanges(&self.config)
            .await
    }

    /// Declares the configured queues on every connection and binds them.
    ///
    /// # Errors
    /// * `UnresolvedExchangeBind` if a queue binds to an exchange that was not
    ///   declared on its connection
    pub async fn declare_queues(&self) -> Result<(), MqError> {
        self.registry.write().await.declare_queues(&self.config).await
    }

    /// Declares exchanges then queues on the started connections only.
    ///
    /// # Returns
    /// The names of the connections that were skipped because they are not
    /// started
    pub async fn declare_started_topology(&self) -> Result<Vec<String>, MqError> {
        self.registry
            .write()
            .await
            .declare_started_topology(&self.config)
            .await
    }

    /// Closes every connection and drops the declared topology.
    pub async fn shutdown(&self) -> Vec<(String, Result<(), AmqpError>)> {
        self.registry.write().await.close_connections().await
    }

    /// Publishes `payload` to the exchange `exchange` of `connection`.
    ///
    /// # Errors
    /// * `UnknownExchange` if the exchange was never declared; nothing is sent
    /// * `Broker` with the broker client's error if the publish itself fails
    pub async fn publish(
        &self,
        connection: &str,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), MqError> {
        let (handle, lock) = {
            let registry = self.registry.read().await;
            let handle = registry.exchange(connection, exchange)?;
            (handle, registry.publish_lock(connection)?)
        };

        debug!(connection, exchange, routing_key, "publishing message");

        let _guard = lock.lock().await;
        handle
            .publish(payload, routing_key, &options)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    connection, exchange, "error publishing message"
                );
                MqError::Broker(err)
            })
    }

    /// Registers `handler` on the queue `queue` of `connection`.
    ///
    /// `options` are merged over `{manual_ack: true, block: true}`. With
    /// `block` the call returns only when the consumer stops.
    pub async fn subscribe(
        &self,
        connection: &str,
        queue: &str,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), MqError> {
        let handle = self.registry.read().await.queue(connection, queue)?;
        let options = options.merge_over(&self.subscribe_defaults);

        debug!(
            connection,
            queue,
            manual_ack = options.is_manual_ack(),
            block = options.is_blocking(),
            "subscribing"
        );

        handle.subscribe(options, handler).await.map_err(|err| {
            error!(
                error = err.to_string(),
                connection, queue, "failure to subscribe"
            );
            MqError::Broker(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{
            BrokerChannel, BrokerConnection, BrokerExchange, BrokerQueue, MockBrokerChannel,
            MockBrokerClient, MockBrokerConnection, MockBrokerExchange, MockBrokerQueue,
            MockDeliveryHandler,
        },
        config::{ExchangeKind, ExchangeSpec, QueueSpec, VhostConfig},
    };
    use std::collections::BTreeMap;

    fn crm_config() -> Configuration {
        Configuration::from_connections(
            "test",
            BTreeMap::from([(
                "crm".to_owned(),
                VhostConfig::default()
                    .exchange(ExchangeSpec::new("alert", ExchangeKind::Direct).durable())
                    .queue(QueueSpec::new("alert", "alert").routing_key("alert")),
            )]),
        )
        .unwrap()
    }

    fn facade(exchange: MockBrokerExchange, queue: MockBrokerQueue) -> MessagingFacade {
        let exchange: Arc<dyn BrokerExchange> = Arc::new(exchange);
        let queue: Arc<dyn BrokerQueue> = Arc::new(queue);

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .returning(move |_| Ok(exchange.clone()));
        channel
            .expect_declare_queue()
            .returning(move |_| Ok(queue.clone()));
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

        let mut conn = MockBrokerConnection::new();
        conn.expect_start().returning(|| Ok(()));
        conn.expect_create_channel()
            .returning(move || Ok(channel.clone()));
        let conn: Arc<dyn BrokerConnection> = Arc::new(conn);

        let mut client = MockBrokerClient::new();
        client
            .expect_connect()
            .returning(move |_, _| Ok(conn.clone()));

        MessagingFacade::new(crm_config(), Arc::new(client))
    }

    fn bindable_queue() -> MockBrokerQueue {
        let mut queue = MockBrokerQueue::new();
        queue.expect_bind().returning(|_, _| Ok(()));
        queue
    }

    async fn declared(facade: &MessagingFacade) {
        facade.create_connections().await.unwrap();
        facade.start_connections().await;
        facade.declare_exchanges().await.unwrap();
        facade.declare_queues().await.unwrap();
    }

    #[tokio::test]
    async fn publish_marks_messages_persistent() {
        let mut exchange = MockBrokerExchange::new();
        exchange
            .expect_publish()
            .withf(|payload, key, options| {
                payload == b"hello" && key == "alert" && options.persistent
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let facade = facade(exchange, bindable_queue());
        declared(&facade).await;

        facade
            .publish("crm", "alert", "alert", b"hello", PublishOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_sends_nothing() {
        let mut exchange = MockBrokerExchange::new();
        exchange.expect_publish().times(0);

        let facade = facade(exchange, bindable_queue());
        declared(&facade).await;

        let err = facade
            .publish("crm", "billing", "alert", b"hello", PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MqError::UnknownExchange {
                connection: "crm".to_owned(),
                exchange: "billing".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn publish_before_declaration_fails() {
        let mut exchange = MockBrokerExchange::new();
        exchange.expect_publish().times(0);

        let facade = facade(exchange, bindable_queue());
        facade.create_connections().await.unwrap();

        let err = facade
            .publish("crm", "alert", "alert", b"hello", PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::UnknownExchange { .. }));
        assert_eq!(facade.state("crm").await, ConnectionState::Constructed);
    }

    #[tokio::test]
    async fn publish_errors_pass_through() {
        let mut exchange = MockBrokerExchange::new();
        exchange
            .expect_publish()
            .returning(|_, _, _| Err(AmqpError::PublishingError("alert".to_owned())));

        let facade = facade(exchange, bindable_queue());
        declared(&facade).await;

        let err = facade
            .publish("crm", "alert", "alert", b"hello", PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, MqError::Broker(AmqpError::PublishingError("alert".to_owned())));
    }

    #[tokio::test]
    async fn subscribe_merges_caller_options_over_defaults() {
        let mut queue = bindable_queue();
        queue
            .expect_subscribe()
            .withf(|options, _| {
                options.manual_ack == Some(false)
                    && options.block == Some(true)
                    && options.consumer_tag.as_deref() == Some("reports")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let facade = facade(MockBrokerExchange::new(), queue);
        declared(&facade).await;

        let options = SubscribeOptions::default()
            .manual_ack(false)
            .consumer_tag("reports");
        facade
            .subscribe("crm", "alert", options, Arc::new(MockDeliveryHandler::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_to_unknown_queue_fails() {
        let facade = facade(MockBrokerExchange::new(), bindable_queue());
        declared(&facade).await;

        let err = facade
            .subscribe(
                "billing",
                "alert",
                SubscribeOptions::default(),
                Arc::new(MockDeliveryHandler::new()),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MqError::UnknownQueue {
                connection: "billing".to_owned(),
                queue: "alert".to_owned(),
            }
        );
    }
}
