// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The registry and the facade never talk to the network themselves. They call
//! into a `BrokerClient` and the handles it hands out: connections, channels,
//! exchanges and queues. `lapin_client` provides the RabbitMQ implementation;
//! tests plug in doubles.
//!
//! Handles are shared as `Arc<dyn ..>` so they can cross task boundaries.

use crate::{
    config::{ConnectionOptions, ExchangeSpec, QueueSpec},
    errors::AmqpError,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// Entry point into a broker client library.
#[cfg_attr(test, mockall::automock)]
pub trait BrokerClient: Send + Sync {
    /// Builds a connection handle for the logical connection `name`.
    ///
    /// Construction only: no network I/O happens until `BrokerConnection::start`.
    fn connect(
        &self,
        name: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens the connection with the broker.
    async fn start(&self) -> Result<(), AmqpError>;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A session over a connection. Not safe for concurrent writes: callers
/// serialize publishes on the same channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        spec: &ExchangeSpec,
    ) -> Result<Arc<dyn BrokerExchange>, AmqpError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<Arc<dyn BrokerQueue>, AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerExchange: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        options: &PublishOptions,
    ) -> Result<(), AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError>;

    /// Registers `handler` for every message delivered to this queue.
    ///
    /// `options` are already merged over the facade defaults. Whether this call
    /// occupies the caller until the consumer is cancelled is decided by
    /// `options.block`.
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError>;
}

/// Callback invoked once per delivered message.
///
/// May run on a different task or thread than the one that subscribed. With
/// manual acknowledgement the broker client acks the message when the handler
/// returns `Ok` and rejects it without requeue when it returns `Err`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        delivery: &DeliveryInfo,
        properties: &MessageProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError>;
}

/// Per-message publish settings. Messages are persistent unless told otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub persistent: bool,
    pub mandatory: bool,
    pub content_type: Option<String>,
    pub message_type: Option<String>,
    pub headers: BTreeMap<String, Value>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persistent: true,
            mandatory: false,
            content_type: None,
            message_type: None,
            headers: BTreeMap::new(),
        }
    }
}

impl PublishOptions {
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// Consumer settings. Unset fields fall back to the defaults they are merged
/// over; `arguments` are handed to the broker client untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    pub manual_ack: Option<bool>,
    pub block: Option<bool>,
    pub consumer_tag: Option<String>,
    pub exclusive: Option<bool>,
    pub arguments: BTreeMap<String, Value>,
}

impl SubscribeOptions {
    /// The facade defaults: manual acknowledgement, blocking subscription.
    pub fn defaults() -> SubscribeOptions {
        SubscribeOptions {
            manual_ack: Some(true),
            block: Some(true),
            ..SubscribeOptions::default()
        }
    }

    /// Merges these options over `base`, field by field. Keys set here win.
    pub fn merge_over(self, base: &SubscribeOptions) -> SubscribeOptions {
        let mut arguments = base.arguments.clone();
        arguments.extend(self.arguments);

        SubscribeOptions {
            manual_ack: self.manual_ack.or(base.manual_ack),
            block: self.block.or(base.block),
            consumer_tag: self.consumer_tag.or_else(|| base.consumer_tag.clone()),
            exclusive: self.exclusive.or(base.exclusive),
            arguments,
        }
    }

    pub fn manual_ack(mut self, manual_ack: bool) -> Self {
        self.manual_ack = Some(manual_ack);
        self
    }

    pub fn block(mut self, block: bool) -> Self {
        self.block = Some(block);
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub fn is_manual_ack(&self) -> bool {
        self.manual_ack.unwrap_or(true)
    }

    pub fn is_blocking(&self) -> bool {
        self.block.unwrap_or(true)
    }
}

/// Envelope data of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Properties a message was published with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, Value>,
}
