// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Client
//!
//! `BrokerClient` implementation on top of `lapin`. Connection handles are
//! built without I/O; `start` opens the AMQP connection. Channels, exchanges
//! and queues map one to one onto lapin calls.
//!
//! Consumers run their delivery loop on a spawned tokio task, so subscribing
//! requires a tokio runtime.

use crate::{
    broker::{
        BrokerChannel, BrokerClient, BrokerConnection, BrokerExchange, BrokerQueue,
        DeliveryHandler, DeliveryInfo, MessageProperties, PublishOptions, SubscribeOptions,
    },
    config::{ConnectionOptions, ExchangeKind, ExchangeSpec, QueueSpec},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use opentelemetry::trace::{Span, Status};
use serde_json::Value;
use std::{borrow::Cow, collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Delivery mode flagging a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// `BrokerClient` backed by lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinClient {}

impl LapinClient {
    pub fn new() -> LapinClient {
        LapinClient {}
    }
}

impl BrokerClient for LapinClient {
    fn connect(
        &self,
        name: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(name.to_owned()));
        for (key, value) in &options.extra {
            properties
                .client_properties
                .insert(ShortString::from(key.clone()), amqp_value(value));
        }

        Ok(Arc::new(LapinConnection {
            name: name.to_owned(),
            uri: amqp_uri(options),
            properties,
            connection: RwLock::new(None),
        }))
    }
}

/// Builds the lapin URI from connection options.
///
/// Timeouts and limits travel in the URI query, where lapin reads them when
/// negotiating the connection.
pub(crate) fn amqp_uri(options: &ConnectionOptions) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: options.username().to_owned(),
                password: options.password().to_owned(),
            },
            host: options.host().to_owned(),
            port: options.port(),
        },
        vhost: options.vhost().to_owned(),
        query: AMQPQueryString {
            frame_max: options.frame_max,
            channel_max: options.channel_max,
            heartbeat: options.heartbeat,
            connection_timeout: options.connection_timeout,
            ..AMQPQueryString::default()
        },
        ..AMQPUri::default()
    }
}

/// Converts a configuration value into an AMQP field value.
pub(crate) fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => match i32::try_from(v) {
                Ok(v) => AMQPValue::LongInt(v),
                Err(_) => AMQPValue::LongLongInt(v),
            },
            (None, Some(v)) => AMQPValue::Double(v),
            (None, None) => AMQPValue::Void,
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}

pub(crate) fn field_table<'a>(entries: impl IntoIterator<Item = (&'a String, &'a Value)>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in entries {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

/// Converts an AMQP field value back into a JSON value for handlers.
fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::from(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::ShortString(v) => Value::from(v.as_str()),
        AMQPValue::LongString(v) => Value::from(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(json_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.to_string(), json_value(value)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn message_properties(props: &AMQPProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        message_type: props.kind().as_ref().map(|v| v.to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers: props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(key, value)| (key.to_string(), json_value(value)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

struct LapinConnection {
    name: String,
    uri: AMQPUri,
    properties: ConnectionProperties,
    connection: RwLock<Option<Connection>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn start(&self) -> Result<(), AmqpError> {
        debug!(connection = self.name.as_str(), "creating amqp connection...");

        let conn = match Connection::connect_uri(self.uri.clone(), self.properties.clone()).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    connection = self.name.as_str(),
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError(self.name.clone()))
            }
        }?;

        *self.connection.write().await = Some(conn);
        debug!(connection = self.name.as_str(), "amqp connected");

        Ok(())
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let guard = self.connection.read().await;
        let Some(conn) = guard.as_ref() else {
            return Err(AmqpError::ConnectionNotStarted(self.name.clone()));
        };

        debug!(connection = self.name.as_str(), "creating amqp channel...");
        let channel = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(self.name.clone())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(self.name.clone())
            })?;

        debug!(connection = self.name.as_str(), "channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let Some(conn) = self.connection.write().await.take() else {
            return Ok(());
        };

        conn.close(200, "OK").await.map_err(|err| {
            error!(
                error = err.to_string(),
                connection = self.name.as_str(),
                "failure to close connection"
            );
            AmqpError::CloseError(self.name.clone())
        })
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        spec: &ExchangeSpec,
    ) -> Result<Arc<dyn BrokerExchange>, AmqpError> {
        debug!("creating exchange: {}", spec.name);

        self.channel
            .exchange_declare(
                &spec.name,
                spec.kind.into(),
                ExchangeDeclareOptions {
                    passive: spec.options.passive,
                    durable: spec.options.durable,
                    auto_delete: spec.options.auto_delete,
                    internal: spec.options.internal,
                    nowait: spec.options.no_wait,
                },
                field_table(&spec.options.arguments),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = spec.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(spec.name.clone())
            })?;

        debug!("exchange: {} was created", spec.name);

        Ok(Arc::new(LapinExchange {
            channel: self.channel.clone(),
            name: spec.name.clone(),
        }))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<Arc<dyn BrokerQueue>, AmqpError> {
        debug!("creating queue: {}", spec.name);

        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: spec.options.passive,
                    durable: spec.options.durable,
                    exclusive: spec.options.exclusive,
                    auto_delete: spec.options.auto_delete,
                    nowait: spec.options.no_wait,
                },
                field_table(&spec.options.declare_arguments()),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = spec.name.as_str(),
                    "error to declare the queue"
                );
                AmqpError::DeclareQueueError(spec.name.clone())
            })?;

        debug!("queue: {} was created", spec.name);

        Ok(Arc::new(LapinQueue {
            channel: self.channel.clone(),
            name: spec.name.clone(),
        }))
    }
}

struct LapinExchange {
    channel: Channel,
    name: String,
}

#[async_trait]
impl BrokerExchange for LapinExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_current(&mut headers);
        for (key, value) in &options.headers {
            headers.insert(ShortString::from(key.clone()), amqp_value(value));
        }

        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));
        if options.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(content_type) = &options.content_type {
            props = props.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(kind) = &options.message_type {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        let publish_error = |err: lapin::Error| {
            error!(
                error = err.to_string(),
                exchange = self.name.as_str(),
                "error publishing message"
            );
            AmqpError::PublishingError(self.name.clone())
        };

        let confirmation = self
            .channel
            .basic_publish(
                &self.name,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: false,
                },
                payload,
                props,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        match confirmation {
            Confirmation::Nack(_) => {
                error!(exchange = self.name.as_str(), "broker rejected message");
                Err(AmqpError::PublishingError(self.name.clone()))
            }
            Confirmation::Ack(Some(_)) => {
                warn!(
                    exchange = self.name.as_str(),
                    routing_key, "message returned as unroutable"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

struct LapinQueue {
    channel: Channel,
    name: String,
}

#[async_trait]
impl BrokerQueue for LapinQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &self.name,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), self.name.clone())
            })
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError> {
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, Uuid::new_v4()));
        let manual_ack = options.is_manual_ack();

        let mut consumer = self
            .channel
            .basic_consume(
                &self.name,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: !manual_ack,
                    exclusive: options.exclusive.unwrap_or(false),
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(self.name.clone())
            })?;

        let queue = self.name.clone();
        let worker = tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) =
                            consume(&queue, &tag, &delivery, manual_ack, handler.as_ref()).await
                        {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!(queue = queue.as_str(), "consumer stopped");
        });

        if options.is_blocking() {
            worker
                .await
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))?;
        }

        Ok(())
    }
}

/// Hands one delivery to `handler`, then acks it on success or rejects it
/// without requeue on failure when acknowledgement is manual.
async fn consume(
    queue: &str,
    consumer_tag: &str,
    delivery: &Delivery,
    manual_ack: bool,
    handler: &dyn DeliveryHandler,
) -> Result<(), AmqpError> {
    let mut span = otel::consumer_span(&delivery.properties, queue);

    let info = DeliveryInfo {
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
    };
    let properties = message_properties(&delivery.properties);

    debug!(
        "received: {} - exchange: {}",
        info.delivery_tag, info.exchange
    );

    let result = handler.handle(&info, &properties, &delivery.data).await;

    if let Err(err) = &result {
        warn!(error = err.to_string(), queue, "handler failed to process message");
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from("handler failure"),
        });
    } else {
        span.set_status(Status::Ok);
    }

    if !manual_ack {
        return Ok(());
    }

    match result {
        Ok(()) => delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            }),
        Err(_) => delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            }),
    }
}
