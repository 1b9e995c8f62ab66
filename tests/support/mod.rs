// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the integration tests.
//!
//! Routes direct, fanout and topic exchanges to bound queues, hands deliveries
//! to subscribers on spawned tasks and records the frames written by every
//! publish so tests can check that publishes on one channel never interleave.

#![allow(dead_code)]

use async_trait::async_trait;
use mq::{
    broker::{
        BrokerChannel, BrokerClient, BrokerConnection, BrokerExchange, BrokerQueue,
        DeliveryHandler, DeliveryInfo, MessageProperties, PublishOptions, SubscribeOptions,
    },
    config::{ConnectionOptions, ExchangeKind, ExchangeSpec, QueueSpec},
    AmqpError,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Begin(u64),
    End(u64),
}

struct Binding {
    connection: String,
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct Shared {
    failing: HashSet<String>,
    bindings: Mutex<Vec<Binding>>,
    subscribers: Mutex<HashMap<(String, String), Vec<Arc<dyn DeliveryHandler>>>>,
    subscribe_options: Mutex<Vec<SubscribeOptions>>,
    frames: Mutex<HashMap<String, Vec<Frame>>>,
    channels_created: AtomicUsize,
    closed: AtomicUsize,
    next_publish: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// A broker refusing to start the given logical connections.
    pub fn failing(names: &[&str]) -> MemoryBroker {
        MemoryBroker {
            shared: Arc::new(Shared {
                failing: names.iter().map(|name| name.to_string()).collect(),
                ..Shared::default()
            }),
        }
    }

    pub fn frames(&self, connection: &str) -> Vec<Frame> {
        self.shared
            .frames
            .lock()
            .unwrap()
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn channels_created(&self) -> usize {
        self.shared.channels_created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_options(&self) -> Vec<SubscribeOptions> {
        self.shared.subscribe_options.lock().unwrap().clone()
    }
}

impl BrokerClient for MemoryBroker {
    fn connect(
        &self,
        name: &str,
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        Ok(Arc::new(MemoryConnection {
            name: name.to_owned(),
            shared: self.shared.clone(),
            started: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    name: String,
    shared: Arc<Shared>,
    started: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn start(&self) -> Result<(), AmqpError> {
        if self.shared.failing.contains(&self.name) {
            return Err(AmqpError::ConnectionError(self.name.clone()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionNotStarted(self.name.clone()));
        }
        self.shared.channels_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            connection: self.name.clone(),
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.started.store(false, Ordering::SeqCst);
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    connection: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        spec: &ExchangeSpec,
    ) -> Result<Arc<dyn BrokerExchange>, AmqpError> {
        Ok(Arc::new(MemoryExchange {
            connection: self.connection.clone(),
            name: spec.name.clone(),
            kind: spec.kind,
            shared: self.shared.clone(),
        }))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<Arc<dyn BrokerQueue>, AmqpError> {
        Ok(Arc::new(MemoryQueue {
            connection: self.connection.clone(),
            name: spec.name.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryExchange {
    connection: String,
    name: String,
    kind: ExchangeKind,
    shared: Arc<Shared>,
}

impl MemoryExchange {
    fn write(&self, frame: Frame) {
        self.shared
            .frames
            .lock()
            .unwrap()
            .entry(self.connection.clone())
            .or_default()
            .push(frame);
    }

    fn routes_to(&self, binding: &Binding, routing_key: &str) -> bool {
        if binding.connection != self.connection || binding.exchange != self.name {
            return false;
        }
        match self.kind {
            ExchangeKind::Direct => binding.routing_key == routing_key,
            ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
        }
    }
}

#[async_trait]
impl BrokerExchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let id = self.shared.next_publish.fetch_add(1, Ordering::SeqCst);

        // A publish spans several writes; give other tasks the chance to
        // squeeze in between them.
        self.write(Frame::Begin(id));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_micros(50)).await;
        self.write(Frame::End(id));

        let queues: Vec<String> = self
            .shared
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|binding| self.routes_to(binding, routing_key))
            .map(|binding| binding.queue.clone())
            .collect();

        for queue in queues {
            let handlers = self
                .shared
                .subscribers
                .lock()
                .unwrap()
                .get(&(self.connection.clone(), queue))
                .cloned()
                .unwrap_or_default();

            for handler in handlers {
                let info = DeliveryInfo {
                    consumer_tag: "memory".to_owned(),
                    delivery_tag: id,
                    redelivered: false,
                    exchange: self.name.clone(),
                    routing_key: routing_key.to_owned(),
                };
                let properties = MessageProperties {
                    content_type: options.content_type.clone(),
                    message_id: Some(id.to_string()),
                    message_type: options.message_type.clone(),
                    persistent: options.persistent,
                    headers: options.headers.clone(),
                };
                let payload = payload.to_vec();

                tokio::spawn(async move {
                    let _ = handler.handle(&info, &properties, &payload).await;
                });
            }
        }

        Ok(())
    }
}

struct MemoryQueue {
    connection: String,
    name: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.shared.bindings.lock().unwrap().push(Binding {
            connection: self.connection.clone(),
            exchange: exchange.to_owned(),
            queue: self.name.clone(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError> {
        self.shared.subscribe_options.lock().unwrap().push(options);
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .entry((self.connection.clone(), self.name.clone()))
            .or_default()
            .push(handler);
        Ok(())
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

pub type Received = (DeliveryInfo, MessageProperties, Vec<u8>);

/// Forwards every delivery to a channel the test reads from.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Received>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<Received>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { tx }), rx)
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(
        &self,
        delivery: &DeliveryInfo,
        properties: &MessageProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.tx
            .send((delivery.clone(), properties.clone(), payload.to_vec()))
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }
}

/// Asserts that every `Begin(id)` is immediately followed by `End(id)`.
pub fn assert_not_interleaved(frames: &[Frame]) {
    assert_eq!(frames.len() % 2, 0, "unterminated publish in {:?}", frames);
    for pair in frames.chunks(2) {
        match pair {
            [Frame::Begin(begin), Frame::End(end)] => {
                assert_eq!(begin, end, "interleaved publishes in {:?}", frames)
            }
            other => panic!("interleaved publishes: {:?}", other),
        }
    }
}

