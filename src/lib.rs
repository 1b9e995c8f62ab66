// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Configuration-driven RabbitMQ topology and messaging.
//!
//! A YAML document describes, per environment, the broker connections and the
//! exchanges and queues declared on each of them. `registry` turns it into
//! live handles indexed by logical name and `facade` publishes and subscribes
//! through those names.

mod otel;

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod errors;
pub mod facade;
pub mod lapin_client;
pub mod registry;

pub use bootstrap::MessagingBootstrap;
pub use errors::{AmqpError, MqError};
pub use facade::MessagingFacade;
pub use registry::{ConnectionState, TopologyRegistry};
