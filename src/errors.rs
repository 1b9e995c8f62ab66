// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Two layers of errors live here. `AmqpError` describes failures surfaced by a
//! broker client while connecting, declaring, publishing or consuming.
//! `MqError` is what callers of the registry and the facade see: configuration
//! problems, lookups of logical names that do not exist, and broker failures
//! passed through unchanged.

use thiserror::Error;

/// Represents errors raised by a broker client.
///
/// Every variant maps to one broker operation so callers can tell which step
/// of the lifecycle failed without parsing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// An operation needed an open connection but `start` was never called
    #[error("connection `{0}` was not started")]
    ConnectionNotStarted(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming or handling a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error closing a connection
    #[error("failure to close connection `{0}`")]
    CloseError(String),
}

/// Errors returned by configuration loading, the topology registry and the
/// messaging facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqError {
    #[error("missing configuration file: {0}")]
    ConfigFileMissing(String),

    #[error("failure to parse configuration: {0}")]
    ConfigParseError(String),

    #[error("missing configuration for `{0}` environment")]
    ConfigMissing(String),

    #[error("unknown connection `{0}`")]
    UnknownConnection(String),

    #[error("unknown exchange `{connection}/{exchange}`")]
    UnknownExchange { connection: String, exchange: String },

    #[error("unknown queue `{connection}/{queue}`")]
    UnknownQueue { connection: String, queue: String },

    /// A queue names a `bind` target that was not declared on its connection.
    #[error("queue `{connection}/{queue}` binds to undeclared exchange `{exchange}`")]
    UnresolvedExchangeBind {
        connection: String,
        queue: String,
        exchange: String,
    },

    #[error("connections failed to start: {}", .0.join(", "))]
    ConnectionsFailed(Vec<String>),

    #[error(transparent)]
    Broker(#[from] AmqpError),
}
