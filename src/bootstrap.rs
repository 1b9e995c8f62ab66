// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Startup Wiring
//!
//! Builds the process-wide `MessagingFacade` once at startup. The host hands
//! the returned `Arc` to every component that publishes or subscribes and calls
//! `MessagingFacade::shutdown` when it stops.
//!
//! ```no_run
//! # async fn run() -> Result<(), mq::errors::MqError> {
//! use mq::{bootstrap::MessagingBootstrap, lapin_client::LapinClient};
//! use std::sync::Arc;
//!
//! let facade = MessagingBootstrap::new("config/rabbit_mq.yml", "production")
//!     .fail_on_start_error()
//!     .run(Arc::new(LapinClient::new()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    broker::BrokerClient, config::Configuration, errors::MqError, facade::MessagingFacade,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

/// Startup sequence producing the shared `MessagingFacade`.
///
/// Connections that fail to start are logged. Unless `fail_on_start_error`
/// is set, the topology is still declared on every connection that did start.
pub struct MessagingBootstrap {
    path: PathBuf,
    environment: String,
    fail_on_start_error: bool,
}

impl MessagingBootstrap {
    /// # Parameters
    /// * `path` - YAML document listing every environment
    /// * `environment` - Key of the environment to select
    pub fn new(path: impl Into<PathBuf>, environment: &str) -> MessagingBootstrap {
        MessagingBootstrap {
            path: path.into(),
            environment: environment.to_owned(),
            fail_on_start_error: false,
        }
    }

    /// Makes `run` fail when any connection cannot be started. By default the
    /// failures are only logged and the failed connections get no topology.
    pub fn fail_on_start_error(mut self) -> Self {
        self.fail_on_start_error = true;
        self
    }

    /// Loads the configuration, then creates and starts connections and
    /// declares exchanges followed by queues.
    pub async fn run(self, client: Arc<dyn BrokerClient>) -> Result<Arc<MessagingFacade>, MqError> {
        let config = Configuration::load(&self.path, &self.environment)?;
        self.run_with(config, client).await
    }

    /// Same as `run` with an already loaded configuration.
    ///
    /// Every connection that was opened is closed again before an error is
    /// returned.
    pub async fn run_with(
        self,
        config: Configuration,
        client: Arc<dyn BrokerClient>,
    ) -> Result<Arc<MessagingFacade>, MqError> {
        let facade = MessagingFacade::new(config, client);

        facade.create_connections().await?;

        let failed: Vec<String> = facade
            .start_connections()
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|_| name))
            .collect();

        if !failed.is_empty() {
            error!(connections = ?failed, "some connections failed to start");
            if self.fail_on_start_error {
                facade.shutdown().await;
                return Err(MqError::ConnectionsFailed(failed));
            }
        }

        match facade.declare_started_topology().await {
            Ok(skipped) if !skipped.is_empty() => {
                warn!(connections = ?skipped, "topology not declared on some connections")
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = err.to_string(), "failure to declare topology");
                facade.shutdown().await;
                return Err(err);
            }
        }

        info!(
            environment = facade.configuration().environment(),
            connections = facade.configuration().len(),
            "messaging topology declared"
        );

        Ok(Arc::new(facade))
    }
}
