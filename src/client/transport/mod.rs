/*
 *
 * Copyright 2025 Crossbar authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! The boundary between the dispatch core and whatever actually moves bytes.
//! The core never opens sockets; it asks a registered [`Transport`] for a
//! connection and routes calls through the [`Service`] it returns.

use std::fmt::{Debug, Display};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tonic::async_trait;
use tracing::debug;

use crate::client::registry::SharedRegistry;
use crate::rt::Runtime;
use crate::service::Service;

/// The collection of transports a channel connects through, indexed by the
/// network type of the addresses they handle.  Channels consult their own
/// registry when given one, and [`GLOBAL_TRANSPORT_REGISTRY`] otherwise.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: SharedRegistry<dyn Transport>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport for a network type.  Registering the same type
    /// again replaces the previous transport.
    pub fn register(&self, network_type: &str, transport: impl Transport + 'static) {
        if self
            .transports
            .insert(network_type, Arc::new(transport))
            .is_some()
        {
            debug!(network_type, "replaced transport");
        }
    }

    /// Returns the transport for addresses of the given network type, if any.
    pub fn get_transport(&self, network_type: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(network_type)
    }
}

/// The process-wide transport registry, used by channels that were not given
/// a local one.
pub static GLOBAL_TRANSPORT_REGISTRY: LazyLock<TransportRegistry> =
    LazyLock::new(TransportRegistry::new);

/// Connection-level options handed to a transport.  Transport-specific
/// tuning travels in address attributes instead.
#[derive(Default)]
pub struct TransportOptions {
    /// The keepalive interval to use for the connection, reflecting any
    /// keepalive throttling the channel has accumulated.
    pub keepalive_time: Option<Duration>,
    /// Deadline for the connection attempt itself.
    pub connect_deadline: Option<Instant>,
}

/// An error produced by a transport, either while connecting or as the cause
/// of a disconnection.
#[derive(Debug, Default)]
pub struct TransportError {
    pub message: String,
    /// Set when the peer asked clients to slow their keepalives; the channel
    /// raises its keepalive time to at least this value.
    pub keepalive_throttle: Option<Duration>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            keepalive_throttle: None,
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<String> for TransportError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// An established connection.
pub struct ConnectedTransport {
    /// Sends calls over the connection.
    pub service: Arc<dyn Service>,
    /// Resolves when the connection terminates.  `Ok(())` is a clean close;
    /// an error carries the disconnection cause and any keepalive hint.
    pub disconnection_listener: oneshot::Receiver<Result<(), TransportError>>,
}

/// Creates connections for addresses of one network type.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: String,
        runtime: Arc<dyn Runtime>,
        opts: &TransportOptions,
    ) -> Result<ConnectedTransport, TransportError>;
}
