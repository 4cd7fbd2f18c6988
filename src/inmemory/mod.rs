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

//! An in-process transport: channels connect to services registered in the
//! same process, with no sockets involved.  Useful for tests and examples.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Once};

use tokio::sync::oneshot;
use tonic::async_trait;

use crate::client::name_resolution::{
    self, Address, Endpoint, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate, Target,
    GLOBAL_RESOLVER_REGISTRY,
};
use crate::client::transport::{
    self, ConnectedTransport, TransportError, TransportOptions, GLOBAL_TRANSPORT_REGISTRY,
};
use crate::rt::Runtime;
use crate::service::{Request, Response, Service};

pub static INMEMORY_NETWORK_TYPE: &str = "inmemory";

static ID: AtomicU32 = AtomicU32::new(0);

static LISTENERS: LazyLock<Mutex<HashMap<String, Arc<Listener>>>> = LazyLock::new(Mutex::default);

/// An in-process server endpoint.  Connecting to its target routes calls to
/// the wrapped service.
pub struct Listener {
    id: String,
    service: Arc<dyn Service>,
    #[allow(clippy::type_complexity)]
    closed_tx: Mutex<Vec<oneshot::Sender<Result<(), TransportError>>>>,
}

impl Listener {
    /// Registers a new listener for the given service and returns it.  The
    /// listener stays reachable until closed or dropped.
    pub fn new(service: Arc<dyn Service>) -> Arc<Self> {
        let listener = Arc::new(Self {
            id: format!("{}", ID.fetch_add(1, Ordering::Relaxed)),
            service,
            closed_tx: Mutex::new(Vec::new()),
        });
        LISTENERS
            .lock()
            .unwrap()
            .insert(listener.id.clone(), listener.clone());
        listener
    }

    /// The target URI that connects a channel to this listener.
    pub fn target(&self) -> String {
        format!("inmemory:///{}", self.id)
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    /// Makes the listener unreachable and signals disconnection to every
    /// established connection.
    pub fn close(&self) {
        LISTENERS.lock().unwrap().remove(&self.id);
        for tx in std::mem::take(&mut *self.closed_tx.lock().unwrap()) {
            let _ = tx.send(Ok(()));
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        LISTENERS.lock().unwrap().remove(&self.id);
        for tx in std::mem::take(&mut *self.closed_tx.lock().unwrap()) {
            let _ = tx.send(Ok(()));
        }
    }
}

#[async_trait]
impl Service for Arc<Listener> {
    async fn call(&self, method: String, request: Request) -> Response {
        self.service.call(method, request).await
    }
}

struct ClientTransport {}

#[async_trait]
impl transport::Transport for ClientTransport {
    async fn connect(
        &self,
        address: String,
        _runtime: Arc<dyn Runtime>,
        _opts: &TransportOptions,
    ) -> Result<ConnectedTransport, TransportError> {
        let listener = LISTENERS
            .lock()
            .unwrap()
            .get(&address)
            .ok_or_else(|| {
                TransportError::new(format!("no in-memory listener for address {address}"))
            })?
            .clone();
        let (tx, rx) = oneshot::channel();
        listener.closed_tx.lock().unwrap().push(tx);
        Ok(ConnectedTransport {
            service: Arc::new(listener),
            disconnection_listener: rx,
        })
    }
}

/// Registers the in-memory transport and resolver with the global
/// registries.  Idempotent.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_TRANSPORT_REGISTRY.register(INMEMORY_NETWORK_TYPE, ClientTransport {});
        GLOBAL_RESOLVER_REGISTRY
            .register(InMemoryResolverBuilder)
            .expect("inmemory is a valid scheme");
    });
}

struct InMemoryResolverBuilder;

impl ResolverBuilder for InMemoryResolverBuilder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let id = target.path().strip_prefix('/').unwrap_or("").to_string();
        options.work_scheduler.schedule_work();
        Box::new(name_resolution::NopResolver {
            update: Some(ResolverUpdate {
                endpoints: Ok(vec![Endpoint {
                    addresses: vec![Address {
                        network_type: INMEMORY_NETWORK_TYPE,
                        address: id.into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        })
    }

    fn scheme(&self) -> &'static str {
        "inmemory"
    }
}
