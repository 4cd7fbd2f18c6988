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

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::client::backoff::Backoff;
use crate::client::channel::{InternalChannelController, WorkQueueItem, WorkQueueTx};
use crate::client::load_balancing::{DataWatcher, Subchannel, SubchannelState};
use crate::client::name_resolution::Address;
use crate::client::transport::{Transport, TransportError, TransportOptions};
use crate::client::ConnectivityState;
use crate::rt::{Runtime, TaskHandle};
use crate::service::Service;

pub(crate) type SharedService = Arc<dyn Service>;

/// The process-wide subchannel pool, used by channels not configured with a
/// local one.
pub(crate) static GLOBAL_SUBCHANNEL_POOL: LazyLock<Arc<InternalSubchannelPool>> =
    LazyLock::new(InternalSubchannelPool::new);

// Uniquely identifies a subchannel in the pool.  The default authority is
// folded in so channels with different authorities never share a connection.
#[derive(PartialEq, PartialOrd, Eq, Ord, Clone)]
pub(crate) struct SubchannelKey {
    pub(crate) address: Address,
    pub(crate) authority: String,
}

impl SubchannelKey {
    pub(crate) fn new(address: Address, authority: String) -> Self {
        Self { address, authority }
    }
}

impl Display for SubchannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.address, self.authority)
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

enum InternalSubchannelState {
    Idle,
    Connecting(ConnectingState),
    Ready(ReadyState),
    TransientFailure(TransientFailureState),
}

struct ConnectingState {
    connect_task: Option<Box<dyn TaskHandle>>,
}

struct ReadyState {
    disconnect_task: Option<Box<dyn TaskHandle>>,
    svc: SharedService,
}

struct TransientFailureState {
    backoff_task: Option<Box<dyn TaskHandle>>,
    error: String,
}

impl InternalSubchannelState {
    fn connected_service(&self) -> Option<SharedService> {
        match self {
            Self::Ready(st) => Some(st.svc.clone()),
            _ => None,
        }
    }

    fn name(&self) -> ConnectivityState {
        match self {
            Self::Idle => ConnectivityState::Idle,
            Self::Connecting(_) => ConnectivityState::Connecting,
            Self::Ready(_) => ConnectivityState::Ready,
            Self::TransientFailure(_) => ConnectivityState::TransientFailure,
        }
    }

    fn to_subchannel_state(&self) -> SubchannelState {
        match self {
            Self::TransientFailure(st) => {
                let err: Arc<dyn std::error::Error + Send + Sync> =
                    Arc::from(Box::from(st.error.clone()));
                SubchannelState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    last_connection_error: Some(err),
                    keepalive_throttle: None,
                }
            }
            other => SubchannelState {
                connectivity_state: other.name(),
                ..Default::default()
            },
        }
    }
}

impl Drop for InternalSubchannelState {
    fn drop(&mut self) {
        let handle = match self {
            Self::Idle => None,
            Self::Connecting(st) => st.connect_task.take(),
            Self::Ready(st) => st.disconnect_task.take(),
            Self::TransientFailure(st) => st.backoff_task.take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

enum StateMachineEvent {
    ConnectionRequested,
    ConnectionSucceeded(SharedService, oneshot::Receiver<Result<(), TransportError>>),
    ConnectionTimedOut,
    ConnectionFailed(TransportError),
    ConnectionTerminated(Option<TransportError>),
    BackoffExpired,
}

impl Debug for StateMachineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRequested => write!(f, "ConnectionRequested"),
            Self::ConnectionSucceeded(_, _) => write!(f, "ConnectionSucceeded"),
            Self::ConnectionTimedOut => write!(f, "ConnectionTimedOut"),
            Self::ConnectionFailed(err) => write!(f, "ConnectionFailed({err})"),
            Self::ConnectionTerminated(_) => write!(f, "ConnectionTerminated"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
        }
    }
}

/// An addressable, potentially-connected endpoint.  Owns the connect/backoff
/// state machine; shared between channels through the subchannel pool.
pub(crate) struct InternalSubchannel {
    key: SubchannelKey,
    transport: Arc<dyn Transport>,
    backoff: Arc<dyn Backoff>,
    event_tx: mpsc::UnboundedSender<StateMachineEvent>,
    inner: Mutex<InnerSubchannel>,
    // Monotonically non-decreasing; handed to the transport on each connect.
    effective_keepalive: Mutex<Option<Duration>>,
    runtime: Arc<dyn Runtime>,
    pool: Weak<InternalSubchannelPool>,
}

struct InnerSubchannel {
    state: InternalSubchannelState,
    watchers: Vec<Arc<SubchannelStateWatcher>>,
}

impl InternalSubchannel {
    pub(crate) fn new(
        key: SubchannelKey,
        transport: Arc<dyn Transport>,
        backoff: Arc<dyn Backoff>,
        runtime: Arc<dyn Runtime>,
        pool: Weak<InternalSubchannelPool>,
    ) -> Arc<InternalSubchannel> {
        let (tx, mut rx) = mpsc::unbounded_channel::<StateMachineEvent>();
        let isc = Arc::new(Self {
            key: key.clone(),
            transport,
            backoff,
            event_tx: tx,
            inner: Mutex::new(InnerSubchannel {
                state: InternalSubchannelState::Idle,
                watchers: Vec::new(),
            }),
            effective_keepalive: Mutex::new(None),
            runtime: runtime.clone(),
            pool,
        });

        // The state machine task.  It holds only a weak reference so that
        // dropping the last external reference tears the subchannel down; the
        // event channel then closes and the task exits.
        let weak = Arc::downgrade(&isc);
        runtime.spawn(Box::pin(async move {
            trace!(subchannel = %key, "starting subchannel state machine");
            while let Some(event) = rx.recv().await {
                let Some(isc) = weak.upgrade() else { break };
                trace!(subchannel = %isc.key, ?event, "subchannel event");
                match event {
                    StateMachineEvent::ConnectionRequested => isc.move_to_connecting(),
                    StateMachineEvent::ConnectionSucceeded(svc, closed_rx) => {
                        isc.move_to_ready(svc, closed_rx)
                    }
                    StateMachineEvent::ConnectionTimedOut => isc.move_to_transient_failure(
                        TransportError::new("connect timeout expired"),
                    ),
                    StateMachineEvent::ConnectionFailed(err) => {
                        isc.move_to_transient_failure(err)
                    }
                    StateMachineEvent::ConnectionTerminated(cause) => isc.move_to_idle(cause),
                    StateMachineEvent::BackoffExpired => isc.move_to_idle(None),
                }
            }
            trace!("exiting subchannel state machine");
        }));
        isc
    }

    pub(crate) fn address(&self) -> Address {
        self.key.address.clone()
    }

    /// Begins connecting asynchronously.  If `now` is set, does not wait for
    /// any pending connection backoff to complete.
    pub(crate) fn connect(&self, now: bool) {
        let inner = self.inner.lock().unwrap();
        match &inner.state {
            InternalSubchannelState::Idle => {
                let _ = self.event_tx.send(StateMachineEvent::ConnectionRequested);
            }
            InternalSubchannelState::TransientFailure(_) if now => {
                let _ = self.event_tx.send(StateMachineEvent::BackoffExpired);
            }
            _ => {}
        }
    }

    /// Resets the connection backoff.  A subchannel sitting out its backoff
    /// returns to IDLE immediately so the LB policy can reconnect it.
    pub(crate) fn reset_backoff(&self) {
        self.backoff.reset();
        let inner = self.inner.lock().unwrap();
        if let InternalSubchannelState::TransientFailure(_) = inner.state {
            let _ = self.event_tx.send(StateMachineEvent::BackoffExpired);
        }
    }

    /// Raises the keepalive time used for future connections.  Lower values
    /// are ignored; the effective value never decreases.
    pub(crate) fn throttle_keepalive_time(&self, keepalive_time: Duration) {
        let mut effective = self.effective_keepalive.lock().unwrap();
        if effective.is_none_or(|cur| keepalive_time > cur) {
            debug!(subchannel = %self.key, ?keepalive_time, "throttling keepalive time");
            *effective = Some(keepalive_time);
        }
    }

    pub(crate) fn connected_service(&self) -> Option<SharedService> {
        self.inner.lock().unwrap().state.connected_service()
    }

    pub(crate) fn register_connectivity_state_watcher(&self, watcher: Arc<SubchannelStateWatcher>) {
        let state = {
            let mut inner = self.inner.lock().unwrap();
            inner.watchers.push(watcher.clone());
            inner.state.to_subchannel_state()
        };
        watcher.on_state_change(state);
    }

    pub(crate) fn unregister_connectivity_state_watcher(
        &self,
        watcher: &Arc<SubchannelStateWatcher>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .watchers
            .retain(|x| !Arc::ptr_eq(x, watcher));
    }

    fn set_state_and_notify(&self, state: InternalSubchannelState, notified: SubchannelState) {
        let watchers = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = state;
            inner.watchers.clone()
        };
        for watcher in watchers {
            watcher.on_state_change(notified.clone());
        }
    }

    fn move_to_idle(&self, cause: Option<TransportError>) {
        let keepalive_throttle = cause.as_ref().and_then(|c| c.keepalive_throttle);
        self.set_state_and_notify(
            InternalSubchannelState::Idle,
            SubchannelState {
                connectivity_state: ConnectivityState::Idle,
                last_connection_error: None,
                keepalive_throttle,
            },
        );
    }

    fn move_to_connecting(&self) {
        let min_connect_timeout = self.backoff.min_connect_timeout();
        let transport = self.transport.clone();
        let address = self.address().address.to_string();
        let event_tx = self.event_tx.clone();
        let runtime = self.runtime.clone();
        let transport_opts = TransportOptions {
            keepalive_time: *self.effective_keepalive.lock().unwrap(),
            connect_deadline: Some(Instant::now() + min_connect_timeout),
        };

        let connect_task = self.runtime.spawn(Box::pin(async move {
            tokio::select! {
                _ = runtime.clone().sleep(min_connect_timeout) => {
                    let _ = event_tx.send(StateMachineEvent::ConnectionTimedOut);
                }
                result = transport.connect(address, runtime.clone(), &transport_opts) => {
                    match result {
                        Ok(conn) => {
                            let _ = event_tx.send(StateMachineEvent::ConnectionSucceeded(
                                conn.service,
                                conn.disconnection_listener,
                            ));
                        }
                        Err(err) => {
                            let _ = event_tx.send(StateMachineEvent::ConnectionFailed(err));
                        }
                    }
                }
            }
        }));
        self.set_state_and_notify(
            InternalSubchannelState::Connecting(ConnectingState {
                connect_task: Some(connect_task),
            }),
            SubchannelState {
                connectivity_state: ConnectivityState::Connecting,
                ..Default::default()
            },
        );
    }

    fn move_to_ready(
        &self,
        svc: SharedService,
        closed_rx: oneshot::Receiver<Result<(), TransportError>>,
    ) {
        self.backoff.reset();
        let event_tx = self.event_tx.clone();
        let disconnect_task = self.runtime.spawn(Box::pin(async move {
            let cause = match closed_rx.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                // The transport dropped its end without reporting.
                Err(_) => Some(TransportError::new("transport closed abruptly")),
            };
            let _ = event_tx.send(StateMachineEvent::ConnectionTerminated(cause));
        }));
        self.set_state_and_notify(
            InternalSubchannelState::Ready(ReadyState {
                disconnect_task: Some(disconnect_task),
                svc,
            }),
            SubchannelState {
                connectivity_state: ConnectivityState::Ready,
                ..Default::default()
            },
        );
    }

    fn move_to_transient_failure(&self, err: TransportError) {
        debug!(subchannel = %self.key, %err, "connection attempt failed");
        let backoff_until = self.backoff.backoff_until();
        let event_tx = self.event_tx.clone();
        let runtime = self.runtime.clone();
        let backoff_task = self.runtime.spawn(Box::pin(async move {
            runtime
                .sleep(backoff_until.saturating_duration_since(Instant::now()))
                .await;
            let _ = event_tx.send(StateMachineEvent::BackoffExpired);
        }));
        let keepalive_throttle = err.keepalive_throttle;
        let message = err.message.clone();
        let connection_error: Arc<dyn std::error::Error + Send + Sync> =
            Arc::from(Box::from(message.clone()));
        self.set_state_and_notify(
            InternalSubchannelState::TransientFailure(TransientFailureState {
                backoff_task: Some(backoff_task),
                error: message,
            }),
            SubchannelState {
                connectivity_state: ConnectivityState::TransientFailure,
                last_connection_error: Some(connection_error),
                keepalive_throttle,
            },
        );
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        trace!(subchannel = %self.key, "dropping internal subchannel");
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister_subchannel(&self.key);
        }
    }
}

/// A pool of internal subchannels, shared either process-wide or per channel.
/// Holds weak references only; a subchannel lives exactly as long as some
/// wrapper references it.
pub(crate) struct InternalSubchannelPool {
    subchannels: RwLock<BTreeMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

impl InternalSubchannelPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            subchannels: RwLock::new(BTreeMap::new()),
        })
    }

    pub(crate) fn lookup_subchannel(&self, key: &SubchannelKey) -> Option<Arc<InternalSubchannel>> {
        self.subchannels
            .read()
            .unwrap()
            .get(key)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn register_subchannel(
        &self,
        key: &SubchannelKey,
        isc: Arc<InternalSubchannel>,
    ) -> Arc<InternalSubchannel> {
        trace!(subchannel = %key, "registering subchannel in the pool");
        self.subchannels
            .write()
            .unwrap()
            .insert(key.clone(), Arc::downgrade(&isc));
        isc
    }

    pub(crate) fn unregister_subchannel(&self, key: &SubchannelKey) {
        let mut subchannels = self.subchannels.write().unwrap();
        if let Some(weak_isc) = subchannels.get(key) {
            // A replacement may have been registered under the same key while
            // the dying subchannel's drop was in flight.
            if weak_isc.upgrade().is_some() {
                return;
            }
            trace!(subchannel = %key, "removing subchannel from the pool");
            subchannels.remove(key);
        }
    }
}

/// The channel's view of a subchannel as exposed to LB policies.
///
/// The wrapper owns a strong reference to the internal subchannel and hops
/// every connectivity notification onto the channel's control-plane
/// serializer before it reaches the policy.  The backing is None for
/// wrappers created while the channel was shutting down; those are inert.
pub(crate) struct ExternalSubchannel {
    address: Address,
    isc: Option<Arc<InternalSubchannel>>,
    work_tx: WorkQueueTx,
    watcher: Mutex<Option<Arc<SubchannelStateWatcher>>>,
    data_watchers: Mutex<Vec<Arc<dyn DataWatcher>>>,
}

impl ExternalSubchannel {
    pub(crate) fn new(
        address: Address,
        isc: Option<Arc<InternalSubchannel>>,
        work_tx: WorkQueueTx,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            isc,
            work_tx,
            watcher: Mutex::new(None),
            data_watchers: Mutex::new(Vec::new()),
        })
    }

    /// Installs the serializer-hopping connectivity watcher.  Called once,
    /// right after creation, from the control-plane serializer.
    pub(crate) fn start_watching(self: &Arc<Self>) {
        let Some(isc) = &self.isc else { return };
        let watcher = Arc::new(SubchannelStateWatcher {
            subchannel: Arc::downgrade(self),
            work_tx: self.work_tx.clone(),
        });
        *self.watcher.lock().unwrap() = Some(watcher.clone());
        isc.register_connectivity_state_watcher(watcher);
    }

    pub(crate) fn key(&self) -> Option<SubchannelKey> {
        self.isc.as_ref().map(|isc| isc.key.clone())
    }

    pub(crate) fn throttle_keepalive_time(&self, keepalive_time: Duration) {
        if let Some(isc) = &self.isc {
            isc.throttle_keepalive_time(keepalive_time);
        }
    }
}

impl Subchannel for ExternalSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        if let Some(isc) = &self.isc {
            isc.connect(false);
        }
    }

    fn reset_backoff(&self) {
        if let Some(isc) = &self.isc {
            isc.reset_backoff();
        }
    }

    fn add_data_watcher(&self, watcher: Arc<dyn DataWatcher>) {
        self.data_watchers.lock().unwrap().push(watcher);
    }

    fn cancel_data_watcher(&self, watcher: &Arc<dyn DataWatcher>) {
        self.data_watchers
            .lock()
            .unwrap()
            .retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn connected_service(&self) -> Option<SharedService> {
        self.isc.as_ref().and_then(|isc| isc.connected_service())
    }
}

impl Display for ExternalSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Debug for ExternalSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Drop for ExternalSubchannel {
    fn drop(&mut self) {
        let Some(isc) = &self.isc else { return };
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            isc.unregister_connectivity_state_watcher(&watcher);
        }
        self.data_watchers.lock().unwrap().clear();
        // Bookkeeping for the channel's per-subchannel presence count runs on
        // the serializer; if the channel is already gone this is a no-op.
        let key = isc.key.clone();
        let _ = self
            .work_tx
            .send(WorkQueueItem::Closure(Box::new(move |controller| {
                controller.on_subchannel_wrapper_released(&key);
            })));
    }
}

/// Bridges internal subchannel notifications onto the channel's control-plane
/// serializer before they reach the LB policy.  The hop is mandatory: LB
/// policies assume single-threaded control-plane execution.
pub(crate) struct SubchannelStateWatcher {
    subchannel: Weak<ExternalSubchannel>,
    work_tx: WorkQueueTx,
}

impl SubchannelStateWatcher {
    pub(crate) fn on_state_change(&self, state: SubchannelState) {
        // Updates racing with wrapper teardown are inconsequential; skip them.
        let Some(sc) = self.subchannel.upgrade() else {
            return;
        };
        let sent = self
            .work_tx
            .send(WorkQueueItem::Closure(Box::new(
                move |controller: &mut InternalChannelController| {
                    controller.handle_subchannel_update(sc, &state);
                },
            )))
            .is_ok();
        if !sent {
            warn!("dropping subchannel update: channel serializer is gone");
        }
    }
}
