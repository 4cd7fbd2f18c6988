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

//! The channel: a logical, persistent connection to a target.
//!
//! A channel coordinates four largely independent state machines: name
//! resolution, service-config distribution, the load-balancing policy, and
//! the per-call pipeline.  Everything on the control plane runs on a single
//! serializer task that drains a queue of closures; the data plane reads
//! published snapshots (the resolution watch and the picker holder) without
//! ever entering the serializer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, watch, Notify};
use tonic::{async_trait, Status};
use tracing::{debug, info, warn};

use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::call::{self, rewrite_illegal_status, LbCallDispatcher};
use crate::client::config_selector::{selectors_eq, ConfigSelector, DefaultConfigSelector};
use crate::client::connectivity_state::ConnectivityStateTracker;
use crate::client::filters::{CallFilter, DynamicFilters};
use crate::client::load_balancing::{
    self, pick_first, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbPolicyRegistry,
    LbState, ParsedJsonLbConfig, PickResult, Subchannel, SubchannelState, WorkScheduler,
    GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{
    self, Address, Resolver, ResolverOptions, ResolverRegistry, ResolverUpdate, Target,
    GLOBAL_RESOLVER_REGISTRY,
};
use crate::client::service_config::{LbConfig, ServiceConfig};
use crate::client::subchannel::{
    ExternalSubchannel, InternalSubchannel, InternalSubchannelPool, SubchannelKey,
    GLOBAL_SUBCHANNEL_POOL,
};
use crate::client::{ConnectivityState, StateWatcher};
use crate::rt::{default_runtime, Runtime, TaskHandle};
use crate::service::{empty_request, Request, Response, Service};

/// Configuration for a new channel.  All fields are optional.
#[derive(Default)]
pub struct ChannelOptions {
    /// Overrides the authority derived from the target URI.
    pub override_authority: Option<String>,
    /// Used when the resolver does not supply a service config.
    pub default_service_config: Option<ServiceConfig>,
    /// Names the LB policy to use when the service config does not specify
    /// one.  Must be registered and must accept an empty config; otherwise
    /// the channel falls back to `pick_first`.
    pub lb_policy_override: Option<String>,
    /// Initial keepalive time for connections.  May only grow afterwards,
    /// through keepalive throttling.
    pub keepalive_time: Option<Duration>,
    /// An opaque retry filter to append to the dynamic filter stack.  Ignored
    /// when `minimal_stack` is set.
    pub retry_filter: Option<Arc<dyn CallFilter>>,
    /// Assemble the smallest possible per-call filter stack.
    pub minimal_stack: bool,
    /// Use a channel-private subchannel pool instead of the process-wide one.
    pub use_local_subchannel_pool: bool,
    /// The runtime for background work; defaults to Tokio.
    pub runtime: Option<Arc<dyn Runtime>>,
    /// Registries to consult instead of the process-wide ones.
    pub name_resolver_registry: Option<ResolverRegistry>,
    pub lb_policy_registry: Option<LbPolicyRegistry>,
    pub transport_registry: Option<crate::client::transport::TransportRegistry>,
}

/// A point-in-time description of a channel for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct ChannelInfo {
    pub lb_policy_name: String,
    pub service_config_json: String,
}

/// Severity of a channel trace event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug)]
pub(crate) struct TraceEvent {
    pub(crate) severity: TraceSeverity,
    pub(crate) message: String,
    pub(crate) at: Instant,
}

const CHANNEL_TRACE_CAPACITY: usize = 32;

/// A logical channel to a target.  Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<PersistentChannel>,
}

impl Channel {
    /// Constructs a new channel for the given target URI.
    ///
    /// Fails synchronously if the target cannot be parsed, no resolver is
    /// registered for its scheme, or the resolver rejects it.  The channel
    /// starts IDLE; no name resolution happens until the first RPC or an
    /// explicit connect request.
    pub fn new(target: &str, options: ChannelOptions) -> Result<Self, Status> {
        // The default policy must exist before any resolver update arrives.
        pick_first::reg();

        let target = Target::parse(target).map_err(Status::invalid_argument)?;
        let resolver_registry = options
            .name_resolver_registry
            .unwrap_or_else(|| GLOBAL_RESOLVER_REGISTRY.clone());
        let resolver_builder = resolver_registry.get(target.scheme()).ok_or_else(|| {
            Status::invalid_argument(format!(
                "no resolver registered for scheme {:?}",
                target.scheme()
            ))
        })?;
        if !resolver_builder.is_valid_uri(&target) {
            return Err(Status::invalid_argument(format!(
                "target {target} is not valid for its resolver"
            )));
        }
        let default_authority = options
            .override_authority
            .unwrap_or_else(|| resolver_builder.default_authority(&target));
        let subchannel_pool = if options.use_local_subchannel_pool {
            InternalSubchannelPool::new()
        } else {
            GLOBAL_SUBCHANNEL_POOL.clone()
        };
        let minimal_stack = options.minimal_stack;

        Ok(Self {
            inner: Arc::new(PersistentChannel {
                target,
                default_authority,
                default_service_config: options.default_service_config,
                lb_policy_override: options.lb_policy_override,
                initial_keepalive_time: options.keepalive_time,
                retry_filter: options.retry_filter.filter(|_| !minimal_stack),
                runtime: options.runtime.unwrap_or_else(default_runtime),
                resolver_builder,
                lb_registry: options
                    .lb_policy_registry
                    .unwrap_or_else(|| GLOBAL_LB_REGISTRY.clone()),
                transport_registry: options
                    .transport_registry
                    .unwrap_or_else(|| crate::client::transport::GLOBAL_TRANSPORT_REGISTRY.clone()),
                subchannel_pool,
                connectivity: ConnectivityStateTracker::new(ConnectivityState::Idle),
                info: parking_lot::Mutex::new(ChannelInfo::default()),
                lifecycle: parking_lot::Mutex::new(LifecycleState::Idle),
            }),
        })
    }

    /// Returns the current state of the channel.  If `try_to_connect` is set
    /// and the channel is IDLE, name resolution is started.
    pub fn state(&self, try_to_connect: bool) -> ConnectivityState {
        if try_to_connect {
            let _ = self.inner.ensure_active();
        }
        self.inner.connectivity.state()
    }

    /// Waits until the channel's state differs from `source` and returns the
    /// new state.
    pub async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState {
        let mut watcher = self.inner.connectivity.add_watcher(Some(source));
        match watcher.next().await {
            Some((state, _)) => state,
            None => self.inner.connectivity.state(),
        }
    }

    /// Registers a connectivity watcher.  If the current state differs from
    /// `initial`, it is delivered immediately.  Dropping the watcher cancels
    /// it.
    pub fn watch_state(&self, initial: Option<ConnectivityState>) -> StateWatcher {
        self.inner.connectivity.add_watcher(initial)
    }

    /// Moves an IDLE channel to CONNECTING, and asks an idle LB policy to
    /// exit its idle state.  Fails if the channel was shut down.
    pub fn connect_now(&self) -> Result<(), Status> {
        let active = self.inner.ensure_active()?;
        active.post(|controller| controller.exit_idle());
        Ok(())
    }

    /// Disconnect with IDLE intent: tears down the resolver and LB policy and
    /// returns the channel to IDLE.  In-flight calls re-enter the dispatch
    /// pipeline against the next activation; future calls reconnect.
    pub fn enter_idle(&self) {
        self.inner.disconnect(None);
    }

    /// Disconnect with SHUTDOWN intent, recording a default disconnect error.
    pub fn close(&self) {
        self.close_with(Status::unavailable("channel closed"));
    }

    /// Disconnect with SHUTDOWN intent: the error is recorded once and fails
    /// every queued and future call.  Subsequent disconnects of either intent
    /// are ignored; the channel never leaves SHUTDOWN.
    pub fn close_with(&self, error: Status) {
        self.inner.disconnect(Some(error));
    }

    /// Verifies the channel can route one RPC right now.  Legal only in
    /// READY: performs a single pick and succeeds iff the pick completes on a
    /// subchannel with a live connection.
    pub fn ping(&self) -> Result<(), Status> {
        if self.inner.connectivity.state() != ConnectivityState::Ready {
            return Err(Status::failed_precondition(format!(
                "ping requires a READY channel, state is {}",
                self.inner.connectivity.state()
            )));
        }
        let active = self.inner.ensure_active()?;
        let snapshot = active.picker.current();
        let Some(lb) = &snapshot.state else {
            return Err(Status::unavailable("no picker installed"));
        };
        match lb.picker.pick(&empty_request()) {
            PickResult::Pick(pick) => match pick.subchannel.connected_service() {
                Some(_) => Ok(()),
                None => Err(Status::unavailable("picked subchannel is not connected")),
            },
            PickResult::Queue => Err(Status::unavailable("pick queued")),
            PickResult::Fail(status) | PickResult::Drop(status) => Err(status),
        }
    }

    /// Resets the connection backoff of the channel's subchannels, so that
    /// the next connection attempts happen immediately.
    pub fn reset_connect_backoff(&self) {
        if let Some(active) = self.inner.active() {
            active.post(|controller| controller.reset_backoff());
        }
    }

    /// Returns the channel's diagnostic info: the name of the LB policy in
    /// use and the JSON of the service config in effect.
    pub fn channel_info(&self) -> ChannelInfo {
        self.inner.info.lock().clone()
    }

    /// The channel's target URI.
    pub fn target(&self) -> String {
        self.inner.target.to_string()
    }

    /// The channel's default authority.
    pub fn authority(&self) -> &str {
        &self.inner.default_authority
    }
}

#[async_trait]
impl Service for Channel {
    async fn call(&self, method: String, request: Request) -> Response {
        call::invoke(self.inner.clone(), method, request).await
    }
}

enum LifecycleState {
    Idle,
    Active(Arc<ActiveChannel>),
    Shutdown(Status),
}

/// The immutable identity and lifecycle root of a channel.  An
/// [`ActiveChannel`] exists while the channel is neither IDLE nor SHUTDOWN.
pub(crate) struct PersistentChannel {
    pub(crate) target: Target,
    pub(crate) default_authority: String,
    default_service_config: Option<ServiceConfig>,
    lb_policy_override: Option<String>,
    initial_keepalive_time: Option<Duration>,
    retry_filter: Option<Arc<dyn CallFilter>>,
    pub(crate) runtime: Arc<dyn Runtime>,
    resolver_builder: Arc<dyn name_resolution::ResolverBuilder>,
    lb_registry: LbPolicyRegistry,
    transport_registry: crate::client::transport::TransportRegistry,
    subchannel_pool: Arc<InternalSubchannelPool>,
    pub(crate) connectivity: Arc<ConnectivityStateTracker>,
    info: parking_lot::Mutex<ChannelInfo>,
    lifecycle: parking_lot::Mutex<LifecycleState>,
}

impl PersistentChannel {
    /// Returns the active channel, creating it (and with it the resolver and
    /// the serializer task) if the channel is IDLE.  Fails with the recorded
    /// disconnect error after shutdown.
    pub(crate) fn ensure_active(self: &Arc<Self>) -> Result<Arc<ActiveChannel>, Status> {
        let mut lifecycle = self.lifecycle.lock();
        match &*lifecycle {
            LifecycleState::Shutdown(error) => Err(error.clone()),
            LifecycleState::Active(active) => Ok(active.clone()),
            LifecycleState::Idle => {
                let active = ActiveChannel::start(self);
                *lifecycle = LifecycleState::Active(active.clone());
                Ok(active)
            }
        }
    }

    fn active(&self) -> Option<Arc<ActiveChannel>> {
        match &*self.lifecycle.lock() {
            LifecycleState::Active(active) => Some(active.clone()),
            _ => None,
        }
    }

    /// Processes a disconnect op.  `Some(error)` is SHUTDOWN intent, `None`
    /// is IDLE intent.
    fn disconnect(&self, error: Option<Status>) {
        let mut lifecycle = self.lifecycle.lock();
        match error {
            Some(error) => {
                if let LifecycleState::Shutdown(_) = &*lifecycle {
                    return;
                }
                let previous =
                    std::mem::replace(&mut *lifecycle, LifecycleState::Shutdown(error.clone()));
                drop(lifecycle);
                let posted = match &previous {
                    LifecycleState::Active(active) => {
                        let error = error.clone();
                        active.post(move |controller| controller.shutdown(error))
                    }
                    _ => false,
                };
                if !posted {
                    self.connectivity
                        .set_state(ConnectivityState::Shutdown, error, "shutdown");
                }
            }
            None => {
                let LifecycleState::Active(_) = &*lifecycle else {
                    return;
                };
                let LifecycleState::Active(active) =
                    std::mem::replace(&mut *lifecycle, LifecycleState::Idle)
                else {
                    unreachable!();
                };
                drop(lifecycle);
                // The teardown closure moves the tracker to IDLE so the
                // transition is ordered after any picker updates already in
                // the serializer queue.
                if !active.post(|controller| controller.tear_down()) {
                    self.connectivity.set_state(
                        ConnectivityState::Idle,
                        Status::new(tonic::Code::Ok, ""),
                        "entering idle mode",
                    );
                }
            }
        }
    }
}

impl Drop for PersistentChannel {
    fn drop(&mut self) {
        if let LifecycleState::Active(active) =
            std::mem::replace(self.lifecycle.get_mut(), LifecycleState::Idle)
        {
            active.serializer.abort();
        }
    }
}

/// The running half of a channel: the serializer work queue and the two
/// data-plane snapshots calls block on.
pub(crate) struct ActiveChannel {
    pub(crate) work_tx: WorkQueueTx,
    pub(crate) resolution: watch::Receiver<ResolutionState>,
    pub(crate) picker: Arc<PickerHolder>,
    serializer: Box<dyn TaskHandle>,
}

impl ActiveChannel {
    fn start(channel: &Arc<PersistentChannel>) -> Arc<ActiveChannel> {
        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkQueueItem>();
        let (resolution_tx, resolution_rx) = watch::channel(ResolutionState::Pending);
        let picker = Arc::new(PickerHolder::new());
        let terminal: Arc<dyn Service> = Arc::new(LbCallDispatcher::new(Arc::downgrade(channel)));

        let resolver = channel.resolver_builder.build(
            &channel.target,
            ResolverOptions::new(
                channel.default_authority.clone(),
                channel.runtime.clone(),
                Arc::new(SerializerWorkScheduler {
                    work_tx: work_tx.clone(),
                    kind: WorkKind::Resolver,
                }),
            ),
        );

        let mut controller = InternalChannelController::new(
            channel,
            work_tx.clone(),
            resolution_tx,
            picker.clone(),
            terminal,
            resolver,
        );

        // Leave IDLE before the serializer starts draining, so nothing the
        // resolver already scheduled can be reordered against this.
        channel.connectivity.set_state(
            ConnectivityState::Connecting,
            Status::new(tonic::Code::Ok, ""),
            "starting name resolution",
        );

        // The control-plane serializer: a single task draining closures.
        // FIFO per sender, globally non-overlapping.
        let serializer = channel.runtime.spawn(Box::pin(async move {
            while let Some(item) = work_rx.recv().await {
                match item {
                    WorkQueueItem::Closure(work) => work(&mut controller),
                }
                if controller.done {
                    break;
                }
            }
            debug!("channel serializer exiting");
        }));

        Arc::new(ActiveChannel {
            work_tx,
            resolution: resolution_rx,
            picker,
            serializer,
        })
    }

    /// Enqueues work onto the control-plane serializer.  Returns false if the
    /// serializer already exited.
    pub(crate) fn post(
        &self,
        work: impl FnOnce(&mut InternalChannelController) + Send + 'static,
    ) -> bool {
        self.work_tx
            .send(WorkQueueItem::Closure(Box::new(work)))
            .is_ok()
    }
}

pub(crate) type WorkQueueTx = mpsc::UnboundedSender<WorkQueueItem>;

pub(crate) enum WorkQueueItem {
    /// Run a closure against the channel controller on the serializer.
    Closure(Box<dyn FnOnce(&mut InternalChannelController) + Send + 'static>),
}

enum WorkKind {
    Resolver,
    LbPolicy,
}

// Posts `work` requests from resolvers and LB policies onto the serializer.
struct SerializerWorkScheduler {
    work_tx: WorkQueueTx,
    kind: WorkKind,
}

impl WorkScheduler for SerializerWorkScheduler {
    fn schedule_work(&self) {
        let item: Box<dyn FnOnce(&mut InternalChannelController) + Send> = match self.kind {
            WorkKind::Resolver => Box::new(|controller| controller.resolver_work()),
            WorkKind::LbPolicy => Box::new(|controller| controller.lb_work()),
        };
        let _ = self.work_tx.send(WorkQueueItem::Closure(item));
    }
}

/// The data-plane view of the channel's configuration, published atomically
/// and captured by each call at the instant its resolution commits.
pub(crate) struct ConfigBundle {
    pub(crate) service_config: ServiceConfig,
    pub(crate) config_selector: Arc<dyn ConfigSelector>,
    pub(crate) dynamic_filters: Arc<DynamicFilters>,
}

/// Where the channel stands with name resolution, as seen by new calls.
#[derive(Clone)]
pub(crate) enum ResolutionState {
    /// No usable resolution yet; calls queue.
    Pending,
    /// The resolver failed and no previous config is masking it.  Calls that
    /// are not wait-for-ready fail with this status; the rest stay queued.
    TransientFailure(Status),
    /// A usable configuration is published.
    Ready(Arc<ConfigBundle>),
    /// The channel is shut down; every call fails with this status.
    Shutdown(Status),
}

/// The picker snapshot plus the wakeup primitive for calls awaiting a pick.
///
/// Readers never hold a lock while invoking a picker: they load the snapshot,
/// pick, and if queued wait for the sequence number to move.  The
/// enable-then-recheck dance in `wait_for_change` makes picker replacement
/// linearizable with respect to queue insertion.
pub(crate) struct PickerHolder {
    snapshot: ArcSwap<PickerSnapshot>,
    changed: Notify,
}

pub(crate) struct PickerSnapshot {
    pub(crate) seq: u64,
    /// None before the first picker is installed and after teardown; treated
    /// as queue.
    pub(crate) state: Option<LbState>,
}

impl PickerHolder {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PickerSnapshot {
                seq: 0,
                state: None,
            }),
            changed: Notify::new(),
        }
    }

    pub(crate) fn current(&self) -> Arc<PickerSnapshot> {
        self.snapshot.load_full()
    }

    // Single writer: only the serializer (and the teardown closure it runs)
    // installs pickers.
    pub(crate) fn update(&self, state: Option<LbState>) {
        let seq = self.snapshot.load().seq + 1;
        self.snapshot.store(Arc::new(PickerSnapshot { seq, state }));
        self.changed.notify_waiters();
    }

    /// Returns once a snapshot with a sequence number other than `seen_seq`
    /// is installed, including installs that raced with this call.
    pub(crate) async fn wait_for_change(&self, seen_seq: u64) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.snapshot.load().seq != seen_seq {
                return;
            }
            notified.await;
        }
    }
}

struct LbPolicyHost {
    policy: Option<Box<dyn LbPolicy>>,
    builder_name: String,
}

/// The serializer-owned half of the channel.  Implements the controller
/// facades for both the resolver and the LB policy; every method runs on the
/// control-plane serializer.
pub(crate) struct InternalChannelController {
    channel: Weak<PersistentChannel>,
    target: Target,
    authority: String,
    work_tx: WorkQueueTx,
    runtime: Arc<dyn Runtime>,
    lb_registry: LbPolicyRegistry,
    transport_registry: crate::client::transport::TransportRegistry,
    subchannel_pool: Arc<InternalSubchannelPool>,
    connectivity: Arc<ConnectivityStateTracker>,
    default_service_config: Option<ServiceConfig>,
    lb_policy_override: Option<String>,
    retry_filter: Option<Arc<dyn CallFilter>>,

    resolver: Option<Box<dyn Resolver>>,
    lb: LbPolicyHost,
    saved_service_config: Option<ServiceConfig>,
    saved_config_selector: Option<Arc<dyn ConfigSelector>>,
    resolution_tx: watch::Sender<ResolutionState>,
    picker: Arc<PickerHolder>,
    terminal: Arc<dyn Service>,

    // Live subchannel wrappers, for keepalive fan-out.
    wrappers: Vec<Weak<ExternalSubchannel>>,
    // Presence count per internal subchannel, for removal trace events.
    subchannel_refs: BTreeMap<SubchannelKey, usize>,
    // Monotonically non-decreasing for the channel lifetime.
    keepalive_time: Option<Duration>,

    trace: VecDeque<TraceEvent>,
    pub(crate) done: bool,
}

impl InternalChannelController {
    fn new(
        channel: &Arc<PersistentChannel>,
        work_tx: WorkQueueTx,
        resolution_tx: watch::Sender<ResolutionState>,
        picker: Arc<PickerHolder>,
        terminal: Arc<dyn Service>,
        resolver: Box<dyn Resolver>,
    ) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            target: channel.target.clone(),
            authority: channel.default_authority.clone(),
            work_tx,
            runtime: channel.runtime.clone(),
            lb_registry: channel.lb_registry.clone(),
            transport_registry: channel.transport_registry.clone(),
            subchannel_pool: channel.subchannel_pool.clone(),
            connectivity: channel.connectivity.clone(),
            default_service_config: channel.default_service_config.clone(),
            lb_policy_override: channel.lb_policy_override.clone(),
            retry_filter: channel.retry_filter.clone(),
            resolver: Some(resolver),
            lb: LbPolicyHost {
                policy: None,
                builder_name: String::new(),
            },
            saved_service_config: None,
            saved_config_selector: None,
            resolution_tx,
            picker,
            terminal,
            wrappers: Vec::new(),
            subchannel_refs: BTreeMap::new(),
            keepalive_time: channel.initial_keepalive_time,
            trace: VecDeque::new(),
            done: false,
        }
    }

    // Runs the resolver's work method.  Take/put-back lets the resolver
    // borrow the controller mutably while it is borrowed from it.
    fn resolver_work(&mut self) {
        if let Some(mut resolver) = self.resolver.take() {
            resolver.work(self);
            if self.resolver.is_none() {
                self.resolver = Some(resolver);
            }
        }
    }

    fn lb_work(&mut self) {
        if let Some(mut policy) = self.lb.policy.take() {
            policy.work(self);
            if self.lb.policy.is_none() {
                self.lb.policy = Some(policy);
            }
        }
    }

    fn exit_idle(&mut self) {
        if let Some(mut policy) = self.lb.policy.take() {
            policy.exit_idle(self);
            if self.lb.policy.is_none() {
                self.lb.policy = Some(policy);
            }
        }
    }

    fn reset_backoff(&mut self) {
        if let Some(mut policy) = self.lb.policy.take() {
            policy.reset_backoff(self);
            if self.lb.policy.is_none() {
                self.lb.policy = Some(policy);
            }
        }
    }

    /// Applies one resolver result: choose a service config, choose and
    /// drive the LB policy, and publish the data-plane view if it changed.
    fn handle_resolver_update(&mut self, mut update: ResolverUpdate) -> Result<(), String> {
        if self.done || self.resolver.is_none() {
            // Shut down between dispatch and arrival.
            return Err("channel is shutting down".to_string());
        }

        // Choose the service config (or fall back, or fail).
        let incoming_selector = update.config_selector.take();
        let (config, selector) = match &update.service_config {
            Err(err) => {
                if self.saved_service_config.is_some() {
                    // Continue using the previous config.
                    self.record_trace_event(
                        TraceSeverity::Warning,
                        format!("ignoring invalid service config: {err}"),
                    );
                    (
                        self.saved_service_config.clone().unwrap(),
                        self.saved_config_selector.clone(),
                    )
                } else {
                    let err = err.clone();
                    self.on_resolver_error(Status::unavailable(err.clone()));
                    return Err(err);
                }
            }
            Ok(None) => (
                self.default_service_config.clone().unwrap_or_default(),
                incoming_selector,
            ),
            Ok(Some(config)) => (config.clone(), incoming_selector),
        };

        // A resolution error with nothing to mask it is a resolver failure.
        if update.endpoints.is_err() && self.lb.policy.is_none() {
            let err = update.endpoints.as_ref().err().unwrap().clone();
            self.on_resolver_error(Status::unavailable(err.clone()));
            return Err(err);
        }

        let (builder, lb_config) = self.choose_lb_policy(&config)?;

        let config_changed = self
            .saved_service_config
            .as_ref()
            .map(|saved| saved.raw_json() != config.raw_json())
            .unwrap_or(true);
        let selector_changed = !selectors_eq(
            self.saved_config_selector.as_ref(),
            selector.as_ref(),
        );

        // Publish the control-plane view before the LB policy sees the
        // update, so channel info matches what the policy is being told.
        if config_changed || selector_changed {
            self.saved_service_config = Some(config.clone());
            self.saved_config_selector = selector.clone();
            if let Some(channel) = self.channel.upgrade() {
                let mut info = channel.info.lock();
                info.lb_policy_name = builder.name().to_string();
                info.service_config_json = config.raw_json().to_string();
            }
            self.record_trace_event(TraceSeverity::Info, "service config changed".to_string());
        }

        self.create_or_swap_lb_policy(&builder);
        let mut policy = self.lb.policy.take().unwrap();
        let lb_result = policy.resolver_update(update, lb_config.as_ref(), self);
        if self.lb.policy.is_none() {
            self.lb.policy = Some(policy);
        }

        // Publish the data-plane view only after the LB policy knows about
        // the new destinations a selector may route to.
        if config_changed || selector_changed {
            let selector: Arc<dyn ConfigSelector> = selector.unwrap_or_else(|| {
                Arc::new(DefaultConfigSelector {
                    config: config.clone(),
                })
            });
            let dynamic_filters = DynamicFilters::new(
                selector.filters(),
                self.retry_filter.clone(),
                self.terminal.clone(),
            );
            let _ = self.resolution_tx.send(ResolutionState::Ready(Arc::new(ConfigBundle {
                service_config: config,
                config_selector: selector,
                dynamic_filters,
            })));
        }

        lb_result.map_err(|err| err.to_string())
    }

    // Resolver failure with no LB policy to mask it: enter TRANSIENT_FAILURE
    // and wake every resolver-queued call.
    fn on_resolver_error(&mut self, status: Status) {
        info!(%status, "resolver transient failure");
        self.connectivity.set_state(
            ConnectivityState::TransientFailure,
            status.clone(),
            "resolver failure",
        );
        let status = rewrite_illegal_status(status, "resolver", tonic::Code::Unavailable);
        let status = Status::new(
            status.code(),
            format!("Name resolution failure: {}", status.message()),
        );
        let _ = self
            .resolution_tx
            .send(ResolutionState::TransientFailure(status));
    }

    /// Chooses the LB policy for a resolver result: the first supported entry
    /// of the service config's candidate list, else the config's deprecated
    /// policy name, else the channel's configured override (falling back to
    /// `pick_first` if it does not validate), else `pick_first`.
    fn choose_lb_policy(
        &self,
        config: &ServiceConfig,
    ) -> Result<(Arc<dyn LbPolicyBuilder>, Option<LbConfig>), String> {
        for candidate in config.lb_candidates() {
            let Some(builder) = self.lb_registry.get_policy(&candidate.name) else {
                continue;
            };
            let parsed = ParsedJsonLbConfig::from_value(candidate.config.clone());
            return match builder.parse_config(&parsed) {
                Ok(lb_config) => Ok((builder, lb_config)),
                Err(err) => Err(format!(
                    "invalid config for LB policy {}: {err}",
                    candidate.name
                )),
            };
        }
        if !config.lb_candidates().is_empty() {
            return Err("no supported LB policy found in service config".to_string());
        }

        if let Some(name) = config.lb_policy_name() {
            return match self.lb_registry.get_policy(name) {
                Some(builder) => Ok((builder, None)),
                None => Err(format!("unknown LB policy {name:?} in service config")),
            };
        }

        if let Some(name) = &self.lb_policy_override {
            let empty = ParsedJsonLbConfig::from_value(serde_json::Value::Object(
                serde_json::Map::new(),
            ));
            match self.lb_registry.get_policy(name) {
                Some(builder) if builder.parse_config(&empty).is_ok() => {
                    return Ok((builder, None));
                }
                _ => warn!(
                    policy = name.as_str(),
                    "configured LB policy is unusable, falling back to pick_first"
                ),
            }
        }

        self.lb_registry
            .get_policy(pick_first::POLICY_NAME)
            .or_else(|| GLOBAL_LB_REGISTRY.get_policy(pick_first::POLICY_NAME))
            .map(|builder| (builder, None))
            .ok_or_else(|| "default pick_first policy is not registered".to_string())
    }

    // Creates the LB policy lazily on the first valid resolver result.  A
    // change of policy name drops the old policy and starts fresh.
    fn create_or_swap_lb_policy(&mut self, builder: &Arc<dyn LbPolicyBuilder>) {
        if self.lb.policy.is_some() && self.lb.builder_name == builder.name() {
            return;
        }
        if self.lb.policy.is_some() {
            self.record_trace_event(
                TraceSeverity::Info,
                format!(
                    "switching LB policy from {} to {}",
                    self.lb.builder_name,
                    builder.name()
                ),
            );
        } else {
            // Queue calls rather than failing them on the gap between policy
            // creation and its first picker update.
            self.connectivity.set_state(
                ConnectivityState::Connecting,
                Status::new(tonic::Code::Ok, ""),
                "created LB policy",
            );
            self.picker.update(Some(LbState::initial()));
        }
        self.lb.policy = Some(builder.build(LbPolicyOptions {
            work_scheduler: Arc::new(SerializerWorkScheduler {
                work_tx: self.work_tx.clone(),
                kind: WorkKind::LbPolicy,
            }),
            runtime: self.runtime.clone(),
        }));
        self.lb.builder_name = builder.name().to_string();
    }

    /// Applies a subchannel state change on the serializer: keepalive
    /// extraction and fan-out first, then status masking, then the LB policy.
    pub(crate) fn handle_subchannel_update(
        &mut self,
        wrapper: Arc<ExternalSubchannel>,
        state: &SubchannelState,
    ) {
        if self.done {
            return;
        }
        if let Some(throttle) = state.keepalive_throttle {
            if self.keepalive_time.is_none_or(|current| throttle > current) {
                self.keepalive_time = Some(throttle);
                debug!(?throttle, "throttling keepalive time for all subchannels");
                self.wrappers.retain(|w| w.upgrade().is_some());
                for weak in &self.wrappers {
                    if let Some(peer) = weak.upgrade() {
                        peer.throttle_keepalive_time(throttle);
                    }
                }
            }
        }

        // Propagate status only in TRANSIENT_FAILURE.  IDLE updates may exist
        // purely to carry a keepalive hint; the LB policy sees OK for them.
        let mut state = state.clone();
        state.keepalive_throttle = None;
        if state.connectivity_state != ConnectivityState::TransientFailure {
            state.last_connection_error = None;
        }

        let subchannel: Arc<dyn Subchannel> = wrapper;
        if let Some(mut policy) = self.lb.policy.take() {
            policy.subchannel_update(&subchannel, &state, self);
            if self.lb.policy.is_none() {
                self.lb.policy = Some(policy);
            }
        }
    }

    pub(crate) fn on_subchannel_wrapper_released(&mut self, key: &SubchannelKey) {
        self.wrappers.retain(|w| w.upgrade().is_some());
        match self.subchannel_refs.get_mut(key) {
            Some(count) => {
                assert!(*count > 0, "subchannel presence count underflow");
                *count -= 1;
                if *count == 0 {
                    self.subchannel_refs.remove(key);
                    self.record_trace_event(
                        TraceSeverity::Info,
                        format!("subchannel {key} removed"),
                    );
                }
            }
            None => warn!(subchannel = %key, "release of untracked subchannel"),
        }
    }

    /// Disconnect with IDLE intent: drop the resolver and LB policy and stop
    /// the serializer.  Blocked calls observe the teardown and re-enter the
    /// pipeline against the next activation.
    pub(crate) fn tear_down(&mut self) {
        debug!("tearing down active channel");
        self.resolver = None;
        self.lb.policy = None;
        self.lb.builder_name.clear();
        self.connectivity.set_state(
            ConnectivityState::Idle,
            Status::new(tonic::Code::Ok, ""),
            "entering idle mode",
        );
        self.picker.update(None);
        self.wrappers.clear();
        self.done = true;
    }

    /// Disconnect with SHUTDOWN intent: additionally publishes the disconnect
    /// error so every queued call (resolver- or LB-queued) fails with it, and
    /// pins the connectivity tracker to SHUTDOWN.
    pub(crate) fn shutdown(&mut self, error: Status) {
        debug!(%error, "shutting down channel");
        self.resolver = None;
        self.lb.policy = None;
        self.lb.builder_name.clear();
        self.connectivity
            .set_state(ConnectivityState::Shutdown, error.clone(), "shutdown");
        let _ = self
            .resolution_tx
            .send(ResolutionState::Shutdown(error.clone()));
        self.picker.update(Some(LbState {
            connectivity_state: ConnectivityState::Shutdown,
            picker: Arc::new(Failing {
                error: error.message().to_string(),
            }),
        }));
        self.wrappers.clear();
        self.done = true;
    }

    fn record_trace_event(&mut self, severity: TraceSeverity, message: String) {
        match severity {
            TraceSeverity::Info => info!(target: "channel_trace", "{message}"),
            TraceSeverity::Warning => warn!(target: "channel_trace", "{message}"),
            TraceSeverity::Error => tracing::error!(target: "channel_trace", "{message}"),
        }
        if self.trace.len() == CHANNEL_TRACE_CAPACITY {
            self.trace.pop_front();
        }
        self.trace.push_back(TraceEvent {
            severity,
            message,
            at: Instant::now(),
        });
    }

    pub(crate) fn trace_events(&self) -> &VecDeque<TraceEvent> {
        &self.trace
    }
}

impl name_resolution::ChannelController for InternalChannelController {
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::from_json(config)
    }

    fn update(&mut self, update: ResolverUpdate) -> Result<(), String> {
        self.handle_resolver_update(update)
    }
}

impl load_balancing::ChannelController for InternalChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        if self.done {
            return ExternalSubchannel::new(address.clone(), None, self.work_tx.clone());
        }
        let Some(transport) = self.transport_registry.get_transport(address.network_type)
        else {
            self.record_trace_event(
                TraceSeverity::Error,
                format!("no transport for network type {:?}", address.network_type),
            );
            return ExternalSubchannel::new(address.clone(), None, self.work_tx.clone());
        };

        let key = SubchannelKey::new(address.clone(), self.authority.clone());
        let isc = self
            .subchannel_pool
            .lookup_subchannel(&key)
            .unwrap_or_else(|| {
                let isc = InternalSubchannel::new(
                    key.clone(),
                    transport,
                    Arc::new(
                        ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone())
                            .expect("default backoff config must be valid"),
                    ),
                    self.runtime.clone(),
                    Arc::downgrade(&self.subchannel_pool),
                );
                self.subchannel_pool.register_subchannel(&key, isc)
            });
        // Subchannels inherit the channel's current keepalive time at
        // creation; throttle events update them later.
        if let Some(keepalive_time) = self.keepalive_time {
            isc.throttle_keepalive_time(keepalive_time);
        }

        let wrapper = ExternalSubchannel::new(address.clone(), Some(isc), self.work_tx.clone());
        wrapper.start_watching();
        *self.subchannel_refs.entry(key).or_insert(0) += 1;
        self.wrappers.push(Arc::downgrade(&wrapper));
        wrapper
    }

    fn update_picker(&mut self, update: LbState) {
        if self.done {
            return;
        }
        // State first, then the picker swap; queued calls are woken by the
        // swap and re-pick outside any lock.
        self.connectivity.set_state(
            update.connectivity_state,
            Status::new(tonic::Code::Ok, ""),
            "picker update",
        );
        self.picker.update(Some(update));
    }

    fn request_resolution(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.resolve_now();
        }
    }

    fn add_trace_event(&mut self, severity: TraceSeverity, message: String) {
        self.record_trace_event(severity, message);
    }

    fn target(&self) -> &Target {
        &self.target
    }

    fn authority(&self) -> &str {
        &self.authority
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use tokio::sync::{mpsc, oneshot};
    use tokio_stream::StreamExt;
    use tonic::{async_trait, Code, Status};

    use super::{Channel, ChannelOptions};
    use crate::client::load_balancing::WorkScheduler;
    use crate::client::name_resolution::{
        Address, ChannelController, Endpoint, Resolver, ResolverBuilder, ResolverOptions,
        ResolverRegistry, ResolverUpdate, Target,
    };
    use crate::client::transport::{
        ConnectedTransport, Transport, TransportError, TransportOptions,
        GLOBAL_TRANSPORT_REGISTRY,
    };
    use crate::client::{CallOptions, ConnectivityState};
    use crate::inmemory;
    use crate::rt::Runtime;
    use crate::service::{Message, Request, Response, Service};

    // A service that echoes every request message back.
    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        async fn call(&self, _method: String, request: Request) -> Response {
            let stream = request.into_inner().map(Ok);
            Response::new(Box::pin(stream))
        }
    }

    fn unary_request(message: &str) -> Request {
        let message: Box<dyn Message> = Box::new(message.to_string());
        Request::new(Box::pin(tokio_stream::once(message)))
    }

    fn request_with_options(message: &str, options: CallOptions) -> Request {
        let mut request = unary_request(message);
        request.extensions_mut().insert(options);
        request
    }

    async fn collect(response: Response) -> Result<Vec<String>, Status> {
        let mut stream = response.into_inner();
        let mut messages = Vec::new();
        while let Some(item) = stream.next().await {
            let message = item?;
            messages.push(message.as_any().downcast_ref::<String>().unwrap().clone());
        }
        Ok(messages)
    }

    async fn wait_for_state(channel: &Channel, want: ConnectivityState) {
        let mut watcher = channel.watch_state(None);
        while let Some((state, _)) = watcher.next().await {
            if state == want {
                return;
            }
        }
        panic!("channel destroyed while waiting for {want}");
    }

    // A resolver controlled by the test: it replays whatever update the test
    // last provided, every time the channel (re)builds or schedules it.
    #[derive(Default)]
    struct FakeResolverState {
        update: Mutex<Option<ResolverUpdate>>,
        scheduler: Mutex<Option<Arc<dyn WorkScheduler>>>,
        resolve_now_count: AtomicUsize,
    }

    impl FakeResolverState {
        fn send(&self, update: ResolverUpdate) {
            *self.update.lock().unwrap() = Some(update);
            if let Some(scheduler) = self.scheduler.lock().unwrap().as_ref() {
                scheduler.schedule_work();
            }
        }
    }

    struct FakeResolverBuilder {
        state: Arc<FakeResolverState>,
    }

    impl ResolverBuilder for FakeResolverBuilder {
        fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
            *self.state.scheduler.lock().unwrap() = Some(options.work_scheduler.clone());
            if self.state.update.lock().unwrap().is_some() {
                options.work_scheduler.schedule_work();
            }
            Box::new(FakeResolver {
                state: self.state.clone(),
            })
        }

        fn scheme(&self) -> &'static str {
            "fake"
        }
    }

    struct FakeResolver {
        state: Arc<FakeResolverState>,
    }

    impl Resolver for FakeResolver {
        fn work(&mut self, channel_controller: &mut dyn ChannelController) {
            if let Some(update) = self.state.update.lock().unwrap().clone() {
                let _ = channel_controller.update(update);
            }
        }

        fn resolve_now(&mut self) {
            self.state.resolve_now_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Builds a channel against the fake resolver, returning the control
    // handle for resolver updates.
    fn fake_resolver_channel(options: ChannelOptions) -> (Channel, Arc<FakeResolverState>) {
        let state = Arc::new(FakeResolverState::default());
        let registry = ResolverRegistry::new();
        registry
            .register(FakeResolverBuilder {
                state: state.clone(),
            })
            .unwrap();
        let channel = Channel::new(
            "fake:///testservice",
            ChannelOptions {
                name_resolver_registry: Some(registry),
                use_local_subchannel_pool: true,
                ..options
            },
        )
        .unwrap();
        (channel, state)
    }

    fn endpoints_for(addresses: &[(&'static str, &str)]) -> Vec<Endpoint> {
        addresses
            .iter()
            .map(|(network_type, address)| Endpoint {
                addresses: vec![Address {
                    network_type,
                    address: address.to_string().into(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_single_address() {
        inmemory::reg();
        let listener = inmemory::Listener::new(Arc::new(EchoService));
        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());
        assert_eq!(channel.state(false), ConnectivityState::Idle);

        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            ..Default::default()
        });

        let response = channel.call("/echo.Echo/Unary".to_string(), unary_request("hi")).await;
        assert_eq!(collect(response).await.unwrap(), vec!["hi".to_string()]);
        assert_eq!(channel.state(false), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn wait_for_ready_across_resolver_failure() {
        inmemory::reg();
        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());
        resolver.send(ResolverUpdate {
            endpoints: Err("DNS lookup failed".to_string()),
            ..Default::default()
        });

        // A wait-for-ready call queues across the failure.
        let queued = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let request = request_with_options(
                    "hello",
                    CallOptions {
                        wait_for_ready: Some(true),
                        ..Default::default()
                    },
                );
                collect(channel.call("/echo.Echo/Unary".to_string(), request).await).await
            })
        };

        // A plain call during the failure window fails with the resolver
        // error, rewritten to a name-resolution failure.
        wait_for_state(&channel, ConnectivityState::TransientFailure).await;
        let status = collect(
            channel
                .call("/echo.Echo/Unary".to_string(), unary_request("nope"))
                .await,
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(
            status.message().contains("Name resolution failure"),
            "unexpected message {:?}",
            status.message()
        );

        // Resolution recovers; the queued call completes.
        let listener = inmemory::Listener::new(Arc::new(EchoService));
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            ..Default::default()
        });
        assert_eq!(queued.await.unwrap().unwrap(), vec!["hello".to_string()]);
    }

    // A transport that blocks connection attempts until the test opens the
    // gate, then routes calls to the inner service.
    struct GatedTransport {
        service: Arc<dyn Service>,
        gate: tokio::sync::watch::Receiver<bool>,
        holds: Mutex<Vec<oneshot::Sender<Result<(), TransportError>>>>,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn connect(
            &self,
            _address: String,
            _runtime: Arc<dyn Runtime>,
            _opts: &TransportOptions,
        ) -> Result<ConnectedTransport, TransportError> {
            let mut gate = self.gate.clone();
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    return Err(TransportError::new("gate dropped"));
                }
            }
            let (tx, rx) = oneshot::channel();
            self.holds.lock().unwrap().push(tx);
            Ok(ConnectedTransport {
                service: self.service.clone(),
                disconnection_listener: rx,
            })
        }
    }

    #[tokio::test]
    async fn queued_picks_all_proceed_on_picker_update() {
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
        GLOBAL_TRANSPORT_REGISTRY.register(
            "gated-queue",
            GatedTransport {
                service: Arc::new(EchoService),
                gate: gate_rx,
                holds: Mutex::new(Vec::new()),
            },
        );

        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("gated-queue", "backend-1")])),
            ..Default::default()
        });

        // All calls reach the pick stage and queue while the transport is
        // still connecting.
        let mut calls = Vec::new();
        for i in 0..20 {
            let channel = channel.clone();
            calls.push(tokio::spawn(async move {
                let request = unary_request(&format!("message-{i}"));
                collect(channel.call("/echo.Echo/Unary".to_string(), request).await).await
            }));
        }
        wait_for_state(&channel, ConnectivityState::Connecting).await;

        gate_tx.send(true).unwrap();
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(
                call.await.unwrap().unwrap(),
                vec![format!("message-{i}")],
            );
        }
    }

    // A transport that fails every connection attempt, reporting a keepalive
    // throttle hint and the keepalive time it was given.
    struct ThrottlingTransport {
        throttle: Mutex<HashMap<String, Duration>>,
        seen: mpsc::UnboundedSender<(String, Option<Duration>)>,
    }

    #[async_trait]
    impl Transport for ThrottlingTransport {
        async fn connect(
            &self,
            address: String,
            _runtime: Arc<dyn Runtime>,
            opts: &TransportOptions,
        ) -> Result<ConnectedTransport, TransportError> {
            self.seen.send((address.clone(), opts.keepalive_time)).unwrap();
            Err(TransportError {
                message: format!("refusing {address}"),
                keepalive_throttle: self.throttle.lock().unwrap().get(&address).copied(),
            })
        }
    }

    #[tokio::test]
    async fn keepalive_throttle_propagates_to_peers() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        GLOBAL_TRANSPORT_REGISTRY.register(
            "throttling",
            ThrottlingTransport {
                throttle: Mutex::new(HashMap::from([
                    ("addr-1".to_string(), Duration::from_secs(30)),
                    ("addr-2".to_string(), Duration::from_secs(20)),
                ])),
                seen: seen_tx,
            },
        );

        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[
                ("throttling", "addr-1"),
                ("throttling", "addr-2"),
            ])),
            ..Default::default()
        });
        // Reach the pick stage so pick_first starts connecting.
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let request = request_with_options(
                    "x",
                    CallOptions {
                        wait_for_ready: Some(true),
                        ..Default::default()
                    },
                );
                collect(channel.call("/echo.Echo/Unary".to_string(), request).await).await
            })
        };

        // First attempt carries no keepalive and fails with a 30s hint.
        let (address, keepalive) = seen_rx.recv().await.unwrap();
        assert_eq!(address, "addr-1");
        assert_eq!(keepalive, None);

        // The hint propagates to the peer before its first attempt.  The
        // second peer's smaller hint (20s) must never lower it again.
        let (address, keepalive) = seen_rx.recv().await.unwrap();
        assert_eq!(address, "addr-2");
        assert_eq!(keepalive, Some(Duration::from_secs(30)));

        // Backoff retries keep the throttled value.
        let (_, keepalive) = seen_rx.recv().await.unwrap();
        assert_eq!(keepalive, Some(Duration::from_secs(30)));

        drop(pending);
        channel.close();
    }

    #[tokio::test]
    async fn service_config_change_swaps_data_plane() {
        inmemory::reg();
        let listener = inmemory::Listener::new(Arc::new(EchoService));
        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());

        let config_a = crate::client::service_config::ServiceConfig::from_json(
            r#"{"methodConfig": [{"name": [{}], "timeout": "30s"}]}"#,
        )
        .unwrap();
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            service_config: Ok(Some(config_a.clone())),
            ..Default::default()
        });

        let response = channel.call("/echo.Echo/Unary".to_string(), unary_request("one")).await;
        assert_eq!(collect(response).await.unwrap(), vec!["one".to_string()]);
        let info = channel.channel_info();
        assert_eq!(info.lb_policy_name, "pick_first");
        assert_eq!(info.service_config_json, config_a.raw_json());

        let config_b = crate::client::service_config::ServiceConfig::from_json(
            r#"{"methodConfig": [{"name": [{}], "timeout": "60s"}]}"#,
        )
        .unwrap();
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            service_config: Ok(Some(config_b.clone())),
            ..Default::default()
        });

        // Calls after the swap use the new config; the channel reports it.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if channel.channel_info().service_config_json == config_b.raw_json() {
                break;
            }
            assert!(Instant::now() < deadline, "config change never published");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let response = channel.call("/echo.Echo/Unary".to_string(), unary_request("two")).await;
        assert_eq!(collect(response).await.unwrap(), vec!["two".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_and_future_calls() {
        let (channel, _resolver) = fake_resolver_channel(ChannelOptions::default());

        // No resolver update: every call queues awaiting resolution.
        let mut queued = Vec::new();
        for _ in 0..10 {
            let channel = channel.clone();
            queued.push(tokio::spawn(async move {
                collect(channel.call("/echo.Echo/Unary".to_string(), unary_request("x")).await)
                    .await
            }));
        }
        wait_for_state(&channel, ConnectivityState::Connecting).await;

        let error = Status::unavailable("draining for maintenance");
        channel.close_with(error.clone());
        for call in queued {
            let status = call.await.unwrap().unwrap_err();
            assert_eq!(status.code(), error.code());
            assert_eq!(status.message(), error.message());
        }

        // Later calls fail with the recorded disconnect error, and the
        // second disconnect is ignored.
        channel.close_with(Status::unavailable("second close, ignored"));
        let status = collect(
            channel
                .call("/echo.Echo/Unary".to_string(), unary_request("y"))
                .await,
        )
        .await
        .unwrap_err();
        assert_eq!(status.message(), error.message());
        assert_eq!(channel.state(false), ConnectivityState::Shutdown);
        assert_eq!(channel.state(true), ConnectivityState::Shutdown);
    }

    #[tokio::test]
    async fn expired_deadline_fails_without_dispatch() {
        let (channel, _resolver) = fake_resolver_channel(ChannelOptions::default());
        let request = request_with_options(
            "late",
            CallOptions {
                deadline: Some(Instant::now() - Duration::from_secs(1)),
                ..Default::default()
            },
        );
        let status = collect(channel.call("/echo.Echo/Unary".to_string(), request).await)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        // The deadline fired before resolution even started.
        assert_eq!(channel.state(false), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn method_config_timeout_bounds_the_call() {
        inmemory::reg();
        // A service that never responds.
        struct BlackHole;
        #[async_trait]
        impl Service for BlackHole {
            async fn call(&self, _method: String, _request: Request) -> Response {
                std::future::pending().await
            }
        }
        let listener = inmemory::Listener::new(Arc::new(BlackHole));
        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());
        let config = crate::client::service_config::ServiceConfig::from_json(
            r#"{"methodConfig": [{"name": [{}], "timeout": "0.05s"}]}"#,
        )
        .unwrap();
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            service_config: Ok(Some(config)),
            ..Default::default()
        });

        let status = collect(
            channel
                .call("/echo.Echo/Unary".to_string(), unary_request("hi"))
                .await,
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn enter_idle_and_reconnect() {
        inmemory::reg();
        let listener = inmemory::Listener::new(Arc::new(EchoService));
        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());
        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            ..Default::default()
        });

        let response = channel.call("/echo.Echo/Unary".to_string(), unary_request("one")).await;
        assert_eq!(collect(response).await.unwrap(), vec!["one".to_string()]);

        channel.enter_idle();
        wait_for_state(&channel, ConnectivityState::Idle).await;

        // The next call reactivates the channel and completes.
        let response = channel.call("/echo.Echo/Unary".to_string(), unary_request("two")).await;
        assert_eq!(collect(response).await.unwrap(), vec!["two".to_string()]);
        assert_eq!(channel.state(false), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn ping_requires_ready() {
        inmemory::reg();
        let listener = inmemory::Listener::new(Arc::new(EchoService));
        let (channel, resolver) = fake_resolver_channel(ChannelOptions::default());

        let status = channel.ping().unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);

        resolver.send(ResolverUpdate {
            endpoints: Ok(endpoints_for(&[("inmemory", &listener.id())])),
            ..Default::default()
        });
        let response = channel.call("/echo.Echo/Unary".to_string(), unary_request("hi")).await;
        collect(response).await.unwrap();
        channel.ping().unwrap();
    }

    #[tokio::test]
    async fn channel_new_rejects_bad_targets() {
        assert!(Channel::new("not a uri", ChannelOptions::default()).is_err());
        assert!(Channel::new("unknownscheme:///x", ChannelOptions::default()).is_err());
    }
}
