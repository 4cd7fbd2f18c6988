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

//! Load balancing: the contracts between the channel and the policies that
//! manage its connections and pick a connection for each RPC.

pub mod pick_first;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{
    error::Error,
    fmt::Debug,
    fmt::Display,
    sync::{Arc, LazyLock},
    time::Duration,
};

use serde::de::DeserializeOwned;
use tonic::{metadata::MetadataMap, Status};
use tracing::debug;

use crate::client::{
    channel::TraceSeverity,
    name_resolution::{Address, ResolverUpdate, Target},
    registry::SharedRegistry,
    ConnectivityState,
};
use crate::rt::Runtime;
use crate::service::{Request, Service};

pub use crate::client::service_config::LbConfig;

/// The collection of LB policy builders a channel chooses from, indexed by
/// policy name.  Channels consult their own registry when given one, and
/// [`GLOBAL_LB_REGISTRY`] otherwise.
#[derive(Clone, Default)]
pub struct LbPolicyRegistry {
    builders: SharedRegistry<dyn LbPolicyBuilder>,
}

impl LbPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a policy builder under the name it reports.  Registering
    /// the same name again replaces the previous builder.
    pub fn register(&self, builder: impl LbPolicyBuilder + 'static) {
        let name = builder.name();
        if self.builders.insert(name, Arc::new(builder)).is_some() {
            debug!(policy = name, "replaced LB policy builder");
        }
    }

    /// Returns the builder registered under `name`, if any.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.get(name)
    }
}

/// The process-wide LB policy registry, used by channels that were not given
/// a local one.
pub static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> = LazyLock::new(LbPolicyRegistry::new);

/// A collection of data configured on the channel that is constructing this
/// LB policy.
#[non_exhaustive]
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LB policy to
    /// request a call into its `work` method.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    /// The runtime to use for background work.
    pub runtime: Arc<dyn Runtime>,
}

/// Used to asynchronously request a call into the LB policy's (or resolver's)
/// `work` method when an update needs to be produced without first receiving
/// an update from the channel.
pub trait WorkScheduler: Send + Sync {
    /// Schedules a call into the target's work method on the channel's
    /// control-plane serializer.  If a scheduled call has not started yet,
    /// another one may not be scheduled.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Build must not fail.  Any optional configuration is delivered via the
    /// LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal
    /// representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// subchannels) and producing Picker instances for picking connections for
/// RPCs.  All methods are called on the channel's control-plane serializer,
/// so implementations may assume single-threaded execution.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Asks the policy to leave its idle state and begin connecting.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Asks the policy to reset the connection backoff of its subchannels so
    /// the next connection attempt happens immediately.
    fn reset_backoff(&mut self, channel_controller: &mut dyn ChannelController);
}

/// The operations an LB policy may perform on the channel that owns it.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state for the given address.  If the
    /// channel is shutting down, the returned subchannel is inert: it never
    /// connects and delivers no state updates.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.
    /// Typically used when connections fail, indicating a possible change in
    /// the overall network configuration.
    fn request_resolution(&mut self);

    /// Appends an event to the channel's trace.
    fn add_trace_event(&mut self, severity: TraceSeverity, message: String);

    /// The channel's target URI.
    fn target(&self) -> &Target;

    /// The channel's default authority.
    fn authority(&self) -> &str;
}

/// Represents the current state of a subchannel as seen by an LB policy.
#[derive(Clone, Default)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See [`Subchannel`] for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    /// Set if connectivity_state is TransientFailure to describe the most
    /// recent connection error.  None for any other state.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    /// A keepalive-throttling hint extracted from the terminating connection.
    /// Consumed by the channel for keepalive propagation; LB policies may
    /// ignore it.
    pub keepalive_throttle: Option<Duration>,
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({})", self.connectivity_state, err),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// A Picker is responsible for deciding what subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns
/// Queue, the channel queues the RPC until a new Picker is produced by the
/// LbPolicy, and calls pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel
/// exposes to applications so they can predict what happens when performing
/// RPCs:
///
/// - Idle: the Picker should ensure connections are initiated by the
///   LbPolicy that produced it, and return Queue.
/// - Connecting: the Picker should return Queue and wait for pending
///   connections.
/// - Ready: the Picker should return a ready subchannel.
/// - TransientFailure: the Picker should return Fail with an error that
///   describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function must not block, and must not suspend: it is called
    /// synchronously from the calling task with no locks held.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with illegal codes converted to UNAVAILABLE).  If the RPC is
    /// wait-for-ready, it is not terminated, but instead attempted on a new
    /// picker if one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.  Illegal status codes
    /// are converted to INTERNAL.
    Drop(Status),
}

impl Display for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PickResult::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            PickResult::Queue => write!(f, "Queue"),
            PickResult::Fail(status) => write!(f, "Fail({status})"),
            PickResult::Drop(status) => write!(f, "Drop({status})"),
        }
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Called with the final status once the routed call completes.
    pub on_complete: Option<Box<dyn FnOnce(&Status) + Send + Sync>>,
    /// Metadata to be merged into the request's outgoing metadata.
    pub metadata: MetadataMap,
    /// Overrides the authority used for this request.
    pub authority_override: Option<String>,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self {
            subchannel,
            on_complete: None,
            metadata: MetadataMap::new(),
            authority_override: None,
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting with a picker
    /// that queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// A subchannel represents a method of communicating with a server which may
/// be connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
/// - IDLE transitions to CONNECTING when connect() is called.
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on
///   error.
/// - READY transitions to IDLE when the connection is lost.
/// - TRANSIENT_FAILURE transitions to IDLE when the reconnect backoff timer
///   expires.  The timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// When the last reference to a subchannel is dropped it is disconnected, and
/// no subsequent state updates are delivered for it to the LB policy.
/// Identity is by reference: compare subchannels with [`Arc::ptr_eq`].
pub trait Subchannel: Send + Sync + Display + Debug {
    /// The address this subchannel connects to.
    fn address(&self) -> Address;

    /// Begins connecting asynchronously.  No-op unless the subchannel is
    /// IDLE.
    fn connect(&self);

    /// Resets the subchannel's connection backoff so its next attempt happens
    /// immediately.
    fn reset_backoff(&self);

    /// Registers an opaque per-subchannel data subscription.
    fn add_data_watcher(&self, watcher: Arc<dyn DataWatcher>);

    /// Cancels a previously registered data subscription.  Idempotent.
    fn cancel_data_watcher(&self, watcher: &Arc<dyn DataWatcher>);

    /// Returns a handle to the connected transport, or None if the subchannel
    /// is not READY.  Holding the handle keeps the transport alive for the
    /// duration of one RPC.
    fn connected_service(&self) -> Option<Arc<dyn Service>>;
}

/// An opaque per-subchannel data subscription.  The channel only stores these
/// on behalf of LB policies; their semantics are defined by the subscriber.
pub trait DataWatcher: Send + Sync {}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that fails every pick with UNAVAILABLE and the given error text.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}

/// A JSON LB configuration, pre-parsed into a value tree but not yet
/// converted into any policy's internal representation.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    pub(crate) value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let value = serde_json::from_str(json).map_err(|err| err.to_string())?;
        Ok(Self { value })
    }

    /// Converts the wrapped value into the type used by the LB policy.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, Box<dyn Error + Send + Sync>> {
        serde_json::from_value(self.value.clone()).map_err(|err| err.to_string().into())
    }
}
