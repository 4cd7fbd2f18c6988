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

//! Name resolution: turning a channel's target URI into network addresses
//! (and, optionally, a service config) the channel can use to connect.

use core::fmt;

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    hash::Hash,
    str::FromStr,
    sync::{Arc, LazyLock},
};

use tracing::debug;
use url::Url;

use crate::attributes::Attributes;
use crate::byte_str::ByteStr;
use crate::client::config_selector::ConfigSelector;
use crate::client::load_balancing::WorkScheduler;
use crate::client::registry::SharedRegistry;
use crate::client::service_config::ServiceConfig;
use crate::rt::Runtime;

/// The collection of name resolvers a channel chooses from, indexed by the
/// URI scheme each one handles.  Channels consult their own registry when
/// given one, and [`GLOBAL_RESOLVER_REGISTRY`] otherwise.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    builders: SharedRegistry<dyn ResolverBuilder>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver under the scheme it reports.  The scheme must be
    /// lowercase URI-scheme syntax; registering the same scheme again
    /// replaces the previous builder.
    pub fn register(&self, builder: impl ResolverBuilder + 'static) -> Result<(), String> {
        let scheme = builder.scheme();
        if !is_valid_scheme(scheme) {
            return Err(format!(
                "cannot register resolver: {scheme:?} is not a lowercase URI scheme"
            ));
        }
        if self.builders.insert(scheme, Arc::new(builder)).is_some() {
            debug!(scheme, "replaced resolver builder");
        }
        Ok(())
    }

    /// Returns the builder for `scheme`, matching case-insensitively, or
    /// None if no resolver handles it.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        if scheme.chars().any(|c| c.is_ascii_uppercase()) {
            return self.builders.get(&scheme.to_ascii_lowercase());
        }
        self.builders.get(scheme)
    }
}

// URI scheme syntax, restricted to lowercase: ALPHA *( ALPHA / DIGIT / "+" /
// "-" / "." ).
fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
}

/// The process-wide resolver registry, used by channels that were not given
/// a local one.
pub static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> =
    LazyLock::new(ResolverRegistry::new);

/// A target URI for a channel.  The scheme selects the resolver; the
/// authority portion (if any) addresses the resolver itself; the path names
/// the endpoint to resolve.
#[derive(Clone, Debug)]
pub struct Target {
    uri: Url,
}

impl Target {
    pub fn parse(s: &str) -> Result<Self, String> {
        let uri = Url::from_str(s).map_err(|err| format!("invalid target {s}: {err}"))?;
        Ok(Self { uri })
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// The authority host and port of the target URI in `host[:port]` form,
    /// or an empty string if the URI has no authority.
    pub fn authority_host_port(&self) -> String {
        let host = self.uri.host_str().unwrap_or_default();
        match self.uri.port() {
            Some(port) if !host.is_empty() => format!("{host}:{port}"),
            _ => host.to_string(),
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// A name resolver factory, registered with a [`ResolverRegistry`] under the
/// URI scheme it handles.
pub trait ResolverBuilder: Send + Sync {
    /// Builds and returns a new name resolver instance.
    ///
    /// Build must not fail.  A resolver for an unusable target should instead
    /// report an error through the channel controller on its first `work`
    /// call; see [`NopResolver`].
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &'static str;

    /// Returns the default authority for a channel using this resolver and
    /// target, typically the path portion of the target URI with the leading
    /// slash removed.
    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        path.strip_prefix("/").unwrap_or(path).to_string()
    }

    /// Reports whether the target is valid for this resolver.  Checked
    /// synchronously at channel creation.
    fn is_valid_uri(&self, _target: &Target) -> bool {
        true
    }
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority in effect for the channel, either derived from the
    /// target by `default_authority` or overridden in the channel options.
    pub authority: String,
    /// The runtime to use for background work.
    pub runtime: Arc<dyn Runtime>,
    /// Requests a call into the resolver's `work` method on the channel's
    /// control-plane serializer.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

impl ResolverOptions {
    pub(crate) fn new(
        authority: String,
        runtime: Arc<dyn Runtime>,
        work_scheduler: Arc<dyn WorkScheduler>,
    ) -> Self {
        Self {
            authority,
            runtime,
            work_scheduler,
        }
    }
}

/// A name resolver instance.
///
/// Resolvers are driven by the channel: after the resolver's work scheduler
/// is triggered, the channel calls `work` on its control-plane serializer.
/// Dropping the resolver is the shutdown signal; any background tasks must
/// stop when that happens.
pub trait Resolver: Send {
    /// Called on the channel's control-plane serializer after the resolver
    /// scheduled work.  The resolver reports its current state through the
    /// controller.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Asks the resolver to re-resolve as soon as possible.  Typically called
    /// when connections fail, indicating a possible change in the overall
    /// network configuration.  May be a no-op.
    fn resolve_now(&mut self);
}

/// The operations a resolver may perform on the channel that constructed it.
pub trait ChannelController: Send {
    /// Parses the provided JSON service config into the form consumed by the
    /// channel.
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String>;

    /// Delivers the resolver's current state to the channel.  An `Err` return
    /// tells the resolver the update was not usable (for example, the LB
    /// policy rejected it); the resolver should back off before re-resolving.
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String>;
}

/// A name resolver update expresses the current state of the resolver.
#[derive(Clone)]
pub struct ResolverUpdate {
    /// The endpoints found for the target, or an error if resolution failed.
    pub endpoints: Result<Vec<Endpoint>, String>,
    /// The service config for the target: `Ok(None)` if the resolver does not
    /// provide one, `Err` if one was provided but unusable.
    pub service_config: Result<Option<ServiceConfig>, String>,
    /// Human-readable note describing how this result was obtained, carried
    /// into LB policy updates for diagnostics.
    pub resolution_note: Option<String>,
    /// Optional data which may be used by the LB policy or channel.
    pub attributes: Attributes,
    /// A config selector to route calls under this resolution.  If absent,
    /// the channel derives one from the service config.
    pub config_selector: Option<Arc<dyn ConfigSelector>>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        Self {
            endpoints: Ok(Vec::new()),
            service_config: Ok(None),
            resolution_note: None,
            attributes: Attributes::new(),
            config_selector: None,
        }
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// the server can be reached.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct Endpoint {
    /// The list of addresses used to connect to the server.
    pub addresses: Vec<Address>,
    /// Optional data which may be used by the LB policy or channel.
    pub attributes: Attributes,
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addresses == other.addresses
    }
}

impl Eq for Endpoint {}

/// An Address is an identifier that indicates how to connect to a server.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Address {
    /// Identifies what kind of transport to create when connecting to this
    /// address.  Typically [`TCP_IP_NETWORK_TYPE`].
    pub network_type: &'static str,
    /// The address itself, passed to the transport to create a connection.
    pub address: ByteStr,
    /// Optional data which the transport may use for the connection.
    pub attributes: Attributes,
}

impl Default for Address {
    fn default() -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE,
            address: ByteStr::default(),
            attributes: Attributes::new(),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.network_type, &self.address).cmp(&(other.network_type, &other.address))
    }
}

impl Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected
/// to via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// A resolver that delivers one pre-computed update and then goes quiet.
/// Used for targets that require no asynchronous work, and to surface build
/// failures through the regular update path.
pub struct NopResolver {
    pub update: Option<ResolverUpdate>,
}

impl NopResolver {
    pub fn for_error(err: String, options: &ResolverOptions) -> Box<dyn Resolver> {
        options.work_scheduler.schedule_work();
        Box::new(NopResolver {
            update: Some(ResolverUpdate {
                endpoints: Err(err),
                ..Default::default()
            }),
        })
    }
}

impl Resolver for NopResolver {
    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(update) = self.update.take() {
            let _ = channel_controller.update(update);
        }
    }

    fn resolve_now(&mut self) {}
}
