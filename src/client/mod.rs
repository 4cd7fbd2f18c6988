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

use std::fmt::Display;
use std::time::Instant;

pub mod channel;
pub mod config_selector;
pub mod filters;
pub mod load_balancing;
pub mod name_resolution;
pub mod service_config;
pub mod transport;

pub(crate) mod backoff;
pub(crate) mod call;
pub(crate) mod connectivity_state;
pub(crate) mod registry;
pub(crate) mod subchannel;

pub use call::{is_dropped, DROP_MARKER_KEY};
pub use connectivity_state::StateWatcher;

/// A representation of the current state of a channel, also used for the
/// state of subchannels (individual connections within the channel).
///
/// A channel begins in the Idle state.  When an RPC is attempted, the channel
/// automatically transitions to Connecting.  If connections to a backend
/// service are available, the state becomes Ready.  Otherwise, if RPCs would
/// fail due to a lack of connections, the state becomes TransientFailure and
/// the channel continues to attempt to reconnect.
///
/// Shutdown is terminal: no transition out of it is ever made.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        ConnectivityState::Idle
    }
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Per-call options, carried in the request's extensions.
///
/// The service config's per-method parameters are layered on top of these:
/// a method-config timeout can only shorten the effective deadline, and a
/// method-config `wait_for_ready` applies only when the application did not
/// set the option explicitly.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// If true, queueable failures (resolver transient failure, a failing
    /// picker) keep the call queued instead of failing it.  Drops and
    /// terminal channel shutdown fail the call regardless.
    pub wait_for_ready: Option<bool>,
    /// Absolute deadline for the call.
    pub deadline: Option<Instant>,
    /// Overrides the channel's default authority for this call.
    pub authority: Option<String>,
}

impl CallOptions {
    pub(crate) fn wait_for_ready(&self) -> bool {
        self.wait_for_ready.unwrap_or(false)
    }
}
