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

//! Fakes for exercising LB policies without a real channel: an event-channel
//! backed controller, work scheduler, and subchannel.

use std::fmt::{Debug, Display};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::client::channel::TraceSeverity;
use crate::client::load_balancing::{
    ChannelController, DataWatcher, LbState, Subchannel, WorkScheduler,
};
use crate::client::name_resolution::{Address, Target};
use crate::service::{Request, Service};

pub(crate) fn new_request() -> Request {
    crate::service::empty_request()
}

pub(crate) enum TestEvent {
    NewSubchannel(Address, Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(addr, _) => write!(f, "NewSubchannel({addr})"),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

impl Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A test subchannel that forwards connect calls to an event channel, so
/// tests can verify when a policy asks a subchannel to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
    connected: Mutex<Option<Arc<dyn Service>>>,
}

impl TestSubchannel {
    pub(crate) fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            address,
            tx_events,
            connected: Mutex::new(None),
        }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        self.tx_events
            .send(TestEvent::Connect(self.address.clone()))
            .unwrap();
    }

    fn reset_backoff(&self) {}

    fn add_data_watcher(&self, _watcher: Arc<dyn DataWatcher>) {}

    fn cancel_data_watcher(&self, _watcher: &Arc<dyn DataWatcher>) {}

    fn connected_service(&self) -> Option<Arc<dyn Service>> {
        self.connected.lock().unwrap().clone()
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Debug for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// A test channel controller that reports everything a policy does on an
/// event channel.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
    pub(crate) target: Target,
    pub(crate) authority: String,
}

impl TestChannelController {
    pub(crate) fn new(tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx_events,
            target: Target::parse("test:///service").unwrap(),
            authority: "service".to_string(),
        }
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> = Arc::new(TestSubchannel::new(
            address.clone(),
            self.tx_events.clone(),
        ));
        self.tx_events
            .send(TestEvent::NewSubchannel(address.clone(), subchannel.clone()))
            .unwrap();
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events.send(TestEvent::UpdatePicker(update)).unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }

    fn add_trace_event(&mut self, _severity: TraceSeverity, _message: String) {}

    fn target(&self) -> &Target {
        &self.target
    }

    fn authority(&self) -> &str {
        &self.authority
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        self.tx_events.send(TestEvent::ScheduleWork).unwrap();
    }
}
