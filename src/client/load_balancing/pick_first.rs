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

//! The default LB policy: connect to the resolved addresses one at a time,
//! in order, and route every RPC to the first one that becomes READY.

use std::{
    collections::HashSet,
    error::Error,
    sync::{Arc, Once},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::client::{
    load_balancing::{
        ChannelController, Failing, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
        ParsedJsonLbConfig, Pick, PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
        WorkScheduler, GLOBAL_LB_REGISTRY,
    },
    name_resolution::{Address, Endpoint, ResolverUpdate},
    ConnectivityState,
};
use crate::service::Request;

pub static POLICY_NAME: &str = "pick_first";

pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.register(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            addresses: vec![],
            subchannel_list: None,
            selected: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
            last_resolver_error: None,
            last_connection_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let config: PickFirstConfig = config
            .convert_to()
            .map_err(|err| format!("failed to parse pick_first config: {err}"))?;
        Ok(Some(LbConfig::new(config)))
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(super) struct PickFirstConfig {
    pub(super) shuffle_address_list: Option<bool>,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    // Most recent addresses from the name resolver.
    addresses: Vec<Address>,
    // Subchannels we are currently attempting, in order.
    subchannel_list: Option<SubchannelList>,
    // The currently connected subchannel, if any.
    selected: Option<Arc<dyn Subchannel>>,
    connectivity_state: ConnectivityState,
    // Whether the current CONNECTING state has been reported through a
    // picker update; the channel installs its own queueing picker before the
    // first one.
    sent_connecting_state: bool,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(mut endpoints) => {
                if should_shuffle(config)? {
                    shuffle_endpoints(&mut endpoints);
                }
                let addresses = flatten_addresses(&endpoints);
                if addresses.is_empty() {
                    self.handle_empty_endpoints(channel_controller);
                    return Err("received empty address list from the name resolver".into());
                }
                trace!(count = addresses.len(), "received addresses from resolver");
                // Unless idle, start attempting the new list right away; an
                // idle policy waits for exit_idle to do the same.
                if self.connectivity_state != ConnectivityState::Idle {
                    self.subchannel_list =
                        Some(SubchannelList::new(&addresses, channel_controller));
                }
                self.addresses = addresses;
            }
            Err(error) => {
                debug!(%error, "received error from resolver");
                self.last_resolver_error = Some(error);
                // Without a good previous update to fall back on (or when
                // already failing), surface the failure; otherwise continue
                // with the previous addresses.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }
            }
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        trace!(subchannel = %subchannel, state = %state, "subchannel update");

        if self
            .subchannel_list
            .as_ref()
            .is_some_and(|list| list.contains(subchannel))
        {
            if state.connectivity_state == ConnectivityState::Ready {
                self.move_to_ready(subchannel.clone(), channel_controller);
            } else {
                self.update_tracked_subchannel(subchannel, state, channel_controller);
            }
            return;
        }

        // Any state change of the selected subchannel means the connection is
        // gone: drop everything and go idle.
        if self
            .selected
            .as_ref()
            .is_some_and(|selected| Arc::ptr_eq(selected, subchannel))
        {
            self.move_to_idle(channel_controller);
            return;
        }

        // Updates for subchannels from an abandoned list are stale; ignore.
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Rebuild the subchannel list from the most recent addresses; this
        // starts connecting from the first one.
        if !self.addresses.is_empty() {
            self.connectivity_state = ConnectivityState::Connecting;
            self.subchannel_list = Some(SubchannelList::new(&self.addresses, channel_controller));
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Idle {
            self.work(channel_controller);
        }
    }

    fn reset_backoff(&mut self, _channel_controller: &mut dyn ChannelController) {
        if let Some(list) = &self.subchannel_list {
            for entry in &list.entries {
                entry.subchannel.reset_backoff();
            }
        }
        if let Some(selected) = &self.selected {
            selected.reset_backoff();
        }
    }
}

impl PickFirstPolicy {
    fn handle_empty_endpoints(&mut self, channel_controller: &mut dyn ChannelController) {
        self.subchannel_list = None;
        self.selected = None;
        self.addresses = vec![];
        self.last_resolver_error =
            Some("received empty address list from the name resolver".to_string());
        self.move_to_transient_failure(channel_controller);
    }

    fn update_tracked_subchannel(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let list = self.subchannel_list.as_mut().unwrap();
        let old_state = list.record_state(subchannel, state.clone());
        if !list.all_seen_initial_state() {
            return;
        }

        // The last subchannel just reported its initial state.
        if old_state.is_none() {
            if self.selected.is_some() {
                // The list replaced the selected subchannel's address set;
                // drop the connection and reconnect through exit_idle.
                self.move_to_idle(channel_controller);
            } else if !list.connect_to_next() {
                debug_assert!(false, "failed to initiate connection to first subchannel");
            }
            return;
        }

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // A subchannel returning to IDLE (its backoff expired, or its
                // connection closed) is reconnected immediately.
                subchannel.connect();
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state == ConnectivityState::Connecting
                    && self.sent_connecting_state
                {
                    return;
                }
                if self.connectivity_state != ConnectivityState::TransientFailure {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                // Try the next address; once the whole list has failed,
                // report the failure and let backoff drive further retries.
                if !self.subchannel_list.as_mut().unwrap().connect_to_next() {
                    self.move_to_transient_failure(channel_controller);
                }
            }
            other => {
                debug_assert!(false, "unexpected subchannel state {other}");
            }
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Idle;
        self.sent_connecting_state = false;
        self.subchannel_list = None;
        self.selected = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        self.sent_connecting_state = true;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
    }

    fn move_to_ready(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.connectivity_state = ConnectivityState::Ready;
        self.sent_connecting_state = false;
        self.selected = Some(subchannel.clone());
        self.subchannel_list = None;
        self.last_resolver_error = None;
        self.last_connection_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { subchannel }),
        });
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        self.sent_connecting_state = false;
        let error = format!(
            "last seen resolver error: {:?}, last seen connection error: {:?}",
            self.last_resolver_error, self.last_connection_error,
        );
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
    }
}

fn should_shuffle(config: Option<&LbConfig>) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let Some(config) = config else {
        return Ok(false);
    };
    let config: Arc<PickFirstConfig> = config
        .convert_to()
        .ok_or("pick_first received a foreign config")?;
    Ok(config.shuffle_address_list.unwrap_or(false))
}

fn shuffle_endpoints(endpoints: &mut [Endpoint]) {
    use rand::seq::SliceRandom;
    // Shuffling reorders endpoints only; the address order within each
    // endpoint is preserved.
    endpoints.shuffle(&mut rand::rng());
}

fn flatten_addresses(endpoints: &[Endpoint]) -> Vec<Address> {
    let mut addresses: Vec<Address> = endpoints
        .iter()
        .flat_map(|endpoint| endpoint.addresses.clone())
        .collect();
    let mut uniques = HashSet::new();
    addresses.retain(|address| uniques.insert(address.clone()));
    addresses
}

struct SubchannelEntry {
    subchannel: Arc<dyn Subchannel>,
    state: Option<SubchannelState>,
}

// The subchannels created from the most recent address list, with the state
// of the in-order connection sweep across them.
struct SubchannelList {
    entries: Vec<SubchannelEntry>,
    next_to_connect: usize,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let entries = addresses
            .iter()
            .map(|address| SubchannelEntry {
                subchannel: channel_controller.new_subchannel(address),
                state: None,
            })
            .collect::<Vec<_>>();
        debug!(subchannels = entries.len(), "created new subchannel list");
        Self {
            entries,
            next_to_connect: 0,
        }
    }

    fn contains(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        self.position(subchannel).is_some()
    }

    fn position(&self, subchannel: &Arc<dyn Subchannel>) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.subchannel, subchannel))
    }

    // Records the new state, returning the previous one.
    fn record_state(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: SubchannelState,
    ) -> Option<SubchannelState> {
        let idx = self.position(subchannel).unwrap();
        self.entries[idx].state.replace(state)
    }

    fn all_seen_initial_state(&self) -> bool {
        self.entries.iter().all(|entry| entry.state.is_some())
    }

    // Starts a connection attempt on the next untried subchannel.  Returns
    // false when the list is exhausted.
    fn connect_to_next(&mut self) -> bool {
        let Some(entry) = self.entries.get(self.next_to_connect) else {
            return false;
        };
        entry.subchannel.connect();
        self.next_to_connect += 1;
        true
    }
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    subchannel: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}

// A picker that queues all picks and asks for work, which triggers the
// policy to rebuild its subchannel list and start connecting.
struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _request: &Request) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::client::{
        load_balancing::{
            pick_first::{self, PickFirstConfig},
            test_utils::{self, TestChannelController, TestEvent, TestWorkScheduler},
            LbPolicy, LbState, ParsedJsonLbConfig, PickResult, Subchannel, SubchannelState,
            GLOBAL_LB_REGISTRY,
        },
        name_resolution::{Address, Endpoint, ResolverUpdate},
        ConnectivityState,
    };

    #[test]
    fn builder_is_registered() {
        pick_first::reg();
        let builder = GLOBAL_LB_REGISTRY
            .get_policy("pick_first")
            .expect("pick_first LB policy not registered");
        assert_eq!(builder.name(), "pick_first");
    }

    #[test]
    fn parse_config() {
        pick_first::reg();
        let builder = GLOBAL_LB_REGISTRY.get_policy("pick_first").unwrap();

        for (json, want) in [
            (json!({}), None),
            (json!({"shuffleAddressList": true}), Some(true)),
            (json!({"shuffleAddressList": false}), Some(false)),
            (json!({"shuffleAddressList": true, "unknown": 1}), Some(true)),
        ] {
            let config = builder
                .parse_config(&ParsedJsonLbConfig::from_value(json))
                .unwrap()
                .unwrap();
            let config: Arc<PickFirstConfig> = config.convert_to().unwrap();
            assert_eq!(config.shuffle_address_list, want);
        }

        assert!(builder
            .parse_config(&ParsedJsonLbConfig::from_value(
                json!({"shuffleAddressList": "yes"})
            ))
            .is_err());
    }

    struct Fixture {
        rx_events: mpsc::UnboundedReceiver<TestEvent>,
        policy: Box<dyn LbPolicy>,
        controller: TestChannelController,
    }

    fn setup() -> Fixture {
        pick_first::reg();
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let controller = TestChannelController::new(tx_events.clone());
        let builder = GLOBAL_LB_REGISTRY.get_policy("pick_first").unwrap();
        let policy = builder.build(crate::client::load_balancing::LbPolicyOptions {
            work_scheduler: Arc::new(TestWorkScheduler { tx_events }),
            runtime: crate::rt::default_runtime(),
        });
        Fixture {
            rx_events,
            policy,
            controller,
        }
    }

    fn endpoints(addresses: &[&str]) -> Vec<Endpoint> {
        addresses
            .iter()
            .map(|address| Endpoint {
                addresses: vec![Address {
                    address: address.to_string().into(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect()
    }

    fn send_resolver_update(fixture: &mut Fixture, endpoints: Vec<Endpoint>) {
        let update = ResolverUpdate {
            endpoints: Ok(endpoints),
            ..Default::default()
        };
        fixture
            .policy
            .resolver_update(update, None, &mut fixture.controller)
            .unwrap();
    }

    async fn expect_subchannels(fixture: &mut Fixture, count: usize) -> Vec<Arc<dyn Subchannel>> {
        let mut subchannels = Vec::new();
        for _ in 0..count {
            match fixture.rx_events.recv().await.unwrap() {
                TestEvent::NewSubchannel(_, subchannel) => subchannels.push(subchannel),
                other => panic!("unexpected event {other}"),
            }
        }
        subchannels
    }

    fn deliver_state(fixture: &mut Fixture, subchannel: &Arc<dyn Subchannel>, state: ConnectivityState) {
        fixture.policy.subchannel_update(
            subchannel,
            &SubchannelState {
                connectivity_state: state,
                ..Default::default()
            },
            &mut fixture.controller,
        );
    }

    fn deliver_initial_states(fixture: &mut Fixture, subchannels: &[Arc<dyn Subchannel>]) {
        for subchannel in subchannels {
            deliver_state(fixture, subchannel, ConnectivityState::Idle);
        }
    }

    async fn expect_connect(fixture: &mut Fixture, address: &str) {
        match fixture.rx_events.recv().await.unwrap() {
            TestEvent::Connect(addr) => assert_eq!(addr.address.as_str(), address),
            other => panic!("unexpected event {other}"),
        }
    }

    async fn expect_picker(fixture: &mut Fixture, state: ConnectivityState) -> LbState {
        loop {
            match fixture.rx_events.recv().await.unwrap() {
                TestEvent::UpdatePicker(update) => {
                    assert_eq!(update.connectivity_state, state);
                    return update;
                }
                TestEvent::RequestResolution => continue,
                other => panic!("unexpected event {other}"),
            }
        }
    }

    #[tokio::test]
    async fn connects_to_addresses_in_order() {
        let mut fixture = setup();
        send_resolver_update(&mut fixture, endpoints(&["1.1.1.1:1", "2.2.2.2:2"]));
        let subchannels = expect_subchannels(&mut fixture, 2).await;
        deliver_initial_states(&mut fixture, &subchannels);
        expect_connect(&mut fixture, "1.1.1.1:1").await;

        // First address fails; the policy moves on to the second.
        deliver_state(&mut fixture, &subchannels[0], ConnectivityState::Connecting);
        expect_picker(&mut fixture, ConnectivityState::Connecting).await;
        deliver_state(
            &mut fixture,
            &subchannels[0],
            ConnectivityState::TransientFailure,
        );
        expect_connect(&mut fixture, "2.2.2.2:2").await;

        // Second address connects; the picker returns it.
        deliver_state(&mut fixture, &subchannels[1], ConnectivityState::Ready);
        let lb_state = expect_picker(&mut fixture, ConnectivityState::Ready).await;
        match lb_state.picker.pick(&test_utils::new_request()) {
            PickResult::Pick(pick) => {
                assert!(Arc::ptr_eq(&pick.subchannel, &subchannels[1]));
            }
            other => panic!("unexpected pick result {other}"),
        }
    }

    #[tokio::test]
    async fn whole_list_failing_reports_transient_failure() {
        let mut fixture = setup();
        send_resolver_update(&mut fixture, endpoints(&["1.1.1.1:1"]));
        let subchannels = expect_subchannels(&mut fixture, 1).await;
        deliver_initial_states(&mut fixture, &subchannels);
        expect_connect(&mut fixture, "1.1.1.1:1").await;

        deliver_state(
            &mut fixture,
            &subchannels[0],
            ConnectivityState::TransientFailure,
        );
        let lb_state = expect_picker(&mut fixture, ConnectivityState::TransientFailure).await;
        match lb_state.picker.pick(&test_utils::new_request()) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
            }
            other => panic!("unexpected pick result {other}"),
        }
    }

    #[tokio::test]
    async fn selected_subchannel_loss_goes_idle() {
        let mut fixture = setup();
        send_resolver_update(&mut fixture, endpoints(&["1.1.1.1:1"]));
        let subchannels = expect_subchannels(&mut fixture, 1).await;
        deliver_initial_states(&mut fixture, &subchannels);
        expect_connect(&mut fixture, "1.1.1.1:1").await;
        deliver_state(&mut fixture, &subchannels[0], ConnectivityState::Ready);
        expect_picker(&mut fixture, ConnectivityState::Ready).await;

        // The connection drops.  The policy goes idle; picking schedules
        // work, which rebuilds the list and reconnects.
        deliver_state(&mut fixture, &subchannels[0], ConnectivityState::Idle);
        let lb_state = expect_picker(&mut fixture, ConnectivityState::Idle).await;
        match lb_state.picker.pick(&test_utils::new_request()) {
            PickResult::Queue => {}
            other => panic!("unexpected pick result {other}"),
        }
        match fixture.rx_events.recv().await.unwrap() {
            TestEvent::RequestResolution => {}
            other => panic!("unexpected event {other}"),
        }
        match fixture.rx_events.recv().await.unwrap() {
            TestEvent::ScheduleWork => {}
            other => panic!("unexpected event {other}"),
        }
        fixture.policy.work(&mut fixture.controller);
        expect_subchannels(&mut fixture, 1).await;
    }

    #[tokio::test]
    async fn empty_address_list_is_an_error() {
        let mut fixture = setup();
        let update = ResolverUpdate {
            endpoints: Ok(vec![]),
            ..Default::default()
        };
        let result = fixture
            .policy
            .resolver_update(update, None, &mut fixture.controller);
        assert!(result.is_err());
        expect_picker(&mut fixture, ConnectivityState::TransientFailure).await;
    }

    #[tokio::test]
    async fn resolver_error_before_any_addresses_fails_picks() {
        let mut fixture = setup();
        let update = ResolverUpdate {
            endpoints: Err("dns exploded".to_string()),
            ..Default::default()
        };
        fixture
            .policy
            .resolver_update(update, None, &mut fixture.controller)
            .unwrap();
        let lb_state = expect_picker(&mut fixture, ConnectivityState::TransientFailure).await;
        match lb_state.picker.pick(&test_utils::new_request()) {
            PickResult::Fail(status) => assert!(status.message().contains("dns exploded")),
            other => panic!("unexpected pick result {other}"),
        }
    }

    #[tokio::test]
    async fn resolver_error_after_connection_is_masked() {
        let mut fixture = setup();
        send_resolver_update(&mut fixture, endpoints(&["1.1.1.1:1"]));
        let subchannels = expect_subchannels(&mut fixture, 1).await;
        deliver_initial_states(&mut fixture, &subchannels);
        expect_connect(&mut fixture, "1.1.1.1:1").await;
        deliver_state(&mut fixture, &subchannels[0], ConnectivityState::Ready);
        expect_picker(&mut fixture, ConnectivityState::Ready).await;

        let update = ResolverUpdate {
            endpoints: Err("dns exploded".to_string()),
            ..Default::default()
        };
        fixture
            .policy
            .resolver_update(update, None, &mut fixture.controller)
            .unwrap();
        // The previous good update keeps serving; no picker change.
        assert!(fixture.rx_events.try_recv().is_err());
    }
}
