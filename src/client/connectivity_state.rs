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

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::debug;

use super::ConnectivityState;

/// The channel's ordered connectivity-state variable plus fan-out to
/// watchers.
///
/// Writes happen on the channel's control-plane serializer (and once, at
/// shutdown, from the lifecycle path); reads are thread-safe.  Each watcher
/// tracks the last state delivered to it and is only notified when the state
/// it would observe actually differs.
pub(crate) struct ConnectivityStateTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    state: ConnectivityState,
    // Status describing the state; non-OK only for TransientFailure and
    // Shutdown.
    status: Status,
    next_id: u64,
    watchers: HashMap<u64, WatcherEntry>,
}

struct WatcherEntry {
    last_delivered: Option<ConnectivityState>,
    tx: mpsc::UnboundedSender<(ConnectivityState, Status)>,
}

impl ConnectivityStateTracker {
    pub(crate) fn new(initial: ConnectivityState) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TrackerInner {
                state: initial,
                status: Status::new(tonic::Code::Ok, ""),
                next_id: 0,
                watchers: HashMap::new(),
            }),
        })
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    pub(crate) fn status(&self) -> Status {
        self.inner.lock().status.clone()
    }

    /// Moves the tracker to `state` and notifies every watcher whose last
    /// delivered state differs.  The Shutdown state is sticky; attempts to
    /// leave it are ignored.
    pub(crate) fn set_state(&self, state: ConnectivityState, status: Status, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectivityState::Shutdown && state != ConnectivityState::Shutdown {
            tracing::warn!(to = %state, "ignoring illegal transition out of Shutdown");
            return;
        }
        debug!(from = %inner.state, to = %state, reason, "connectivity state change");
        inner.state = state;
        inner.status = status.clone();
        inner.watchers.retain(|_, entry| {
            if entry.last_delivered == Some(state) {
                return true;
            }
            entry.last_delivered = Some(state);
            // A closed receiver means the watcher was dropped; forget it.
            entry.tx.send((state, status.clone())).is_ok()
        });
    }

    /// Registers a watcher.  If the current state differs from `initial`, the
    /// current state is delivered immediately; otherwise the watcher hears
    /// about the next change.
    pub(crate) fn add_watcher(
        self: &Arc<Self>,
        initial: Option<ConnectivityState>,
    ) -> StateWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let mut entry = WatcherEntry {
            last_delivered: initial,
            tx,
        };
        if initial != Some(inner.state) {
            entry.last_delivered = Some(inner.state);
            let _ = entry.tx.send((inner.state, inner.status.clone()));
        }
        inner.watchers.insert(id, entry);
        StateWatcher {
            id,
            rx,
            tracker: Arc::downgrade(self),
        }
    }

    fn remove_watcher(&self, id: u64) {
        // Idempotent: removing an already-removed watcher is a no-op.
        self.inner.lock().watchers.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

/// An application-facing subscription to a channel's connectivity state.
/// Dropping the watcher cancels it.
pub struct StateWatcher {
    id: u64,
    rx: mpsc::UnboundedReceiver<(ConnectivityState, Status)>,
    tracker: Weak<ConnectivityStateTracker>,
}

impl StateWatcher {
    /// Waits for the next state delivery.  Returns None if the channel was
    /// destroyed.
    pub async fn next(&mut self) -> Option<(ConnectivityState, Status)> {
        self.rx.recv().await
    }
}

impl Drop for StateWatcher {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove_watcher(self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use tonic::Status;

    use super::ConnectivityStateTracker;
    use crate::client::ConnectivityState;

    #[tokio::test]
    async fn watcher_sees_changes_once() {
        let tracker = ConnectivityStateTracker::new(ConnectivityState::Idle);
        let mut watcher = tracker.add_watcher(Some(ConnectivityState::Idle));

        tracker.set_state(ConnectivityState::Connecting, Status::new(tonic::Code::Ok, ""), "test");
        // Same-state update is not re-delivered.
        tracker.set_state(ConnectivityState::Connecting, Status::new(tonic::Code::Ok, ""), "test");
        tracker.set_state(ConnectivityState::Ready, Status::new(tonic::Code::Ok, ""), "test");

        assert_eq!(watcher.next().await.unwrap().0, ConnectivityState::Connecting);
        assert_eq!(watcher.next().await.unwrap().0, ConnectivityState::Ready);
        assert!(watcher.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_initial_state_is_delivered_immediately() {
        let tracker = ConnectivityStateTracker::new(ConnectivityState::Connecting);
        let mut watcher = tracker.add_watcher(Some(ConnectivityState::Idle));
        assert_eq!(watcher.next().await.unwrap().0, ConnectivityState::Connecting);
    }

    #[tokio::test]
    async fn shutdown_is_sticky() {
        let tracker = ConnectivityStateTracker::new(ConnectivityState::Ready);
        tracker.set_state(
            ConnectivityState::Shutdown,
            Status::unavailable("closed"),
            "test",
        );
        tracker.set_state(ConnectivityState::Ready, Status::new(tonic::Code::Ok, ""), "test");
        assert_eq!(tracker.state(), ConnectivityState::Shutdown);
        assert_eq!(tracker.status().message(), "closed");
    }

    #[tokio::test]
    async fn dropping_watcher_unregisters_it() {
        let tracker = ConnectivityStateTracker::new(ConnectivityState::Idle);
        let watcher = tracker.add_watcher(Some(ConnectivityState::Idle));
        assert_eq!(tracker.watcher_count(), 1);
        drop(watcher);
        assert_eq!(tracker.watcher_count(), 0);
        // Removal after the fact stays a no-op.
        tracker.remove_watcher(0);
    }
}
