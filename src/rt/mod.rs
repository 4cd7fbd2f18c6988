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

use std::{future::Future, pin::Pin, time::Duration};

mod tokio;

pub use self::tokio::default_runtime;

/// An abstraction over an asynchronous runtime.
///
/// All background work in the crate (the channel's control-plane serializer
/// task, subchannel connect attempts, backoff timers) is spawned through this
/// trait so that the runtime stays pluggable and testable.
pub trait Runtime: Send + Sync {
    /// Spawns the given task to run in the background.
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle>;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Future<Output = ()> {}

/// Handle to a spawned task, used to abort it when its owner goes away.
pub trait TaskHandle: Send + Sync {
    /// Aborts the associated task.
    fn abort(&self);
}
