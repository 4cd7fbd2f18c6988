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

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use super::{Runtime, Sleep, TaskHandle};

/// A [`Runtime`] backed by the ambient Tokio runtime.  Spawning outside a
/// Tokio runtime context panics, exactly as `tokio::spawn` does.
#[derive(Default)]
pub(crate) struct TokioRuntime;

struct TokioTaskHandle {
    handle: ::tokio::task::AbortHandle,
}

impl TaskHandle for TokioTaskHandle {
    fn abort(&self) {
        self.handle.abort();
    }
}

struct TokioSleep {
    inner: Pin<Box<::tokio::time::Sleep>>,
}

impl Future for TokioSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl Sleep for TokioSleep {}

impl Runtime for TokioRuntime {
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle> {
        let join = ::tokio::spawn(task);
        Box::new(TokioTaskHandle {
            handle: join.abort_handle(),
        })
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(TokioSleep {
            inner: Box::pin(::tokio::time::sleep(duration)),
        })
    }
}

/// Returns the default runtime used by channels that are not configured with
/// an explicit one.
pub fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(TokioRuntime)
}
