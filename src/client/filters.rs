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

//! The dynamic filter stack: an ordered chain of per-call filters assembled
//! anew on every data-plane config publication and terminated by the
//! channel's LB dispatch.

use std::sync::Arc;

use tonic::async_trait;

use crate::service::{Request, Response, Service};

/// A filter that intercepts calls flowing through a channel.
///
/// Filters are shared across all calls that captured the stack they belong
/// to; per-call state lives in the future each invocation creates.
#[async_trait]
pub trait CallFilter: Send + Sync {
    /// Processes a call.  Implementations forward to `next.proceed(..)` zero
    /// or more times.
    async fn call(&self, method: String, request: Request, next: FilterChain<'_>) -> Response;
}

/// The remainder of a filter stack, handed to each filter as its downstream.
pub struct FilterChain<'a> {
    filters: &'a [Arc<dyn CallFilter>],
    terminal: &'a Arc<dyn Service>,
}

impl<'a> FilterChain<'a> {
    /// Invokes the rest of the chain.
    pub async fn proceed(self, method: String, request: Request) -> Response {
        match self.filters.split_first() {
            Some((first, rest)) => {
                first
                    .call(
                        method,
                        request,
                        FilterChain {
                            filters: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => self.terminal.call(method, request).await,
        }
    }
}

/// A channel-level filter-stack descriptor.
///
/// Each call captures the `DynamicFilters` handle published at the instant
/// its resolution was committed and keeps using it even if the channel later
/// swaps in a new one; the handle (and the filters it references) is released
/// when the last such call completes.
pub(crate) struct DynamicFilters {
    filters: Vec<Arc<dyn CallFilter>>,
    terminal: Arc<dyn Service>,
}

impl DynamicFilters {
    /// Assembles a stack from the selector-provided prefix, an optional
    /// appended filter (retry, when enabled), and the terminal service that
    /// delegates to the LB call.
    pub(crate) fn new(
        mut filters: Vec<Arc<dyn CallFilter>>,
        appended: Option<Arc<dyn CallFilter>>,
        terminal: Arc<dyn Service>,
    ) -> Arc<Self> {
        filters.extend(appended);
        Arc::new(Self { filters, terminal })
    }

    /// Runs one call through the stack.
    pub(crate) async fn run(&self, method: String, request: Request) -> Response {
        FilterChain {
            filters: &self.filters,
            terminal: &self.terminal,
        }
        .proceed(method, request)
        .await
    }
}
