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

//! The per-call pipeline: wait for a usable resolution, apply the config
//! selector and per-method parameters, build the dynamic call, and drive the
//! pick loop onto a connected subchannel.
//!
//! A call suspends in exactly two places: awaiting the resolution watch
//! ("resolver-queued") and awaiting a picker change ("LB-queued"), so it is
//! structurally in at most one queue at a time.  Cancellation is dropping the
//! call future.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_core::Stream;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::{async_trait, Code, Status};
use tracing::trace;

use crate::client::channel::{ActiveChannel, ConfigBundle, PersistentChannel, ResolutionState};
use crate::client::config_selector::CallConfigRequest;
use crate::client::load_balancing::PickResult;
use crate::client::CallOptions;
use crate::service::{error_response, Message, Request, Response, Service};

/// Entry point for one RPC on a channel.
pub(crate) async fn invoke(
    channel: Arc<PersistentChannel>,
    method: String,
    mut request: Request,
) -> Response {
    let options = request
        .extensions()
        .get::<CallOptions>()
        .cloned()
        .unwrap_or_default();

    // A deadline already in the past fails before any dynamic call exists.
    if let Some(deadline) = options.deadline {
        if deadline <= Instant::now() {
            return error_response(Status::deadline_exceeded(
                "deadline expired before the call started",
            ));
        }
    }

    let bundle = match wait_for_resolution(&channel, &options).await {
        Ok(bundle) => bundle,
        Err(status) => return error_response(status),
    };

    // Apply the config selector; its view of the service config is committed
    // for the lifetime of this call.
    let call_config = match bundle.config_selector.call_config(&CallConfigRequest {
        method: &method,
        metadata: request.metadata(),
    }) {
        Ok(call_config) => call_config,
        Err(status) => {
            return error_response(rewrite_illegal_status(
                status,
                "config selector",
                Code::Internal,
            ))
        }
    };

    // Per-method parameters: wait_for_ready applies only when the caller did
    // not set it; a method timeout can only shorten the deadline.
    let mut effective = options;
    if effective.wait_for_ready.is_none() {
        effective.wait_for_ready = call_config.method_config.wait_for_ready;
    }
    if let Some(timeout) = call_config.method_config.timeout {
        let from_config = Instant::now() + timeout;
        effective.deadline = Some(match effective.deadline {
            Some(deadline) => deadline.min(from_config),
            None => from_config,
        });
    }
    let deadline = effective.deadline;
    request.extensions_mut().insert(effective);

    // The call keeps the filter stack it captured here even if the channel
    // publishes a new one mid-flight.
    let filters = bundle.dynamic_filters.clone();
    let call = filters.run(method, request);
    match deadline {
        None => call.await,
        Some(deadline) => {
            let timer = channel
                .runtime
                .sleep(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                response = call => response,
                _ = timer => error_response(Status::deadline_exceeded("deadline exceeded")),
            }
        }
    }
}

// Blocks until the channel publishes a usable resolution.  Calls suspended
// here are the resolver-queued set; publication of a new data-plane view (or
// of a resolver failure, for non-wait-for-ready calls) wakes all of them.
async fn wait_for_resolution(
    channel: &Arc<PersistentChannel>,
    options: &CallOptions,
) -> Result<Arc<ConfigBundle>, Status> {
    loop {
        let active = channel.ensure_active()?;
        let mut resolution = active.resolution.clone();
        loop {
            let state = resolution.borrow_and_update().clone();
            match state {
                ResolutionState::Ready(bundle) => return Ok(bundle),
                ResolutionState::Shutdown(status) => return Err(status),
                ResolutionState::TransientFailure(status) if !options.wait_for_ready() => {
                    return Err(status)
                }
                _ => {}
            }
            if resolution.changed().await.is_err() {
                // The active channel was torn down (idle transition); retry
                // against the next activation.
                break;
            }
        }
    }
}

/// The terminal of every dynamic filter stack: picks a subchannel and routes
/// the call onto its connected transport.
///
/// Holds only a weak reference to the channel; the channel's shutdown
/// invalidates it rather than the other way around.
pub(crate) struct LbCallDispatcher {
    channel: Weak<PersistentChannel>,
}

impl LbCallDispatcher {
    pub(crate) fn new(channel: Weak<PersistentChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Service for LbCallDispatcher {
    async fn call(&self, method: String, mut request: Request) -> Response {
        let options = request
            .extensions()
            .get::<CallOptions>()
            .cloned()
            .unwrap_or_default();
        let wait_for_ready = options.wait_for_ready();

        loop {
            let Some(channel) = self.channel.upgrade() else {
                return error_response(Status::unavailable("channel was destroyed"));
            };
            let active: Arc<ActiveChannel> = match channel.ensure_active() {
                Ok(active) => active,
                Err(status) => return error_response(status),
            };
            drop(channel);

            // Load the snapshot, then pick with no locks held.
            let snapshot = active.picker.current();
            let decision = match &snapshot.state {
                Some(lb) => lb.picker.pick(&request),
                None => PickResult::Queue,
            };

            match decision {
                PickResult::Pick(pick) => {
                    // The picked subchannel may have lost its connection
                    // since the picker was built; queue in that case.
                    if let Some(svc) = pick.subchannel.connected_service() {
                        merge_metadata(request.metadata_mut(), pick.metadata);
                        if let Some(authority) = pick.authority_override {
                            let mut options = options.clone();
                            options.authority = Some(authority);
                            request.extensions_mut().insert(options);
                        }
                        trace!(subchannel = %pick.subchannel, "dispatching call");
                        let response = svc.call(method, request).await;
                        return match pick.on_complete {
                            Some(on_complete) => track_completion(response, on_complete),
                            None => response,
                        };
                    }
                }
                PickResult::Queue => {}
                PickResult::Fail(status) => {
                    if !wait_for_ready {
                        return error_response(rewrite_illegal_status(
                            status,
                            "LB pick",
                            Code::Unavailable,
                        ));
                    }
                }
                PickResult::Drop(status) => {
                    // Drops terminate the call regardless of wait_for_ready.
                    let status = rewrite_illegal_status(status, "LB drop", Code::Internal);
                    return error_response(with_drop_marker(status));
                }
            }

            // LB-queued: woken by the next picker installation.
            active.picker.wait_for_change(snapshot.seq).await;
        }
    }
}

fn merge_metadata(into: &mut MetadataMap, from: MetadataMap) {
    for entry in from.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                into.append(key.clone(), value.clone());
            }
            KeyAndValueRef::Binary(key, value) => {
                into.append_bin(key.clone(), value.clone());
            }
        }
    }
}

/// Metadata key marking a status as an LB drop.
pub const DROP_MARKER_KEY: &str = "crossbar-call-dropped";

fn with_drop_marker(status: Status) -> Status {
    let mut metadata = status.metadata().clone();
    metadata.insert(DROP_MARKER_KEY, "true".parse().unwrap());
    Status::with_metadata(status.code(), status.message(), metadata)
}

/// Reports whether a status came from an LB drop.
pub fn is_dropped(status: &Status) -> bool {
    status.metadata().get(DROP_MARKER_KEY).is_some()
}

// Codes the control plane may not produce, per the status-code restriction
// the pick path enforces.  Anything else passes through untouched.
fn is_illegal_control_plane_code(code: Code) -> bool {
    matches!(
        code,
        Code::Ok
            | Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::FailedPrecondition
            | Code::Aborted
            | Code::OutOfRange
            | Code::DataLoss
    )
}

/// Remaps statuses the control plane is not allowed to produce onto
/// `replacement`, prefixed with the producing component for diagnosis.
pub(crate) fn rewrite_illegal_status(status: Status, source: &str, replacement: Code) -> Status {
    if !is_illegal_control_plane_code(status.code()) {
        return status;
    }
    Status::new(
        replacement,
        format!(
            "{source} returned illegal status code {:?}: {}",
            status.code(),
            status.message()
        ),
    )
}

// Wraps a response stream so the pick's completion callback fires once, with
// the call's final status.
fn track_completion(
    response: Response,
    on_complete: Box<dyn FnOnce(&Status) + Send + Sync>,
) -> Response {
    let (metadata, stream, extensions) = response.into_parts();
    let stream = CompletionTracking {
        inner: stream,
        on_complete: Some(on_complete),
    };
    Response::from_parts(metadata, Box::pin(stream), extensions)
}

struct CompletionTracking {
    inner: Pin<Box<dyn Stream<Item = Result<Box<dyn Message>, Status>> + Send + Sync>>,
    on_complete: Option<Box<dyn FnOnce(&Status) + Send + Sync>>,
}

impl Stream for CompletionTracking {
    type Item = Result<Box<dyn Message>, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = this.inner.as_mut().poll_next(cx);
        match &poll {
            Poll::Ready(None) => {
                if let Some(on_complete) = this.on_complete.take() {
                    on_complete(&Status::new(tonic::Code::Ok, ""));
                }
            }
            Poll::Ready(Some(Err(status))) => {
                let status = status.clone();
                if let Some(on_complete) = this.on_complete.take() {
                    on_complete(&status);
                }
            }
            _ => {}
        }
        poll
    }
}

#[cfg(test)]
mod test {
    use tonic::{Code, Status};

    use super::{is_dropped, rewrite_illegal_status, with_drop_marker};

    #[test]
    fn illegal_codes_are_remapped() {
        let status = rewrite_illegal_status(
            Status::new(Code::InvalidArgument, "nope"),
            "resolver",
            Code::Unavailable,
        );
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().contains("resolver"));
        assert!(status.message().contains("nope"));

        let status = rewrite_illegal_status(Status::new(tonic::Code::Ok, ""), "LB drop", Code::Internal);
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn legal_codes_pass_through() {
        let status =
            rewrite_illegal_status(Status::unavailable("down"), "LB pick", Code::Unavailable);
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "down");
    }

    #[test]
    fn drop_marker_round_trip() {
        let status = with_drop_marker(Status::unavailable("dropped by policy"));
        assert!(is_dropped(&status));
        assert!(!is_dropped(&Status::unavailable("ordinary failure")));
    }
}
