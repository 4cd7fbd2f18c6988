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

use std::{any::Any, pin::Pin};

use futures_core::Stream;
use tonic::{async_trait, Request as TonicRequest, Response as TonicResponse, Status};

/// A request is a stream of messages plus metadata.  Unary RPCs are streams
/// that yield exactly one message.
pub type Request = TonicRequest<Pin<Box<dyn Stream<Item = Box<dyn Message>> + Send + Sync>>>;

/// A response is a stream of message-or-status items plus metadata.  A call
/// that fails before reaching a server produces a response whose stream
/// yields a single `Err` item.
pub type Response =
    TonicResponse<Pin<Box<dyn Stream<Item = Result<Box<dyn Message>, Status>> + Send + Sync>>>;

/// Anything that can accept a request for a named method and produce a
/// response.  Channels, filters' downstream handles, and connected transports
/// all speak this shape.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, method: String, request: Request) -> Response;
}

/// An opaque message.  Codecs are out of scope for the dispatch core; tests
/// and transports downcast through `as_any`.
pub trait Message: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl Message for String {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a response that fails immediately with the given status.
pub(crate) fn error_response(status: Status) -> Response {
    TonicResponse::new(Box::pin(tokio_stream::once(Err(status))))
}

/// Builds a request with an empty message stream.  Used for control
/// operations, like pings, that exercise a pick without carrying a payload.
pub(crate) fn empty_request() -> Request {
    TonicRequest::new(Box::pin(tokio_stream::empty()))
}
