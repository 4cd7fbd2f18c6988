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

use std::any::Any;
use std::sync::Arc;

use tonic::{metadata::MetadataMap, Status};

use crate::client::filters::CallFilter;
use crate::client::service_config::{MethodConfig, ServiceConfig};

/// The per-call inputs a config selector routes on.
pub struct CallConfigRequest<'a> {
    /// The full method path, `/service/method`.
    pub method: &'a str,
    /// The call's initial metadata.
    pub metadata: &'a MetadataMap,
}

/// The per-call service-config view produced by a config selector.
#[derive(Default)]
pub struct CallConfig {
    /// Parameters to apply to the call.
    pub method_config: MethodConfig,
}

/// Routes each call to its per-call service-config view.
///
/// A selector is a pure function of the call's method and initial metadata.
/// Resolvers may attach a custom selector to their updates (for example to
/// route on metadata); when they do not, the channel derives a
/// [`DefaultConfigSelector`] from the saved service config.
pub trait ConfigSelector: Send + Sync {
    /// Computes the per-call config for one call.  An error fails the call
    /// before any pick is attempted.
    fn call_config(&self, request: &CallConfigRequest<'_>) -> Result<CallConfig, Status>;

    /// Filters to prepend to the channel's dynamic filter stack while this
    /// selector is installed.
    fn filters(&self) -> Vec<Arc<dyn CallFilter>> {
        Vec::new()
    }

    /// Reports whether this selector is interchangeable with `other`.  Used
    /// by the channel to decide whether a resolver update requires
    /// republishing the data-plane view.
    fn selector_eq(&self, other: &dyn ConfigSelector) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// The selector installed when the resolver does not supply one: a plain
/// lookup into the service config's method table.
pub(crate) struct DefaultConfigSelector {
    pub(crate) config: ServiceConfig,
}

impl ConfigSelector for DefaultConfigSelector {
    fn call_config(&self, request: &CallConfigRequest<'_>) -> Result<CallConfig, Status> {
        Ok(CallConfig {
            method_config: self
                .config
                .method_config(request.method)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn selector_eq(&self, other: &dyn ConfigSelector) -> bool {
        match other.as_any().downcast_ref::<DefaultConfigSelector>() {
            Some(other) => self.config.raw_json() == other.config.raw_json(),
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn selectors_eq(
    a: Option<&Arc<dyn ConfigSelector>>,
    b: Option<&Arc<dyn ConfigSelector>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.selector_eq(b.as_ref()),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tonic::metadata::MetadataMap;

    use super::{CallConfigRequest, ConfigSelector, DefaultConfigSelector};
    use crate::client::service_config::ServiceConfig;

    fn selector_for(json: &str) -> DefaultConfigSelector {
        DefaultConfigSelector {
            config: ServiceConfig::from_json(json).unwrap(),
        }
    }

    #[test]
    fn default_selector_method_lookup() {
        let selector = selector_for(
            r#"{"methodConfig": [{"name": [{"service": "s", "method": "m"}], "timeout": "2s"}]}"#,
        );
        let metadata = MetadataMap::new();

        let config = selector
            .call_config(&CallConfigRequest {
                method: "/s/m",
                metadata: &metadata,
            })
            .unwrap();
        assert_eq!(config.method_config.timeout, Some(Duration::from_secs(2)));

        let config = selector
            .call_config(&CallConfigRequest {
                method: "/s/other",
                metadata: &metadata,
            })
            .unwrap();
        assert_eq!(config.method_config.timeout, None);
    }

    #[test]
    fn default_selector_equality_tracks_raw_json() {
        let a = selector_for(r#"{"loadBalancingPolicy": "pick_first"}"#);
        let b = selector_for(r#"{"loadBalancingPolicy": "pick_first"}"#);
        let c = selector_for(r#"{}"#);
        assert!(a.selector_eq(&b));
        assert!(!a.selector_eq(&c));
    }
}
