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
use std::time::Duration;

use serde::Deserialize;

use crate::byte_str::ByteStr;

/// An in-memory representation of a service config, usually provided to the
/// channel as a JSON object by the name resolver.
///
/// Only the portions the dispatch core consumes are modeled: the ordered LB
/// policy candidate list, the deprecated top-level policy name, and
/// per-method parameters.  The raw JSON is retained verbatim; the channel
/// compares it byte-for-byte to detect config changes and reports it through
/// channel info.
#[derive(Debug, Default, Clone)]
pub struct ServiceConfig {
    raw_json: ByteStr,
    lb_configs: Vec<LbPolicyCandidate>,
    lb_policy_name: Option<String>,
    method_configs: Vec<MethodConfigEntry>,
}

/// One entry of the `loadBalancingConfig` list: a policy name and its
/// not-yet-parsed JSON configuration.
#[derive(Debug, Clone)]
pub(crate) struct LbPolicyCandidate {
    pub(crate) name: String,
    pub(crate) config: serde_json::Value,
}

/// Per-method parameters from the service config.
#[derive(Debug, Default, Clone)]
pub struct MethodConfig {
    /// Default for calls that did not set the option explicitly.
    pub wait_for_ready: Option<bool>,
    /// Maximum duration for matching calls.  Only ever shortens the deadline
    /// the application supplied.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
struct MethodConfigEntry {
    // (service, method) pairs; an empty method matches all methods of the
    // service, and an empty service makes the entry the channel default.
    names: Vec<(String, String)>,
    config: MethodConfig,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawServiceConfig {
    load_balancing_config: Vec<serde_json::Map<String, serde_json::Value>>,
    load_balancing_policy: Option<String>,
    method_config: Vec<RawMethodConfig>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawMethodConfig {
    name: Vec<RawMethodName>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMethodName {
    service: String,
    method: String,
}

impl ServiceConfig {
    /// Parses a JSON service config.  Unknown fields are ignored.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let raw: RawServiceConfig =
            serde_json::from_str(json).map_err(|err| format!("invalid service config: {err}"))?;

        let mut lb_configs = Vec::new();
        for entry in raw.load_balancing_config {
            if entry.len() != 1 {
                return Err(format!(
                    "loadBalancingConfig entries must contain exactly one policy, found {}",
                    entry.len()
                ));
            }
            let (name, config) = entry.into_iter().next().unwrap();
            lb_configs.push(LbPolicyCandidate { name, config });
        }

        let mut method_configs = Vec::new();
        for raw_mc in raw.method_config {
            let timeout = raw_mc.timeout.map(|t| parse_duration(&t)).transpose()?;
            method_configs.push(MethodConfigEntry {
                names: raw_mc
                    .name
                    .into_iter()
                    .map(|n| (n.service, n.method))
                    .collect(),
                config: MethodConfig {
                    wait_for_ready: raw_mc.wait_for_ready,
                    timeout,
                },
            });
        }

        Ok(Self {
            raw_json: json.to_string().into(),
            lb_configs,
            lb_policy_name: raw.load_balancing_policy,
            method_configs,
        })
    }

    /// The JSON string this config was parsed from, or the empty string for a
    /// config constructed as a default.
    pub fn raw_json(&self) -> &str {
        &self.raw_json
    }

    pub(crate) fn lb_candidates(&self) -> &[LbPolicyCandidate] {
        &self.lb_configs
    }

    pub(crate) fn lb_policy_name(&self) -> Option<&str> {
        self.lb_policy_name.as_deref()
    }

    /// Looks up the method config for a call path of the form
    /// `/service/method`.  Prefers an exact service/method match, then a
    /// service-wide entry, then a default (empty-name) entry.
    pub fn method_config(&self, path: &str) -> Option<&MethodConfig> {
        let (service, method) = split_path(path);
        let mut service_wide = None;
        let mut default = None;
        for entry in &self.method_configs {
            for (s, m) in &entry.names {
                if s == service && m == method {
                    return Some(&entry.config);
                }
                if s == service && m.is_empty() {
                    service_wide.get_or_insert(&entry.config);
                }
                if s.is_empty() && m.is_empty() {
                    default.get_or_insert(&entry.config);
                }
            }
        }
        service_wide.or(default)
    }
}

// Splits "/service/method" into its parts; missing pieces are empty.
fn split_path(path: &str) -> (&str, &str) {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.split_once('/') {
        Some((service, method)) => (service, method),
        None => (path, ""),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let secs = s
        .strip_suffix('s')
        .ok_or_else(|| format!("invalid duration {s:?}: missing 's' suffix"))?;
    let secs: f64 = secs.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// A convenience wrapper for an LB policy's configuration object.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Creates a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Extracts the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ServiceConfig;

    #[test]
    fn parse_lb_and_method_config() {
        let json = r#"{
            "loadBalancingConfig": [{"pick_first": {"shuffleAddressList": true}}],
            "methodConfig": [
                {
                    "name": [{"service": "echo.Echo", "method": "UnaryEcho"}],
                    "waitForReady": true,
                    "timeout": "1.5s"
                },
                {
                    "name": [{"service": "echo.Echo"}],
                    "timeout": "10s"
                },
                {
                    "name": [{}],
                    "waitForReady": false
                }
            ]
        }"#;
        let config = ServiceConfig::from_json(json).unwrap();
        assert_eq!(config.lb_candidates().len(), 1);
        assert_eq!(config.lb_candidates()[0].name, "pick_first");
        assert_eq!(config.raw_json(), json);

        let mc = config.method_config("/echo.Echo/UnaryEcho").unwrap();
        assert_eq!(mc.wait_for_ready, Some(true));
        assert_eq!(mc.timeout, Some(Duration::from_millis(1500)));

        let mc = config.method_config("/echo.Echo/Other").unwrap();
        assert_eq!(mc.wait_for_ready, None);
        assert_eq!(mc.timeout, Some(Duration::from_secs(10)));

        let mc = config.method_config("/other.Service/Method").unwrap();
        assert_eq!(mc.wait_for_ready, Some(false));
        assert_eq!(mc.timeout, None);
    }

    #[test]
    fn parse_deprecated_policy_name() {
        let config = ServiceConfig::from_json(r#"{"loadBalancingPolicy": "pick_first"}"#).unwrap();
        assert_eq!(config.lb_policy_name(), Some("pick_first"));
        assert!(config.lb_candidates().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(ServiceConfig::from_json("not json").is_err());
        assert!(ServiceConfig::from_json(
            r#"{"loadBalancingConfig": [{"a": {}, "b": {}}]}"#
        )
        .is_err());
        assert!(
            ServiceConfig::from_json(r#"{"methodConfig": [{"timeout": "5"}]}"#).is_err()
        );
    }
}
