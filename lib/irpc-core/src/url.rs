//! Endpoint descriptors and provider addresses

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const HOST_KEY: &str = "host";
pub const PORT_KEY: &str = "port";

/// Immutable description of a provider or consumer endpoint.
///
/// `parameters` must carry `host` and `port`; everything else is free-form
/// metadata that travels with the serialized node value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Url {
    service_name: String,
    application_name: String,
    parameters: BTreeMap<String, String>,
}

impl Url {
    pub fn new(
        service_name: impl Into<String>,
        application_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(HOST_KEY.to_string(), host.into());
        parameters.insert(PORT_KEY.to_string(), port.to_string());
        Self {
            service_name: service_name.into(),
            application_name: application_name.into(),
            parameters,
        }
    }

    /// Build from an arbitrary parameter map, validating `host` and `port`.
    pub fn from_parameters(
        service_name: impl Into<String>,
        application_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Result<Self> {
        let url = Self {
            service_name: service_name.into(),
            application_name: application_name.into(),
            parameters,
        };
        url.host()?;
        url.port()?;
        Ok(url)
    }

    /// Return a copy with one extra parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn host(&self) -> Result<&str> {
        self.parameter(HOST_KEY)
            .filter(|h| !h.is_empty())
            .ok_or(CoreError::MissingParameter(HOST_KEY))
    }

    pub fn port(&self) -> Result<u16> {
        let raw = self
            .parameter(PORT_KEY)
            .ok_or(CoreError::MissingParameter(PORT_KEY))?;
        raw.parse().map_err(|_| {
            CoreError::MalformedAddress(format!(
                "{}:{}",
                self.parameter(HOST_KEY).unwrap_or(""),
                raw
            ))
        })
    }

    /// The `host:port` identity of this endpoint.
    pub fn address(&self) -> Result<ProviderAddress> {
        Ok(ProviderAddress::new(self.host()?, self.port()?))
    }

    /// Provider node path: `{root}/{service}/provider/{host}:{port}`
    pub fn provider_path(&self, root: &str) -> Result<String> {
        Ok(format!(
            "{}/{}",
            provider_dir(root, &self.service_name),
            self.address()?
        ))
    }

    /// Consumer node prefix: `{root}/{service}/consumer/{app}:{host}:`
    ///
    /// The store appends the sequence suffix when the node is created.
    pub fn consumer_path(&self, root: &str) -> Result<String> {
        Ok(format!(
            "{}/{}",
            consumer_dir(root, &self.service_name),
            self.consumer_node_prefix()?
        ))
    }

    /// Name part of the consumer node before the sequence suffix.
    pub fn consumer_node_prefix(&self) -> Result<String> {
        Ok(format!("{}:{}:", self.application_name, self.host()?))
    }

    /// Value stored on a provider node: `app;service;host:port;timestamp_ms`
    pub fn to_provider_string(&self) -> Result<String> {
        Ok(format!(
            "{};{};{};{}",
            self.application_name,
            self.service_name,
            self.address()?,
            chrono::Utc::now().timestamp_millis()
        ))
    }

    /// Value stored on a consumer node: `app;service;host;timestamp_ms`
    pub fn to_consumer_string(&self) -> Result<String> {
        Ok(format!(
            "{};{};{};{}",
            self.application_name,
            self.service_name,
            self.host()?,
            chrono::Utc::now().timestamp_millis()
        ))
    }
}

pub fn service_dir(root: &str, service_name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), service_name)
}

pub fn provider_dir(root: &str, service_name: &str) -> String {
    format!("{}/provider", service_dir(root, service_name))
}

pub fn consumer_dir(root: &str, service_name: &str) -> String {
    format!("{}/consumer", service_dir(root, service_name))
}

/// Extract the service name from a path below `root`.
///
/// `/irpc/OrderService/provider` yields `OrderService`.
pub fn service_name_from_path<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix(root.trim_end_matches('/'))?
        .strip_prefix('/')?
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// `host:port` identity of a provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderAddress {
    pub host: String,
    pub port: u16,
}

impl ProviderAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProviderAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        // rsplit keeps bracket-less IPv6 hosts intact up to the last colon
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::MalformedAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(CoreError::MalformedAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CoreError::MalformedAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}
