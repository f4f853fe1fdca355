//! Endpoint registry.
//!
//! Turns the external profile list into the ordered, immutable set of
//! upstream endpoints the proxy balances across. No I/O happens here.

use crate::error::{ProxyError, Result};
use ccrelay_config::ProfileConfig;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// One upstream target. Immutable for the lifetime of the proxy.
#[derive(Debug)]
pub struct Endpoint {
    pub name: String,
    /// Base URL without a trailing slash
    pub base_url: String,
    api_key: SecretString,
    pub model: Option<String>,
    /// Explicit transformer name, `"auto"`, or `None` (same as auto)
    pub transformer: Option<String>,
    pub priority: u32,
}

impl Endpoint {
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Host part of the base URL, lowercased.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// `host:port` used by the TCP reachability probe.
    pub fn socket_target(&self) -> Option<(String, u16)> {
        let url = Url::parse(&self.base_url).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        Some((host, port))
    }

    /// Join a path onto the base URL, avoiding a doubled `/v1` when the
    /// configured base already ends with it.
    pub fn url_for(&self, path: &str) -> String {
        let path = if self.base_url.ends_with("/v1") {
            path.strip_prefix("/v1").unwrap_or(path)
        } else {
            path
        };
        format!("{}{}", self.base_url, path)
    }

    fn from_profile(profile: &ProfileConfig) -> Result<Self> {
        let base_url = profile.base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| ProxyError::InvalidEndpoint {
            endpoint: profile.name.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: profile.name.clone(),
            base_url,
            api_key: SecretString::from(profile.api_key.trim().to_string()),
            model: profile
                .model
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            transformer: profile.transformer.clone(),
            priority: profile.priority,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, base_url: &str, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            api_key: SecretString::from(format!("sk-{}", name)),
            model: Some("claude-sonnet-4-5".to_string()),
            transformer: None,
            priority,
        }
    }
}

/// Ordered, read-only endpoint collection.
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
    by_name: HashMap<String, usize>,
}

impl EndpointRegistry {
    /// Build the registry from configured profiles.
    ///
    /// Keeps enabled profiles that are either complete (base URL, credential
    /// and model) or transform-eligible, ordered by priority with ties in
    /// configuration order.
    pub fn from_profiles(profiles: &[ProfileConfig]) -> Result<Self> {
        let mut endpoints = Vec::new();
        for profile in profiles {
            if !profile.enabled {
                continue;
            }
            if !profile.is_complete() && !profile.is_transform_eligible() {
                warn!(profile = %profile.name, "skipping incomplete profile");
                continue;
            }
            endpoints.push(Endpoint::from_profile(profile)?);
        }

        Self::new(endpoints)
    }

    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        let mut endpoints: Vec<Endpoint> = endpoints;
        // Stable sort keeps configuration order for equal priorities.
        endpoints.sort_by_key(|e| e.priority);

        let mut kept = Vec::with_capacity(endpoints.len());
        let mut by_name = HashMap::new();
        for endpoint in endpoints {
            if by_name.contains_key(&endpoint.name) {
                warn!(endpoint = %endpoint.name, "duplicate endpoint name, keeping the first");
                continue;
            }
            by_name.insert(endpoint.name.clone(), kept.len());
            kept.push(Arc::new(endpoint));
        }

        if kept.is_empty() {
            return Err(ProxyError::NoProxyableEndpoints);
        }

        Ok(Self {
            endpoints: kept,
            by_name,
        })
    }

    /// Endpoints in priority order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.by_name.get(name).map(|&idx| &self.endpoints[idx])
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
