//! Provider transformers.
//!
//! The assistant always speaks Anthropic's Messages API. A [`Transformer`]
//! rewrites that request for another provider and rewrites the provider's
//! response (plain JSON or SSE) back. Endpoints that already speak the
//! native protocol are bound to [`TransformerBinding::PassThrough`].
//!
//! Bindings are resolved once per endpoint at startup:
//! 1. explicit `transformer` name (anything but `"auto"`),
//! 2. the endpoint host matched against each transformer's domains,
//! 3. pass-through.

pub mod gemini;
pub mod openai;
pub mod sse;

use crate::error::{ProxyError, TransformError};
use crate::registry::Endpoint;
use crate::types::{MessagesRequest, MessagesResponse};
use bytes::Bytes;
use ccrelay_config::AUTO_TRANSFORMER;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

pub use gemini::GeminiTransformer;
pub use openai::OpenAiTransformer;

/// Byte stream flowing between upstream and the assistant.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransformError>> + Send>>;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Names that force pass-through even when a domain would match.
const PASSTHROUGH_NAMES: &[&str] = &["none", "passthrough", "anthropic"];

/// A fully built upstream HTTP call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl UpstreamRequest {
    pub fn into_builder(self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client.post(&self.url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.json(&self.body)
    }
}

/// Headers from the assistant that pass-through endpoints should see.
#[derive(Debug, Clone, Default)]
pub struct InboundHeaders {
    pub anthropic_version: Option<String>,
    pub anthropic_beta: Option<String>,
}

/// Bidirectional rewriter between the Anthropic protocol and a provider.
pub trait Transformer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Hosts this transformer is auto-detected for.
    fn domains(&self) -> &'static [&'static str];

    fn build_request(
        &self,
        req: &MessagesRequest,
        endpoint: &Endpoint,
    ) -> Result<UpstreamRequest, TransformError>;

    fn transform_response(
        &self,
        body: Value,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, TransformError>;

    /// Convert the provider's streamed body into Anthropic SSE frames.
    fn transform_stream(&self, upstream: ByteStream, req: &MessagesRequest) -> ByteStream;
}

/// How an endpoint's traffic is rewritten.
#[derive(Debug, Clone)]
pub enum TransformerBinding {
    PassThrough,
    Transform(Arc<dyn Transformer>),
}

impl TransformerBinding {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PassThrough => "passthrough",
            Self::Transform(t) => t.name(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::PassThrough)
    }

    /// Build the upstream call for a Messages request body.
    ///
    /// The endpoint's model, when configured, replaces the one the assistant
    /// asked for. The parsed native request is returned for transformed
    /// bindings since the response conversion needs it.
    pub fn prepare(
        &self,
        endpoint: &Endpoint,
        mut body: Value,
        inbound: &InboundHeaders,
    ) -> Result<(UpstreamRequest, Option<MessagesRequest>), TransformError> {
        apply_endpoint_model(endpoint, &mut body)?;

        match self {
            Self::PassThrough => Ok((passthrough_request(endpoint, "/v1/messages", body, inbound), None)),
            Self::Transform(transformer) => {
                let req: MessagesRequest = serde_json::from_value(body)
                    .map_err(|e| TransformError::InvalidRequest(e.to_string()))?;
                let upstream = transformer.build_request(&req, endpoint)?;
                Ok((upstream, Some(req)))
            }
        }
    }
}

/// Replace the requested model with the endpoint's pinned one, if any.
pub fn apply_endpoint_model(endpoint: &Endpoint, body: &mut Value) -> Result<(), TransformError> {
    let obj = body.as_object_mut().ok_or_else(|| {
        TransformError::InvalidRequest("request body must be a JSON object".to_string())
    })?;
    if let Some(model) = &endpoint.model {
        obj.insert("model".to_string(), Value::String(model.clone()));
    }
    Ok(())
}

/// Forward an Anthropic-native call with the endpoint's real credential.
pub fn passthrough_request(
    endpoint: &Endpoint,
    path: &str,
    body: Value,
    inbound: &InboundHeaders,
) -> UpstreamRequest {
    let mut headers = vec![
        ("content-type".to_string(), "application/json".to_string()),
        (
            "anthropic-version".to_string(),
            inbound
                .anthropic_version
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_VERSION.to_string()),
        ),
        ("x-api-key".to_string(), endpoint.api_key().to_string()),
    ];

    // Third-party Anthropic-compatible relays usually authenticate with a
    // bearer token; the first-party API rejects unexpected OAuth headers.
    let first_party = endpoint
        .host()
        .is_some_and(|h| h == "api.anthropic.com");
    if !first_party {
        headers.push((
            "authorization".to_string(),
            format!("Bearer {}", endpoint.api_key()),
        ));
    }

    if let Some(beta) = &inbound.anthropic_beta {
        headers.push(("anthropic-beta".to_string(), beta.clone()));
    }

    UpstreamRequest {
        url: endpoint.url_for(path),
        headers,
        body,
    }
}

/// Catalogue entry for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerInfo {
    pub name: String,
    pub domain_bound: bool,
    pub domains: Vec<String>,
}

/// Named transformers known to the proxy.
#[derive(Debug, Default)]
pub struct TransformerRegistry {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the OpenAI and Gemini transformers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiTransformer));
        registry.register(Arc::new(GeminiTransformer));
        registry
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        self.transformers
            .retain(|t| !t.name().eq_ignore_ascii_case(transformer.name()));
        self.transformers.push(transformer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers
            .iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Resolve the binding for an endpoint. Deterministic for a given
    /// registry and endpoint.
    pub fn resolve(&self, endpoint: &Endpoint) -> Result<TransformerBinding, ProxyError> {
        let explicit = endpoint
            .transformer
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case(AUTO_TRANSFORMER));

        if let Some(name) = explicit {
            if PASSTHROUGH_NAMES.iter().any(|p| p.eq_ignore_ascii_case(name)) {
                return Ok(TransformerBinding::PassThrough);
            }
            return self
                .get(name)
                .map(TransformerBinding::Transform)
                .ok_or_else(|| ProxyError::UnknownTransformer {
                    endpoint: endpoint.name.clone(),
                    transformer: name.to_string(),
                });
        }

        if let Some(host) = endpoint.host() {
            for transformer in &self.transformers {
                if transformer
                    .domains()
                    .iter()
                    .any(|domain| host_matches(&host, domain))
                {
                    return Ok(TransformerBinding::Transform(transformer.clone()));
                }
            }
        }

        Ok(TransformerBinding::PassThrough)
    }

    pub fn list(&self) -> Vec<TransformerInfo> {
        self.transformers
            .iter()
            .map(|t| TransformerInfo {
                name: t.name().to_string(),
                domain_bound: !t.domains().is_empty(),
                domains: t.domains().iter().map(|d| d.to_string()).collect(),
            })
            .collect()
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Map an upstream stream-of-bytes error into the transform error space.
pub fn byte_stream<S, E>(stream: S) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display,
{
    use futures::StreamExt;
    Box::pin(stream.map(|chunk| chunk.map_err(|e| TransformError::Stream(e.to_string()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(base_url: &str, transformer: Option<&str>) -> Endpoint {
        let mut endpoint = Endpoint::for_tests("ep", base_url, 1);
        endpoint.transformer = transformer.map(str::to_string);
        endpoint
    }

    #[test]
    fn test_explicit_name_wins_over_domain() {
        let registry = TransformerRegistry::with_builtins();
        let binding = registry
            .resolve(&endpoint("https://api.openai.com", Some("gemini")))
            .unwrap();
        assert_eq!(binding.name(), "gemini");
    }

    #[test]
    fn test_auto_detects_by_domain() {
        let registry = TransformerRegistry::with_builtins();
        let binding = registry
            .resolve(&endpoint("https://openrouter.ai/api/v1", Some("auto")))
            .unwrap();
        assert_eq!(binding.name(), "openai");

        let binding = registry
            .resolve(&endpoint("https://generativelanguage.googleapis.com", None))
            .unwrap();
        assert_eq!(binding.name(), "gemini");
    }

    #[test]
    fn test_unknown_domain_is_passthrough() {
        let registry = TransformerRegistry::with_builtins();
        let binding = registry
            .resolve(&endpoint("https://api.anthropic.com", Some("auto")))
            .unwrap();
        assert!(binding.is_passthrough());

        // Suffix matches must align on a label boundary.
        let binding = registry
            .resolve(&endpoint("https://notapi.openai.com.evil.io", None))
            .unwrap();
        assert!(binding.is_passthrough());
    }

    #[test]
    fn test_explicit_none_forces_passthrough() {
        let registry = TransformerRegistry::with_builtins();
        let binding = registry
            .resolve(&endpoint("https://api.openai.com", Some("none")))
            .unwrap();
        assert!(binding.is_passthrough());
    }

    #[test]
    fn test_unknown_explicit_name_is_configuration_error() {
        let registry = TransformerRegistry::with_builtins();
        let err = registry
            .resolve(&endpoint("https://api.example.com", Some("cohere")))
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownTransformer { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let registry = TransformerRegistry::with_builtins();
        let ep = endpoint("https://api.groq.com/openai", None);
        let first = registry.resolve(&ep).unwrap();
        let second = registry.resolve(&ep).unwrap();
        match (first, second) {
            (TransformerBinding::Transform(a), TransformerBinding::Transform(b)) => {
                assert!(Arc::ptr_eq(&a, &b));
            }
            other => panic!("expected transform bindings, got {:?}", other),
        }
    }

    #[test]
    fn test_list_reports_domains() {
        let registry = TransformerRegistry::with_builtins();
        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|info| info.domain_bound));
        assert!(list
            .iter()
            .any(|info| info.name == "gemini"
                && info.domains.contains(&"generativelanguage.googleapis.com".to_string())));
    }

    #[test]
    fn test_passthrough_prepare_overrides_model_and_sets_credentials() {
        let ep = endpoint("https://relay.example.com", None);
        let inbound = InboundHeaders {
            anthropic_version: None,
            anthropic_beta: Some("tools-2024".into()),
        };
        let (upstream, native) = TransformerBinding::PassThrough
            .prepare(&ep, json!({"model": "claude-opus", "max_tokens": 5, "messages": []}), &inbound)
            .unwrap();

        assert!(native.is_none());
        assert_eq!(upstream.url, "https://relay.example.com/v1/messages");
        assert_eq!(upstream.body["model"], "claude-sonnet-4-5");
        let header = |name: &str| {
            upstream
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("x-api-key").as_deref(), Some("sk-ep"));
        assert_eq!(header("authorization").as_deref(), Some("Bearer sk-ep"));
        assert_eq!(header("anthropic-version").as_deref(), Some(DEFAULT_ANTHROPIC_VERSION));
        assert_eq!(header("anthropic-beta").as_deref(), Some("tools-2024"));
    }

    #[test]
    fn test_first_party_passthrough_omits_bearer() {
        let ep = endpoint("https://api.anthropic.com", None);
        let upstream = passthrough_request(&ep, "/v1/messages", json!({}), &InboundHeaders::default());
        assert!(upstream.headers.iter().all(|(k, _)| k != "authorization"));
    }

    #[test]
    fn test_transform_prepare_rejects_malformed_body() {
        let registry = TransformerRegistry::with_builtins();
        let binding = TransformerBinding::Transform(registry.get("openai").unwrap());
        let ep = endpoint("https://api.openai.com", None);
        let err = binding
            .prepare(&ep, json!({"messages": "nope"}), &InboundHeaders::default())
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidRequest(_)));
    }
}
