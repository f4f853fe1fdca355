//! The proxy service: one explicitly constructed object that owns the
//! registry, health monitor, speed sampler, selector and transformer
//! bindings, and implements the forwarding lifecycle.

use crate::error::{ProxyError, Result, TransformError};
use crate::health::HealthMonitor;
use crate::lease::LeaseTable;
use crate::probe::{HttpProber, Probe};
use crate::registry::{Endpoint, EndpointRegistry};
use crate::speed::SpeedSampler;
use crate::status::ProxyStatus;
use crate::strategy::StrategySelector;
use crate::transform::{
    apply_endpoint_model, byte_stream, passthrough_request, ByteStream, InboundHeaders,
    TransformerBinding, TransformerInfo, TransformerRegistry,
};
use crate::types::{TokenCountRequest, TokenCountResponse};
use async_stream::try_stream;
use bytes::Bytes;
use ccrelay_config::{CcrelayConfig, Strategy, SystemSettings};
use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of the ephemeral proxy credential.
pub const API_KEY_PREFIX: &str = "ccr-";

/// Body handed back to the frontend.
pub enum ProxyBody {
    Full(Bytes),
    Stream(ByteStream),
}

/// Upstream outcome relayed to the assistant.
pub struct ProxyResponse {
    /// Endpoint that served the request, if any
    pub endpoint: Option<String>,
    pub status: u16,
    pub content_type: String,
    pub body: ProxyBody,
}

impl ProxyResponse {
    fn json(endpoint: Option<String>, status: u16, value: &Value) -> Self {
        Self {
            endpoint,
            status,
            content_type: "application/json".to_string(),
            body: ProxyBody::Full(Bytes::from(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Messages,
    CountTokens,
}

/// Why a single forwarding attempt failed.
enum AttemptError {
    /// Reachability problem: bans the endpoint and triggers the retry.
    Upstream(String),
    /// Protocol mismatch: surfaced as-is, no ban.
    Transform(TransformError),
}

impl From<TransformError> for AttemptError {
    fn from(err: TransformError) -> Self {
        Self::Transform(err)
    }
}

/// Statuses that count as the endpoint failing rather than the request
/// being wrong.
pub fn is_failure_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 401 | 403 | 408 | 429) || status.is_server_error()
}

/// Mint a fresh proxy credential: `ccr-` followed by 48 hex characters.
pub fn generate_api_key() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    format!("{}{}", API_KEY_PREFIX, hex::encode(bytes))
}

pub struct ProxyService {
    registry: Arc<EndpointRegistry>,
    health: Arc<HealthMonitor>,
    speed: Arc<SpeedSampler>,
    selector: StrategySelector,
    transformers: TransformerRegistry,
    bindings: Arc<HashMap<String, TransformerBinding>>,
    client: reqwest::Client,
    prober: Arc<dyn Probe>,
    api_key: SecretString,
    settings: SystemSettings,
    leases: LeaseTable,
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("endpoints", &self.registry.len())
            .field("strategy", &self.selector.strategy())
            .finish_non_exhaustive()
    }
}

impl ProxyService {
    /// Build the service with the built-in transformers.
    ///
    /// Fails with a configuration error when no profile is proxyable or an
    /// endpoint names an unknown transformer.
    pub fn new(config: &CcrelayConfig) -> Result<Self> {
        Self::with_transformers(config, TransformerRegistry::with_builtins())
    }

    pub fn with_transformers(
        config: &CcrelayConfig,
        transformers: TransformerRegistry,
    ) -> Result<Self> {
        let settings = config.settings.clone();
        let registry = Arc::new(EndpointRegistry::from_profiles(&config.profiles)?);

        let mut bindings = HashMap::new();
        for endpoint in registry.endpoints() {
            let binding = transformers.resolve(endpoint)?;
            debug!(endpoint = %endpoint.name, transformer = binding.name(), "resolved transformer");
            bindings.insert(endpoint.name.clone(), binding);
        }
        let bindings = Arc::new(bindings);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let health = Arc::new(HealthMonitor::new(
            &registry,
            &settings.health_check,
            &settings.failed_endpoint,
        ));
        let speed = Arc::new(SpeedSampler::new(&registry, &settings.speed_first));
        let selector = StrategySelector::new(
            settings.strategy,
            registry.clone(),
            health.clone(),
            speed.clone(),
        );
        let prober: Arc<dyn Probe> = Arc::new(HttpProber::new(client.clone(), bindings.clone()));

        Ok(Self {
            registry,
            health,
            speed,
            selector,
            transformers,
            bindings,
            client,
            prober,
            api_key: SecretString::from(generate_api_key()),
            settings,
            leases: LeaseTable::new(),
        })
    }

    /// Replace the network prober used for health and speed tests.
    pub fn with_prober(mut self, prober: Arc<dyn Probe>) -> Self {
        self.prober = prober;
        self
    }

    pub fn proxy_api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Constant-time comparison against the ephemeral credential.
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        let expected = self.proxy_api_key().as_bytes();
        let presented = presented.as_bytes();
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn strategy(&self) -> Strategy {
        self.selector.strategy()
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn speed(&self) -> &SpeedSampler {
        &self.speed
    }

    /// Launchers sharing this proxy.
    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn binding(&self, endpoint: &str) -> Option<&TransformerBinding> {
        self.bindings.get(endpoint)
    }

    pub fn transformer_catalogue(&self) -> Vec<TransformerInfo> {
        self.transformers.list()
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus::collect(
            &self.registry,
            &self.health,
            &self.speed,
            self.strategy(),
            &self.bindings,
        )
    }

    /// Probe every endpoint once before the port opens.
    pub async fn perform_initial_health_checks(&self) {
        self.health
            .perform_initial_health_checks(&self.registry, self.prober.as_ref())
            .await;
        let status = self.status();
        info!(summary = %status.summary(), "initial health checks complete");
    }

    /// Start the health and speed timers. Both stop when `cancel` fires.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(handle) = self.health.clone().spawn(
            self.registry.clone(),
            self.prober.clone(),
            cancel.child_token(),
        ) {
            handles.push(handle);
        }
        if let Some(handle) = self.speed.clone().spawn(
            self.strategy() == Strategy::SpeedFirst,
            self.registry.clone(),
            self.prober.clone(),
            self.settings.health_check.timeout(),
            cancel.child_token(),
        ) {
            handles.push(handle);
        }
        handles
    }

    /// `POST /v1/messages`: select, transform, forward, retry once.
    pub async fn forward_messages(
        &self,
        body: Value,
        inbound: &InboundHeaders,
    ) -> Result<ProxyResponse> {
        self.forward(Route::Messages, body, inbound).await
    }

    /// `POST /v1/messages/count_tokens`. Transformed endpoints have no
    /// counting API, so they get a local estimate.
    pub async fn count_tokens(&self, body: Value, inbound: &InboundHeaders) -> Result<ProxyResponse> {
        self.forward(Route::CountTokens, body, inbound).await
    }

    async fn forward(&self, route: Route, body: Value, inbound: &InboundHeaders) -> Result<ProxyResponse> {
        if !body.is_object() {
            return Err(ProxyError::BadRequest("request body must be a JSON object".to_string()));
        }

        let mut excluding = HashSet::new();
        let mut last_failure: Option<(String, String)> = None;

        // First attempt plus exactly one retry.
        for attempt in 0..2 {
            let Some(endpoint) = self.selector.select_endpoint(&excluding) else {
                break;
            };
            let binding = self
                .bindings
                .get(&endpoint.name)
                .cloned()
                .unwrap_or(TransformerBinding::PassThrough);

            debug!(endpoint = %endpoint.name, attempt, ?route, "forwarding");
            match self.attempt(route, &endpoint, &binding, body.clone(), inbound).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Transform(e)) => {
                    warn!(endpoint = %endpoint.name, error = %e, "transformation failed");
                    return Err(e.into());
                }
                Err(AttemptError::Upstream(message)) => {
                    self.health.record_failure(&endpoint.name, &message);
                    excluding.insert(endpoint.name.clone());
                    last_failure = Some((endpoint.name.clone(), message));
                }
            }
        }

        match last_failure {
            Some((endpoint, message)) => Err(ProxyError::UpstreamUnavailable { endpoint, message }),
            None => Err(ProxyError::NoEndpointAvailable),
        }
    }

    async fn attempt(
        &self,
        route: Route,
        endpoint: &Endpoint,
        binding: &TransformerBinding,
        mut body: Value,
        inbound: &InboundHeaders,
    ) -> std::result::Result<ProxyResponse, AttemptError> {
        let streaming =
            route == Route::Messages && body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let (upstream, native) = match (route, binding) {
            (Route::Messages, _) => binding.prepare(endpoint, body, inbound)?,
            (Route::CountTokens, TransformerBinding::PassThrough) => {
                apply_endpoint_model(endpoint, &mut body)?;
                (
                    passthrough_request(endpoint, "/v1/messages/count_tokens", body, inbound),
                    None,
                )
            }
            (Route::CountTokens, TransformerBinding::Transform(_)) => {
                let req: TokenCountRequest = serde_json::from_value(body)
                    .map_err(|e| TransformError::InvalidRequest(e.to_string()))?;
                let estimate = TokenCountResponse {
                    input_tokens: req.estimate_tokens(),
                };
                return Ok(ProxyResponse::json(
                    Some(endpoint.name.clone()),
                    200,
                    &json!(estimate),
                ));
            }
        };

        self.health.record_request(&endpoint.name);
        let started = Instant::now();
        let timeout = self.settings.proxy.request_timeout();
        // Headers and, for non-streaming calls, the whole body share one deadline.
        let deadline = tokio::time::Instant::now() + timeout;
        let expired = || {
            AttemptError::Upstream(format!(
                "no complete response within {}ms",
                timeout.as_millis()
            ))
        };

        let response = match tokio::time::timeout_at(deadline, upstream.into_builder(&self.client).send()).await {
            Err(_) => return Err(expired()),
            Ok(Err(e)) => return Err(AttemptError::Upstream(e.to_string())),
            Ok(Ok(response)) => response,
        };
        let latency = started.elapsed();
        let status = response.status();

        if is_failure_status(status) {
            let detail = match tokio::time::timeout_at(deadline, response.text()).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            };
            let detail: String = detail.chars().take(200).collect();
            return Err(AttemptError::Upstream(format!("status {}: {}", status.as_u16(), detail)));
        }
        debug!(
            endpoint = %endpoint.name,
            status = status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            "upstream responded"
        );

        let served_by = Some(endpoint.name.clone());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        if streaming && status.is_success() {
            self.note_success(&endpoint.name, latency);
            let upstream = self.watch_stream(byte_stream(response.bytes_stream()), &endpoint.name);
            let (content_type, body) = match (binding, native) {
                (TransformerBinding::Transform(transformer), Some(req)) => (
                    "text/event-stream".to_string(),
                    transformer.transform_stream(upstream, &req),
                ),
                _ => (content_type, upstream),
            };
            return Ok(ProxyResponse {
                endpoint: served_by,
                status: status.as_u16(),
                content_type,
                body: ProxyBody::Stream(body),
            });
        }

        let body = match tokio::time::timeout_at(deadline, response.bytes()).await {
            Err(_) => return Err(expired()),
            Ok(Err(e)) => return Err(AttemptError::Upstream(e.to_string())),
            Ok(Ok(body)) => body,
        };
        if status.is_success() {
            self.note_success(&endpoint.name, latency);
        }

        match (binding, native) {
            (TransformerBinding::Transform(transformer), Some(req)) => {
                if !status.is_success() {
                    // Provider error bodies are not Anthropic-shaped.
                    return Ok(ProxyResponse::json(
                        served_by,
                        status.as_u16(),
                        &json!({
                            "type": "error",
                            "error": {
                                "type": "invalid_request_error",
                                "message": String::from_utf8_lossy(&body),
                            }
                        }),
                    ));
                }
                let value: Value = serde_json::from_slice(&body)
                    .map_err(|e| TransformError::InvalidResponse(e.to_string()))?;
                let converted = transformer.transform_response(value, &req)?;
                Ok(ProxyResponse::json(
                    served_by,
                    status.as_u16(),
                    &serde_json::to_value(converted).map_err(TransformError::from)?,
                ))
            }
            _ => Ok(ProxyResponse {
                endpoint: served_by,
                status: status.as_u16(),
                content_type,
                body: ProxyBody::Full(body),
            }),
        }
    }

    fn note_success(&self, endpoint: &str, latency: Duration) {
        self.health.record_success(endpoint);
        if self.speed.samples_live_traffic() {
            self.speed.record(endpoint, latency);
        }
    }

    /// Relay `stream`, ending it with an error once no chunk has arrived for
    /// the request timeout. Stalls and transport errors count against
    /// `endpoint`.
    fn watch_stream(&self, stream: ByteStream, endpoint: &str) -> ByteStream {
        let idle = self.settings.proxy.request_timeout();
        let health = self.health.clone();
        let endpoint = endpoint.to_string();

        Box::pin(try_stream! {
            let mut stream = stream;
            loop {
                let chunk = match tokio::time::timeout(idle, stream.next()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(_) => Err(TransformError::Stream(format!(
                        "upstream stalled for {}ms",
                        idle.as_millis()
                    ))),
                };
                if let Err(e) = &chunk {
                    warn!(endpoint = %endpoint, error = %e, "upstream stream failed");
                    health.record_failure(&endpoint, &e.to_string());
                }
                yield chunk?;
            }
        })
    }
}
