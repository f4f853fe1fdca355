//! Out-of-band endpoint probes.
//!
//! Health probes send the smallest valid Messages call through the
//! endpoint's transformer binding, which validates both reachability and the
//! credential. Speed probes are cheaper: a `HEAD` of the base URL or a bare
//! TCP connect.

use crate::error::TransformError;
use crate::registry::Endpoint;
use crate::transform::{InboundHeaders, TransformerBinding};
use crate::types::MessagesRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;

/// Model used by health probes when the endpoint does not pin one.
pub const DEFAULT_PROBE_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Minimal authenticated API call
    Health,
    /// Metadata-only `HEAD` of the base URL
    Head,
    /// TCP connect to the endpoint's host and port
    Ping,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("endpoint has no reachable host")]
    NoHost,

    #[error("no transformer binding for endpoint")]
    Unbound,

    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Measures one endpoint. Implementations return the observed latency.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, endpoint: &Endpoint, kind: ProbeKind) -> Result<Duration, ProbeError>;
}

/// Probe backed by real network calls.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    bindings: Arc<HashMap<String, TransformerBinding>>,
}

impl HttpProber {
    pub fn new(client: reqwest::Client, bindings: Arc<HashMap<String, TransformerBinding>>) -> Self {
        Self { client, bindings }
    }

    async fn health(&self, endpoint: &Endpoint) -> Result<Duration, ProbeError> {
        let binding = self.bindings.get(&endpoint.name).ok_or(ProbeError::Unbound)?;
        let model = endpoint.model.as_deref().unwrap_or(DEFAULT_PROBE_MODEL);
        let body = serde_json::to_value(MessagesRequest::probe(model)).map_err(TransformError::from)?;
        let (upstream, _) = binding.prepare(endpoint, body, &InboundHeaders::default())?;

        let started = Instant::now();
        let response = upstream.into_builder(&self.client).send().await?;
        let elapsed = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(elapsed)
    }

    async fn head(&self, endpoint: &Endpoint) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        // Any HTTP answer proves the endpoint is reachable; many APIs
        // reject HEAD on their root with 404 or 405.
        self.client.head(&endpoint.base_url).send().await?;
        Ok(started.elapsed())
    }

    async fn ping(&self, endpoint: &Endpoint) -> Result<Duration, ProbeError> {
        let (host, port) = endpoint.socket_target().ok_or(ProbeError::NoHost)?;
        let started = Instant::now();
        TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl Probe for HttpProber {
    async fn check(&self, endpoint: &Endpoint, kind: ProbeKind) -> Result<Duration, ProbeError> {
        match kind {
            ProbeKind::Health => self.health(endpoint).await,
            ProbeKind::Head => self.head(endpoint).await,
            ProbeKind::Ping => self.ping(endpoint).await,
        }
    }
}

/// Run a probe with a deadline, folding the timeout into [`ProbeError`].
pub async fn check_with_timeout(
    probe: &dyn Probe,
    endpoint: &Endpoint,
    kind: ProbeKind,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    match tokio::time::timeout(timeout, probe.check(endpoint, kind)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
