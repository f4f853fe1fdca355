//! ccrelay proxy - one local endpoint in front of many upstream providers.
//!
//! The assistant speaks Anthropic's `/v1/messages` API to a single local
//! address. Behind it, this crate:
//! - keeps a priority-ordered registry of upstream endpoints,
//! - tracks their health (bans after failures) and latency,
//! - picks one per request using the configured strategy,
//! - translates to OpenAI or Gemini wire formats where needed,
//! - retries once on a different endpoint when the first one fails.
//!
//! Only one proxy runs per port; further launchers reuse it through the
//! records written by [`singleton::SingletonCoordinator`] and hold a lease
//! on it until their assistant exits.

pub mod error;
pub mod health;
pub mod instance;
pub mod lease;
pub mod probe;
pub mod registry;
pub mod server;
pub mod service;
pub mod signal;
pub mod singleton;
pub mod speed;
pub mod status;
pub mod strategy;
pub mod transform;
pub mod types;

pub use error::{ProxyError, Result, TransformError};
pub use health::{HealthMonitor, HealthState, HealthStatus};
pub use instance::{launch, start_or_reuse, Launch, ProxyInstance};
pub use lease::LeaseTable;
pub use probe::{HttpProber, Probe, ProbeError, ProbeKind};
pub use registry::{Endpoint, EndpointRegistry};
pub use server::RunningProxy;
pub use service::{ProxyService, API_KEY_PREFIX};
pub use signal::{StopSignal, StopSignals};
pub use singleton::{LockGuard, Occupancy, SharedProxy, SingletonCoordinator};
pub use speed::SpeedSampler;
pub use status::{EndpointStatus, ProxyStatus};
pub use strategy::StrategySelector;
pub use transform::{TransformerBinding, TransformerInfo, TransformerRegistry};
