//! Read-only proxy status snapshot.

use crate::health::{HealthMonitor, HealthStatus};
use crate::registry::EndpointRegistry;
use crate::speed::SpeedSampler;
use crate::transform::TransformerBinding;
use ccrelay_config::Strategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub total_count: usize,
    pub active_strategy: Strategy,
    pub per_endpoint: Vec<EndpointStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    pub name: String,
    /// Eligible for selection right now
    pub is_healthy: bool,
    pub average_response_time_ms: Option<f64>,
    pub total_requests: u64,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned_for_secs: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub transformer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProxyStatus {
    /// Derive a snapshot from live health and speed state.
    pub fn collect(
        registry: &EndpointRegistry,
        health: &HealthMonitor,
        speed: &SpeedSampler,
        strategy: Strategy,
        bindings: &HashMap<String, TransformerBinding>,
    ) -> Self {
        let now = Instant::now();
        let wall_now = Utc::now();
        let per_endpoint: Vec<EndpointStatus> = registry
            .endpoints()
            .iter()
            .filter_map(|endpoint| {
                let state = health.snapshot_at(&endpoint.name, now)?;
                Some(EndpointStatus {
                    name: endpoint.name.clone(),
                    is_healthy: state.is_eligible_at(now),
                    average_response_time_ms: speed.raw_average(&endpoint.name),
                    total_requests: state.total_requests,
                    status: state.status,
                    banned_for_secs: state.banned_for(now).map(|d| d.as_secs_f64().ceil() as u64),
                    consecutive_failures: state.consecutive_failures,
                    transformer: bindings
                        .get(&endpoint.name)
                        .map(|b| b.name().to_string())
                        .unwrap_or_default(),
                    last_checked_at: state.last_checked_at.and_then(|at| {
                        chrono::Duration::from_std(now.saturating_duration_since(at))
                            .ok()
                            .map(|ago| wall_now - ago)
                    }),
                    last_error: state.last_error,
                })
            })
            .collect();

        let healthy_count = per_endpoint.iter().filter(|e| e.is_healthy).count();
        Self {
            healthy_count,
            unhealthy_count: per_endpoint.len() - healthy_count,
            total_count: per_endpoint.len(),
            active_strategy: strategy,
            per_endpoint,
        }
    }

    /// Compact one-line summary, e.g. `2 healthy / 3 total, strategy: fallback`.
    pub fn summary(&self) -> String {
        format!(
            "{} healthy / {} total, strategy: {}",
            self.healthy_count, self.total_count, self.active_strategy
        )
    }
}
