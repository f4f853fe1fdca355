//! Endpoint selection.

use crate::health::HealthMonitor;
use crate::registry::{Endpoint, EndpointRegistry};
use crate::speed::SpeedSampler;
use ccrelay_config::Strategy;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

/// Picks an endpoint per request. Reads health and speed state but never
/// mutates it.
#[derive(Debug)]
pub struct StrategySelector {
    strategy: Strategy,
    registry: Arc<EndpointRegistry>,
    health: Arc<HealthMonitor>,
    speed: Arc<SpeedSampler>,
    cursor: AtomicUsize,
}

impl StrategySelector {
    pub fn new(
        strategy: Strategy,
        registry: Arc<EndpointRegistry>,
        health: Arc<HealthMonitor>,
        speed: Arc<SpeedSampler>,
    ) -> Self {
        Self {
            strategy,
            registry,
            health,
            speed,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// `None` means every endpoint is unhealthy, banned or excluded.
    pub fn select_endpoint(&self, excluding: &HashSet<String>) -> Option<Arc<Endpoint>> {
        self.select_endpoint_at(excluding, Instant::now())
    }

    pub fn select_endpoint_at(
        &self,
        excluding: &HashSet<String>,
        now: Instant,
    ) -> Option<Arc<Endpoint>> {
        // Registry order is priority order.
        let eligible: Vec<&Arc<Endpoint>> = self
            .registry
            .endpoints()
            .iter()
            .filter(|e| !excluding.contains(&e.name) && self.health.is_eligible_at(&e.name, now))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            Strategy::Fallback => eligible[0],
            Strategy::Polling => {
                let slot = self.cursor.fetch_add(1, AtomicOrdering::Relaxed);
                eligible[slot % eligible.len()]
            }
            Strategy::SpeedFirst => {
                let mut ranked: Vec<(f64, &Arc<Endpoint>)> = eligible
                    .iter()
                    .filter_map(|e| self.speed.average_at(&e.name, now).map(|avg| (avg, *e)))
                    .collect();
                // Stable sort keeps priority order among equal averages.
                ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

                match ranked.first() {
                    Some((_, endpoint)) => *endpoint,
                    // Unranked endpoints fall back to priority order.
                    None => eligible[0],
                }
            }
        };

        Some(chosen.clone())
    }
}
