//! Version selection: canary releases, A/B tests, weighted splits and dark
//! launches.

use crate::error::{MeshError, Result};
use crate::hash::fnv1a_64;
use crate::registry::DEFAULT_VERSION;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const AB_BUCKETS: u64 = 10_000;

/// Which rule produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    Canary,
    AbTest,
    Split,
    Default,
}

impl RoutingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKind::Canary => "canary",
            RoutingKind::AbTest => "ab_test",
            RoutingKind::Split => "split",
            RoutingKind::Default => "default",
        }
    }
}

impl fmt::Display for RoutingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficRoute {
    pub version: String,
    pub routing: RoutingKind,
}

/// One entry of a traffic split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionWeight {
    pub version: String,
    pub weight: f64,
}

impl VersionWeight {
    pub fn new(version: impl Into<String>, weight: f64) -> Self {
        Self {
            version: version.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone)]
struct CanaryRule {
    version: String,
    percentage: f64,
}

#[derive(Debug, Clone)]
struct AbTestRule {
    variant_a: String,
    variant_b: String,
    split_pct: f64,
    a_requests: u64,
    b_requests: u64,
}

#[derive(Debug, Clone)]
struct DarkLaunchRule {
    version: String,
    mirror_pct: f64,
    mirrored: u64,
}

/// Final tally of an A/B test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbTestSummary {
    pub service: String,
    pub variant_a: String,
    pub variant_b: String,
    pub split_pct: f64,
    pub a_requests: u64,
    pub b_requests: u64,
    pub winner: Option<String>,
}

/// Rule and decision counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub split_rules: usize,
    pub canaries: usize,
    pub ab_tests: usize,
    pub dark_launches: usize,
    pub routing_decisions: u64,
}

fn validate_percentage(what: &str, pct: f64) -> Result<()> {
    if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
        return Err(MeshError::invalid(format!(
            "{what} percentage must be within [0, 100], got {pct}"
        )));
    }
    Ok(())
}

fn roll(percentage: f64) -> bool {
    rand::thread_rng().gen::<f64>() * 100.0 < percentage
}

/// Routes requests to service versions.
#[derive(Default)]
pub struct TrafficManager {
    splits: DashMap<String, Vec<VersionWeight>>,
    canaries: DashMap<String, CanaryRule>,
    ab_tests: DashMap<String, AbTestRule>,
    dark_launches: DashMap<String, DarkLaunchRule>,
    default_versions: DashMap<String, String>,
    routing_decisions: AtomicU64,
}

impl TrafficManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a weighted split between versions.
    pub fn set_traffic_split(&self, service: &str, weights: Vec<VersionWeight>) -> Result<()> {
        if weights.is_empty() {
            return Err(MeshError::invalid(format!("traffic split for {service} is empty")));
        }
        if let Some(bad) = weights
            .iter()
            .find(|w| !w.weight.is_finite() || w.weight < 0.0)
        {
            return Err(MeshError::invalid(format!(
                "traffic split weight for {} must be a non-negative number, got {}",
                bad.version, bad.weight
            )));
        }

        let total: f64 = weights.iter().map(|w| w.weight).sum();
        if !total.is_finite() {
            return Err(MeshError::invalid(format!(
                "traffic split weights for {service} sum past the representable range"
            )));
        }

        debug!(service = %service, versions = weights.len(), "traffic split set");
        self.splits.insert(service.to_string(), weights);
        Ok(())
    }

    /// Drops a traffic split. Returns false if there was none.
    pub fn remove_traffic_split(&self, service: &str) -> bool {
        self.splits.remove(service).is_some()
    }

    /// Picks a version. Canary rules win over A/B tests, which win over
    /// splits.
    pub fn route_request(&self, service: &str, request_id: &str) -> TrafficRoute {
        self.routing_decisions.fetch_add(1, Ordering::Relaxed);

        if let Some(canary) = self.canaries.get(service) {
            let version = if roll(canary.percentage) {
                canary.version.clone()
            } else {
                self.default_version(service)
            };
            return TrafficRoute {
                version,
                routing: RoutingKind::Canary,
            };
        }

        if let Some(mut test) = self.ab_tests.get_mut(service) {
            let bucket = (fnv1a_64(request_id.as_bytes()) % AB_BUCKETS) as f64 / 100.0;
            let version = if bucket < test.split_pct {
                test.a_requests += 1;
                test.variant_a.clone()
            } else {
                test.b_requests += 1;
                test.variant_b.clone()
            };
            return TrafficRoute {
                version,
                routing: RoutingKind::AbTest,
            };
        }

        if let Some(split) = self.splits.get(service) {
            if let Some(version) = pick_weighted(&split) {
                return TrafficRoute {
                    version,
                    routing: RoutingKind::Split,
                };
            }
        }

        TrafficRoute {
            version: self.default_version(service),
            routing: RoutingKind::Default,
        }
    }

    /// Returns the version unshaped traffic goes to.
    pub fn default_version(&self, service: &str) -> String {
        self.default_versions
            .get(service)
            .map(|v| v.clone())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }

    pub fn setup_canary(&self, service: &str, version: &str, percentage: f64) -> Result<()> {
        validate_percentage("canary", percentage)?;
        info!(service = %service, version = %version, percentage, "canary started");
        self.canaries.insert(
            service.to_string(),
            CanaryRule {
                version: version.to_string(),
                percentage,
            },
        );
        Ok(())
    }

    /// Makes the canary version the default and clears the rule.
    ///
    /// Returns the promoted version, or `None` without a canary.
    pub fn promote_canary(&self, service: &str) -> Option<String> {
        let (_, canary) = self.canaries.remove(service)?;
        info!(service = %service, version = %canary.version, "canary promoted");
        self.default_versions
            .insert(service.to_string(), canary.version.clone());
        Some(canary.version)
    }

    /// Deletes the canary rule. Returns false if there was none.
    pub fn rollback_canary(&self, service: &str) -> bool {
        let removed = self.canaries.remove(service).is_some();
        if removed {
            info!(service = %service, "canary rolled back");
        }
        removed
    }

    /// Starts an A/B test; requests hashing below `split_pct` go to `variant_a`.
    pub fn setup_ab_test(
        &self,
        service: &str,
        variant_a: &str,
        variant_b: &str,
        split_pct: f64,
    ) -> Result<()> {
        validate_percentage("A/B split", split_pct)?;
        info!(service = %service, a = %variant_a, b = %variant_b, split_pct, "A/B test started");
        self.ab_tests.insert(
            service.to_string(),
            AbTestRule {
                variant_a: variant_a.to_string(),
                variant_b: variant_b.to_string(),
                split_pct,
                a_requests: 0,
                b_requests: 0,
            },
        );
        Ok(())
    }

    /// Ends an A/B test, recording the declared winner.
    pub fn end_ab_test(&self, service: &str, winner: Option<&str>) -> Option<AbTestSummary> {
        let (_, test) = self.ab_tests.remove(service)?;
        info!(service = %service, winner = ?winner, "A/B test ended");
        Some(AbTestSummary {
            service: service.to_string(),
            variant_a: test.variant_a,
            variant_b: test.variant_b,
            split_pct: test.split_pct,
            a_requests: test.a_requests,
            b_requests: test.b_requests,
            winner: winner.map(str::to_string),
        })
    }

    pub fn setup_dark_launch(&self, service: &str, version: &str, mirror_pct: f64) -> Result<()> {
        validate_percentage("mirror", mirror_pct)?;
        info!(service = %service, version = %version, mirror_pct, "dark launch started");
        self.dark_launches.insert(
            service.to_string(),
            DarkLaunchRule {
                version: version.to_string(),
                mirror_pct,
                mirrored: 0,
            },
        );
        Ok(())
    }

    /// Deletes a dark launch rule. Returns false if there was none.
    pub fn end_dark_launch(&self, service: &str) -> bool {
        self.dark_launches.remove(service).is_some()
    }

    /// Decides whether a request should also go to the shadow version.
    ///
    /// Returns the shadow version when it should.
    pub fn should_mirror(&self, service: &str, request_id: &str) -> Option<String> {
        let mut rule = self.dark_launches.get_mut(service)?;
        if !roll(rule.mirror_pct) {
            return None;
        }
        rule.mirrored += 1;
        debug!(service = %service, request_id = %request_id, shadow = %rule.version, "mirroring request");
        Some(rule.version.clone())
    }

    /// Total `route_request` calls.
    pub fn routing_count(&self) -> u64 {
        self.routing_decisions.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TrafficStats {
        TrafficStats {
            split_rules: self.splits.len(),
            canaries: self.canaries.len(),
            ab_tests: self.ab_tests.len(),
            dark_launches: self.dark_launches.len(),
            routing_decisions: self.routing_count(),
        }
    }
}

fn pick_weighted(split: &[VersionWeight]) -> Option<String> {
    let total: f64 = split.iter().map(|w| w.weight).sum();
    if !total.is_finite() || total <= 0.0 {
        return None;
    }

    let draw = rand::thread_rng().gen_range(0.0..total);
    let mut cumulative = 0.0;
    for entry in split {
        cumulative += entry.weight;
        if draw < cumulative {
            return Some(entry.version.clone());
        }
    }
    split
        .iter()
        .rev()
        .find(|w| w.weight > 0.0)
        .map(|w| w.version.clone())
}
