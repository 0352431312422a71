//! Service discovery: instance registration, health status and TTL expiry.

use crate::clock::{self, SharedClock};
use crate::error::{MeshError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Version assigned to instances registered without one.
pub const DEFAULT_VERSION: &str = "default";

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Serving traffic.
    #[default]
    Active,
    Inactive,
    /// Finishing in-flight work, no new traffic.
    Draining,
    Starting,
    Stopping,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Active => "active",
            ServiceStatus::Inactive => "inactive",
            ServiceStatus::Draining => "draining",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ServiceStatus::Active),
            "inactive" => Ok(ServiceStatus::Inactive),
            "draining" => Ok(ServiceStatus::Draining),
            "starting" => Ok(ServiceStatus::Starting),
            "stopping" => Ok(ServiceStatus::Stopping),
            "unknown" => Ok(ServiceStatus::Unknown),
            other => Err(MeshError::invalid(format!("unknown service status '{other}'"))),
        }
    }
}

/// One registered endpoint of a service.
///
/// Values handed out by the registry are copies; mutating them has no effect
/// on registry state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub service: String,
    pub host: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub version: String,
    pub metadata: HashMap<String, String>,
    /// Zero means the instance never expires.
    #[serde(rename = "ttl_ms", serialize_with = "serialize_millis")]
    pub ttl: Duration,
    #[serde(skip)]
    pub registered_at: Instant,
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ServiceInstance {
    /// Returns the instance key, `host:port`.
    pub fn key(&self) -> String {
        instance_key(&self.host, self.port)
    }

    /// Returns true when the instance may receive traffic.
    pub fn is_active(&self) -> bool {
        self.status == ServiceStatus::Active
    }

    fn is_expired(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.last_heartbeat) > self.ttl
    }
}

/// Formats the registry key for an endpoint.
pub fn instance_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Optional attributes supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub version: Option<String>,
    pub metadata: HashMap<String, String>,
    pub ttl: Option<Duration>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of a `register` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub key: String,
    /// False when an existing instance was updated in place.
    pub created: bool,
}

/// Aggregate view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub name: String,
    pub instance_count: usize,
    pub healthy_count: usize,
    pub versions: Vec<String>,
}

/// Registry of service instances.
///
/// Instances are kept in registration order per service; the map is sharded
/// by service name.
pub struct ServiceRegistry {
    services: DashMap<String, Vec<ServiceInstance>>,
    default_ttl: Duration,
    clock: SharedClock,
}

impl ServiceRegistry {
    /// Creates an empty registry whose instances never expire by default.
    pub fn new() -> Self {
        Self::with_clock(Duration::ZERO, clock::system())
    }

    /// Creates a registry with a default instance TTL and time source.
    pub fn with_clock(default_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            services: DashMap::new(),
            default_ttl,
            clock,
        }
    }

    /// Registers an instance, or updates it if `host:port` is already known.
    pub fn register(
        &self,
        service: &str,
        host: &str,
        port: u16,
        registration: Registration,
    ) -> Result<RegisterOutcome> {
        if service.is_empty() {
            return Err(MeshError::invalid("service name must not be empty"));
        }
        if host.is_empty() {
            return Err(MeshError::invalid("instance host must not be empty"));
        }
        if port == 0 {
            return Err(MeshError::invalid("instance port must be non-zero"));
        }

        let now = self.clock.now();
        let key = instance_key(host, port);
        let mut instances = self.services.entry(service.to_string()).or_default();

        if let Some(existing) = instances.iter_mut().find(|i| i.host == host && i.port == port) {
            if let Some(version) = registration.version {
                existing.version = version;
            }
            existing.metadata.extend(registration.metadata);
            if let Some(ttl) = registration.ttl {
                existing.ttl = ttl;
            }
            existing.last_heartbeat = now;
            debug!(service = %service, instance = %key, "updated instance");
            return Ok(RegisterOutcome { key, created: false });
        }

        instances.push(ServiceInstance {
            service: service.to_string(),
            host: host.to_string(),
            port,
            status: ServiceStatus::Active,
            version: registration
                .version
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            metadata: registration.metadata,
            ttl: registration.ttl.unwrap_or(self.default_ttl),
            registered_at: now,
            last_heartbeat: now,
        });
        info!(service = %service, instance = %key, "registered instance");
        Ok(RegisterOutcome { key, created: true })
    }

    /// Removes one instance, or the whole service when `instance_key` is `None`.
    pub fn deregister(&self, service: &str, instance_key: Option<&str>) -> Result<()> {
        let Some(key) = instance_key else {
            return match self.services.remove(service) {
                Some(_) => {
                    info!(service = %service, "deregistered service");
                    Ok(())
                }
                None => Err(not_found(service)),
            };
        };

        let now_empty = {
            let mut instances = self.services.get_mut(service).ok_or_else(|| not_found(service))?;
            let before = instances.len();
            instances.retain(|i| i.key() != key);
            if instances.len() == before {
                return Err(instance_not_found(service, key));
            }
            instances.is_empty()
        };

        if now_empty {
            self.services.remove_if(service, |_, instances| instances.is_empty());
        }
        info!(service = %service, instance = %key, "deregistered instance");
        Ok(())
    }

    /// Refreshes an instance's liveness timestamp.
    pub fn heartbeat(&self, service: &str, instance_key: &str) -> Result<()> {
        let now = self.clock.now();
        self.with_instance(service, instance_key, |instance| instance.last_heartbeat = now)
    }

    /// Updates an instance's status.
    pub fn set_instance_status(
        &self,
        service: &str,
        instance_key: &str,
        status: ServiceStatus,
    ) -> Result<()> {
        self.with_instance(service, instance_key, |instance| instance.status = status)?;
        debug!(service = %service, instance = %instance_key, status = %status, "instance status changed");
        Ok(())
    }

    /// Sets one metadata entry on an instance.
    pub fn set_metadata(
        &self,
        service: &str,
        instance_key: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.with_instance(service, instance_key, |instance| {
            instance.metadata.insert(key, value);
        })
    }

    fn with_instance<F>(&self, service: &str, instance_key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        let mut instances = self
            .services
            .get_mut(service)
            .ok_or_else(|| instance_not_found(service, instance_key))?;
        let instance = instances
            .iter_mut()
            .find(|i| i.key() == instance_key)
            .ok_or_else(|| instance_not_found(service, instance_key))?;
        f(instance);
        Ok(())
    }

    /// Returns copies of a service's instances, optionally only active ones.
    pub fn get_instances(&self, service: &str, healthy_only: bool) -> Vec<ServiceInstance> {
        self.services
            .get(service)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| !healthy_only || i.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a summary of one service.
    pub fn get_service(&self, service: &str) -> Option<ServiceRecord> {
        self.services
            .get(service)
            .map(|instances| summarize(service, &instances))
    }

    /// Returns summaries of every service, sorted by name.
    pub fn list_services(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<_> = self
            .services
            .iter()
            .map(|entry| summarize(entry.key(), entry.value()))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Removes instances whose TTL has lapsed since their last heartbeat.
    ///
    /// Returns the number of instances removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.services.retain(|service, instances| {
            let before = instances.len();
            instances.retain(|i| !i.is_expired(now));
            let expired = before - instances.len();
            if expired > 0 {
                debug!(service = %service, expired = expired, "expired instances removed");
            }
            removed += expired;
            !instances.is_empty()
        });

        if removed > 0 {
            info!(removed = removed, "cleaned up expired instances");
        }
        removed
    }

    /// Returns the number of services with at least one instance.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Returns the number of registered instances across all services.
    pub fn total_instances(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }

    /// Returns the number of active instances across all services.
    pub fn healthy_instances(&self) -> usize {
        self.services
            .iter()
            .map(|entry| entry.value().iter().filter(|i| i.is_active()).count())
            .sum()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(name: &str, instances: &[ServiceInstance]) -> ServiceRecord {
    let mut versions: Vec<String> = instances.iter().map(|i| i.version.clone()).collect();
    versions.sort();
    versions.dedup();
    ServiceRecord {
        name: name.to_string(),
        instance_count: instances.len(),
        healthy_count: instances.iter().filter(|i| i.is_active()).count(),
        versions,
    }
}

fn not_found(service: &str) -> MeshError {
    MeshError::ServiceNotFound {
        service: service.to_string(),
    }
}

fn instance_not_found(service: &str, instance: &str) -> MeshError {
    MeshError::InstanceNotFound {
        service: service.to_string(),
        instance: instance.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn registry_with_clock(default_ttl: Duration) -> (ServiceRegistry, ManualClock) {
        let clock = ManualClock::new();
        (
            ServiceRegistry::with_clock(default_ttl, Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_register_and_count() {
        let reg = ServiceRegistry::new();
        let outcome = reg.register("api", "host1", 8080, Registration::new()).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.key, "host1:8080");

        reg.register("api", "host2", 8080, Registration::new()).unwrap();
        assert_eq!(reg.service_count(), 1);
        assert_eq!(reg.total_instances(), 2);
    }

    #[test]
    fn test_reregister_updates_in_place() {
        let reg = ServiceRegistry::new();
        reg.register("api", "localhost", 8080, Registration::new()).unwrap();
        let outcome = reg
            .register(
                "api",
                "localhost",
                8080,
                Registration::new().with_version("2.0.0").with_metadata("zone", "a"),
            )
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(reg.total_instances(), 1);
        let instance = &reg.get_instances("api", false)[0];
        assert_eq!(instance.version, "2.0.0");
        assert_eq!(instance.metadata.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_register_rejects_invalid_input() {
        let reg = ServiceRegistry::new();
        assert!(matches!(
            reg.register("", "h", 1, Registration::new()),
            Err(MeshError::InvalidConfig(_))
        ));
        assert!(reg.register("api", "", 1, Registration::new()).is_err());
        assert!(reg.register("api", "h", 0, Registration::new()).is_err());
        assert_eq!(reg.service_count(), 0);
    }

    #[test]
    fn test_deregister_instance_and_service() {
        let reg = ServiceRegistry::new();
        reg.register("api", "host1", 8080, Registration::new()).unwrap();
        reg.register("api", "host2", 8080, Registration::new()).unwrap();

        assert!(reg.deregister("api", Some("host1:8080")).is_ok());
        assert_eq!(reg.total_instances(), 1);

        // Removing the last instance removes the service.
        assert!(reg.deregister("api", Some("host2:8080")).is_ok());
        assert_eq!(reg.service_count(), 0);

        reg.register("web", "h", 3000, Registration::new()).unwrap();
        assert!(reg.deregister("web", None).is_ok());
        assert_eq!(reg.service_count(), 0);
    }

    #[test]
    fn test_deregister_not_found() {
        let reg = ServiceRegistry::new();
        assert!(reg.deregister("missing", None).unwrap_err().is_not_found());

        reg.register("api", "h", 1, Registration::new()).unwrap();
        assert!(matches!(
            reg.deregister("api", Some("other:1")),
            Err(MeshError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_heartbeat() {
        let reg = ServiceRegistry::new();
        reg.register("api", "localhost", 8080, Registration::new()).unwrap();
        assert!(reg.heartbeat("api", "localhost:8080").is_ok());
        assert!(reg.heartbeat("api", "missing").unwrap_err().is_not_found());
        assert!(reg.heartbeat("missing", "localhost:8080").is_err());
    }

    #[test]
    fn test_healthy_only_filter() {
        let reg = ServiceRegistry::new();
        reg.register("api", "h1", 8080, Registration::new()).unwrap();
        reg.register("api", "h2", 8080, Registration::new()).unwrap();
        reg.set_instance_status("api", "h2:8080", ServiceStatus::Inactive)
            .unwrap();

        assert_eq!(reg.get_instances("api", false).len(), 2);
        let healthy = reg.get_instances("api", true);
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].key(), "h1:8080");
        assert!(reg.get_instances("missing", true).is_empty());
    }

    #[test]
    fn test_set_status_and_metadata_not_found() {
        let reg = ServiceRegistry::new();
        reg.register("api", "localhost", 8080, Registration::new()).unwrap();
        assert!(reg
            .set_instance_status("api", "localhost:8080", ServiceStatus::Draining)
            .is_ok());
        assert!(reg
            .set_instance_status("api", "missing", ServiceStatus::Draining)
            .is_err());
        assert!(reg.set_metadata("api", "localhost:8080", "zone", "a").is_ok());
        assert!(reg.set_metadata("api", "missing", "k", "v").is_err());
    }

    #[test]
    fn test_snapshots_are_copies() {
        let reg = ServiceRegistry::new();
        reg.register("api", "h1", 8080, Registration::new()).unwrap();
        let mut snapshot = reg.get_instances("api", false);
        snapshot[0].status = ServiceStatus::Inactive;
        assert_eq!(reg.get_instances("api", true).len(), 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let (reg, clock) = registry_with_clock(Duration::ZERO);
        reg.register("api", "forever", 1, Registration::new()).unwrap();
        reg.register(
            "api",
            "short",
            1,
            Registration::new().with_ttl(Duration::from_secs(10)),
        )
        .unwrap();
        reg.register(
            "web",
            "short",
            2,
            Registration::new().with_ttl(Duration::from_secs(10)),
        )
        .unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(reg.cleanup_expired(), 0);

        reg.heartbeat("web", "short:2").unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(reg.cleanup_expired(), 1);
        assert_eq!(reg.get_instances("api", false).len(), 1);
        assert_eq!(reg.service_count(), 2);

        clock.advance(Duration::from_secs(10));
        assert_eq!(reg.cleanup_expired(), 1);
        assert_eq!(reg.service_count(), 1);
    }

    #[test]
    fn test_default_ttl_applies() {
        let (reg, clock) = registry_with_clock(Duration::from_secs(1));
        reg.register("api", "h", 1, Registration::new()).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(reg.cleanup_expired(), 1);
    }

    #[test]
    fn test_service_record() {
        let reg = ServiceRegistry::new();
        reg.register("api", "h1", 1, Registration::new().with_version("v2"))
            .unwrap();
        reg.register("api", "h2", 1, Registration::new()).unwrap();
        reg.register("web", "h3", 1, Registration::new()).unwrap();

        let record = reg.get_service("api").unwrap();
        assert_eq!(record.instance_count, 2);
        assert_eq!(record.versions, vec!["default".to_string(), "v2".to_string()]);
        assert!(reg.get_service("missing").is_none());

        let names: Vec<_> = reg.list_services().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("draining".parse::<ServiceStatus>().unwrap(), ServiceStatus::Draining);
        assert!("bogus".parse::<ServiceStatus>().is_err());
    }
}
