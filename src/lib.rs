//! Service mesh decision core
//!
//! Given a logical service name and a request, decides whether to dispatch
//! (circuit breaker, access policy, rate limit), where to dispatch (discovery,
//! load balancing, traffic shaping) and how to bound and retry the attempt.
//! The crate performs no I/O; callers report health, outcomes and latency.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod deadline;
pub mod error;
pub mod gateway;
pub mod hash;
pub mod load_balancer;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod retry;
pub mod traffic;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use gateway::{MeshGateway, RouteRequest, RouteStatus, RoutingDecision};
