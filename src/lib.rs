//! Turnstile - external authorization sidecar for an Envoy/Istio mesh
//!
//! For every request the data plane intercepts, Turnstile decides whether
//! it is permitted: the bearer credential must verify cryptographically,
//! its claims must be semantically valid, and its identifier must not be
//! revoked. Decisions are single-shot and fail closed: any infrastructure
//! fault surfaces as an explicit deny carried inside a protocol-success
//! response.
//!
//! # Architecture
//!
//! Revocation state lives in an in-process cache so the hot path never
//! leaves the process:
//! - at startup the cache is seeded from the authoritative key-value store
//! - a fan-out event bus delivers live revocations to every replica
//! - entries expire lazily on lookup and in bulk via a periodic sweep
//!
//! # Modules
//!
//! - [`jwt`] - Bearer credential verification (single configured algorithm)
//! - [`cache`] - In-memory revocation cache with background sweeper
//! - [`bootstrap`] - One-shot cache seed from the key-value store
//! - [`mq`] - Revocation event consumer (durable fan-out exchange)
//! - [`store`] - Revocation lookup backends (cached or per-request store)
//! - [`server`] - ext-authz gRPC service and decision pipeline
//! - [`config`] - Environment configuration surface
//! - [`telemetry`] - Tracing, metrics, and structured logging setup
//! - [`http`] - Liveness, readiness, and metrics endpoints
//! - [`mask`] - Masking of sensitive values in logs
//! - [`metrics`] - Metric definitions and recording helpers
//! - [`error`] - Error types for the sidecar

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod jwt;
pub mod mask;
pub mod metrics;
pub mod mq;
pub mod server;
pub mod store;
pub mod telemetry;

pub use error::{AuthzError, Result};
