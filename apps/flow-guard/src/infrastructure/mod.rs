//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the ambient stack: configuration,
//! telemetry, metrics and the health endpoint.

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Paper broker and in-process publisher.
pub mod paper;

/// OpenTelemetry tracing integration.
pub mod telemetry;
