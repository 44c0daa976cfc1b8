//! Fleet functions
//!
//! Automations triggered by Samsara fleet events. The core is an idempotent,
//! resumable dashcam media retrieval workflow ("rounds") persisted in a
//! namespaced JSON key-value store on S3-compatible or local object storage.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod telemetry;
