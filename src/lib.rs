//! Asynchronous node provisioning against a job-based compute backend.
//!
//! Callers go through [`lifecycle::NodeLifecycle`]. Backends plug in by
//! implementing [`providers::provider::ResourceBackend`] and
//! [`job::JobStatusClient`].

pub mod cache;
pub mod config;
pub mod job;
pub mod lifecycle;
pub mod network;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod resources;
