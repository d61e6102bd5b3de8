//! Subgate - a small container platform behind a Host-routing front door
//!
//! This library provides:
//! - Launch, Terminate, Logs and List of one container per subdomain
//! - A durable registry of launched containers (SQLite)
//! - An in-memory route table rebuilt from the registry at startup
//! - One HTTP listener per configured port, dispatching on the Host header
//!   to either the control API or the container bound to the subdomain

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
#[doc(hidden)]
pub mod fake;
pub mod info;
pub mod orchestrator;
pub mod registry;
pub mod routes;
