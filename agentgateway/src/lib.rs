//! Process wiring for the dynamic configuration subsystem: layered config loading (component H),
//! control-plane gRPC transport/auth (component K), the xDS-to-cluster-manager glue
//! ([`state_manager`]), and the ambient admin/metrics HTTP surface (component J).
//!
//! Grounded on `crates/agentgateway`'s `app.rs`/`config.rs`/`control/mod.rs`/`mtrcs.rs`, trimmed
//! to the fields and subsystems this crate's scope (xDS dynamic configuration, not the HTTP/TCP
//! data plane) actually needs.

pub mod admin;
pub mod app;
pub mod config;
pub mod control;
pub mod state_manager;

pub use config::{Address, Config, XdsConfig};
