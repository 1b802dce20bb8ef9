//! rsmediadrm - DRM license session manager over a native CDM engine.
//!
//! This crate provides:
//! - The [`manager::SessionManager`] façade with promise-style create, update,
//!   load, remove and close operations.
//! - Transparent device/origin provisioning with in-order replay of creates
//!   that arrived while it was running.
//! - Durable offline license metadata through [`store::PersistentStore`]
//!   (in memory or as a JSON file).
//! - A CLI for inspecting and maintaining license stores.
//!
//! The decryption engine itself is not part of this crate; hosts plug one in
//! by implementing [`cdm::CdmEngine`].
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `chrono`: use chrono for timestamps in the CLI.
//! - `tracing`: enable tracing macros (default).
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Native engine boundary.
pub mod cdm;
/// Caller-facing events and the client sink.
pub mod client;
/// Manager configuration.
pub mod config;
/// Deferred delivery of engine events.
pub mod deferrer;
/// Common error types and Result alias.
pub mod error;
/// Key status reporting.
pub mod key;
/// Session manager façade.
pub mod manager;
/// Creates waiting for provisioning.
pub mod pending;
/// Provisioning state machine.
pub mod provisioning;
/// Live session registry.
pub mod registry;
/// Session identity and metadata.
pub mod session;
/// Persistent license storage.
pub mod store;
/// Shared helper utilities.
pub mod utils;

pub use client::{Client, ClientEvent, PromiseId};
pub use config::ManagerConfig;
pub use error::{Error, ErrorCode, Rejection, Result};
pub use manager::SessionManager;
pub use session::{KeyType, SessionToken};
