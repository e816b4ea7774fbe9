//! rsdrmsession - DRM session and license management engine.
//!
//! This crate provides:
//! - A bounded pool of CDM sessions with a key cache and slot allocator.
//! - The license acquisition protocol: challenge, transport exchange with
//!   retries and token refresh, key installation.
//! - Background license renewal per session slot.
//! - License prefetch queues (normal and VSS) with failure escalation.
//!
//! Cryptography, the license wire transport and output protection are
//! external collaborators behind the traits in [`cdm`], [`transport`] and
//! [`token`].
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
#![allow(clippy::result_large_err)]

/// External CDM capabilities.
pub mod cdm;
/// Engine configuration.
pub mod config;
/// Common error types and Result alias.
pub mod error;
/// DRM events delivered to the player.
pub mod event;
/// DRM system helpers and license requests.
pub mod helper;
/// Key cache and slot allocator.
pub mod key_cache;
/// Public facade over the session manager and the prefetcher.
pub mod license_manager;
/// License prefetch queues.
pub mod prefetch;
/// License acquisition protocol.
pub mod protocol;
/// Session data types.
pub mod session;
/// Session slot pool and session lifecycle.
pub mod session_manager;
/// Access token service and cache.
pub mod token;
/// License transports.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use license_manager::DrmLicenseManager;
