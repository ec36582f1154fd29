//! TactLink Common Library
//!
//! Shared vocabulary for the TactLink workspace: two wearable haptic
//! devices (PRIMARY and SECONDARY) coordinated over a lossy radio link
//! so that motor activations fire at the same wall-clock instant.
//!
//! # Module Structure
//!
//! - [`consts`] - Protocol constants and capacity limits
//! - [`role`] - Device role (PRIMARY / SECONDARY)
//! - [`clock`] - Wrap-safe 64-bit monotonic clock over a 32-bit counter
//! - [`event`] - Motor events and macrocycle batches
//! - [`wire`] - ASCII pipe-delimited frame codec
//! - [`config`] - TOML configuration loading and validation
//! - [`session`] - Session state and trigger enums
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! tact = { package = "tactlink_common", path = "../tactlink_common" }
//! ```

pub mod clock;
pub mod config;
pub mod consts;
pub mod event;
pub mod role;
pub mod session;
pub mod wire;
