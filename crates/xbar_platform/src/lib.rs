//! XBar Platform - Device Backends
//!
//! Platform-specific device handlers implementing the core's
//! [`xbar_core::DeviceBackend`] and [`xbar_core::MirrorDevice`] traits.
//! Currently Linux/ALSA only; in-process client devices live in the core
//! crate.

#[cfg(target_os = "linux")]
pub mod alsa;

#[cfg(target_os = "linux")]
pub use crate::alsa::AlsaHandler;
