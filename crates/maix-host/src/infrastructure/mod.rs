//! Infrastructure layer for the host application.
//!
//! Contains OS-facing adapters: the device WebSocket link, mDNS discovery,
//! configuration file storage, and the service wiring used by `main`.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `maix_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod services;
pub mod storage;
