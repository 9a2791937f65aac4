//! maix-frame-hub library crate.
//!
//! Keeps the latest camera frame per device and hands it to any number of
//! viewers, each attached in the style it prefers.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Device link (frame pump in maix-host)
//!         ↓ set_image(key, bytes)
//! [maix-frame-hub]
//!   ├── domain/           ImageFrame, metadata probing, FrameHubConfig
//!   ├── application/      FrameStore: pull / push / stream fan-out
//!   └── infrastructure/
//!         └── http_server/ axum routes: /, /ws, /image/:key, /stream/:key
//!         ↓
//! Viewers (webview, browser, curl)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no async code and no I/O.
//! - `application` depends on `domain` and tokio channels only.
//! - `infrastructure` depends on all other layers plus `axum`.

/// Domain layer: frames and configuration.
pub mod domain;

/// Application layer: the frame store.
pub mod application;

/// Infrastructure layer: HTTP and WebSocket server.
pub mod infrastructure;

pub use application::{FrameStore, StreamHandle};
pub use domain::{FrameHubConfig, ImageFrame, ImageMetadata};
pub use infrastructure::{FrameHubError, FrameServer};
