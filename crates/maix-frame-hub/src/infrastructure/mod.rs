//! Infrastructure layer for maix-frame-hub.
//!
//! Binds the HTTP listener and adapts [`FrameStore`](crate::application::FrameStore)
//! channels to HTTP responses and WebSocket messages.
//!
//! # What does NOT belong here?
//!
//! - Deciding which consumer gets which frame (that is the application layer)
//! - Frame rendering (that is the domain layer)

pub mod http_server;

pub use http_server::{router, FrameHubError, FrameServer};
