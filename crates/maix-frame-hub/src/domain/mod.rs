//! Domain layer for maix-frame-hub.
//!
//! Pure types with no dependency on sockets or async runtimes: the image frame
//! itself, how it is rendered for each delivery style, and the hub
//! configuration.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpListener`, or `WebSocket` types
//! - Locks, channels, or anything shared between tasks

pub mod config;
pub mod frame;

pub use config::FrameHubConfig;
pub use frame::{probe_metadata, ImageFrame, ImageMetadata};
