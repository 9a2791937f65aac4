//! Application layer for maix-frame-hub.
//!
//! The [`FrameStore`] decides *what* each consumer receives and when.  It
//! knows nothing about HTTP; the infrastructure layer adapts its channels to
//! responses and WebSocket messages.

pub mod frame_store;

pub use frame_store::{ConsumerId, FrameStore, StreamHandle};
