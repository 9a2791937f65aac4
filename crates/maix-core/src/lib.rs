//! # maix-core
//!
//! Shared library for MaixLink containing the device link wire codec, the
//! command table, and the device domain types.
//!
//! This crate is used by both the host application and the frame hub.
//! It has zero dependencies on OS APIs, sockets, or async runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! MaixLink lets a development machine (the "host") talk to a MaixCAM camera
//! board (the "device") over the local network: push a Python program, watch
//! its output, and look at the camera frames it produces.
//!
//! This crate (`maix-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the device link.  Every WebSocket
//!   binary message carries exactly one frame: a magic marker, a length, a
//!   command byte, a payload, and a one-byte checksum.
//!
//! - **`domain`** – Pure value types with no I/O: who a device is
//!   ([`DeviceIdentity`]) and what it reports about itself
//!   ([`DeviceMetadata`]).

pub mod domain;
pub mod protocol;

pub use domain::device::{parse_ipv4, DeviceIdentity, DeviceMetadata, ValidationError};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::messages::{Command, ExitStatus, Frame, ImageFormat, Payload};
