//! Network infrastructure for the host application.
//!
//! # Sub-modules
//!
//! - **`link`** – The WebSocket connection to one device.  Owns the socket,
//!   the heartbeat deadline, and the I/O task that drives the protocol state
//!   machine.
//!
//! - **`discovery`** – Finds MaixCAM boards on the LAN by repeatedly asking
//!   every interface for `_ssh._tcp.local` over mDNS.
//!
//! - **`mdns`** – The small DNS packet encoder/decoder `discovery` needs.

pub mod discovery;
pub mod link;
pub mod mdns;
