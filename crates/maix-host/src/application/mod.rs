//! Application layer use cases for the host application.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure value types in `maix-core`) and the infrastructure (sockets, files).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "run this
//!   file on the device I am connected to").
//! - **Depend on abstractions** (traits) rather than concrete implementations,
//!   so the WebSocket link or the mDNS registry can be replaced by test fakes.
//!
//! # Sub-modules
//!
//! - **`link_state`** – The device protocol state machine.  Decides how a link
//!   reacts to every frame without doing any I/O itself.
//!
//! - **`session_manager`** – The registry of device links.  Guarantees at most
//!   one link per device and tracks the current session.
//!
//! - **`runner`** – Runs a source file on the current device and turns link
//!   events into a program output stream.

pub mod link_state;
pub mod runner;
pub mod session_manager;
