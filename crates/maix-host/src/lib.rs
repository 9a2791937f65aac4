//! maix-host library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::link_state::{LinkError, LinkEvent, LinkState};
pub use application::runner::{ProgramRunner, RunnerError, RunnerEvent};
pub use application::session_manager::{ConnectTarget, DeviceLink, SessionManager};
pub use infrastructure::services::HostServices;
