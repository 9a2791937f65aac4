//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration file from the
//! platform-appropriate directory, writes it back, and fills in defaults when
//! the file does not exist yet (first run).  Nothing about sessions or
//! discovered devices is ever persisted.

pub mod config;
