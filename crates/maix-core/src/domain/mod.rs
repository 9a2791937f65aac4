//! Domain entities for MaixLink.
//!
//! This module contains pure value types with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain**.  Domain code has **no** imports from
//! network libraries, async runtimes, or UI frameworks, so it can be compiled
//! and tested on any platform without any external setup.
//!
//! Here the domain is small: the identity of a device on the network and the
//! metadata it reports about itself after the handshake.  Outer layers (the
//! session manager, the discovery registry) build on these types, but these
//! types never depend on them.

/// Device identity, metadata, and address validation.
pub mod device;
