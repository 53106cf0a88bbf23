//! Testing utilities and mock implementations
//!
//! Mocks for the transport and authenticator collaborators, so the session
//! can be driven deterministically without a broker or token endpoint.

pub mod mocks;

pub use mocks::*;
