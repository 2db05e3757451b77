//! Transport abstractions for P2P signaling.
//!
//! Signaling endpoints talk to each other only through a publish/subscribe
//! broker. This crate defines the trait the endpoints need from such a broker
//! and ships in-process implementations for simulation and tests.

pub mod traits;
pub mod testing;

pub use traits::*;
pub use testing::*;
