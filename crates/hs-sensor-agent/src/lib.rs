//! Library crate for the publisher binary.
//!
//! Re-exports the modules so external crates (e.g. `hs-e2e-tests`) can
//! drive the publisher loop against a mock broker.

pub mod config;
pub mod publisher;
