//! End-to-end scenarios for hello-sensor.
//!
//! Test-only crate: everything lives under `tests/`. The scenarios wire
//! the agent's publisher loop, the connection manager and its offline
//! queue to the in-memory `MockBroker` and drive them on a paused clock.
