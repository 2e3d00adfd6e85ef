//! Deterministic scenario harness for the apiary kernel.
//!
//! Small, self-contained agent populations (ping-pong rally, broadcast
//! fan-out, alarm chains, a first-price auction) run under the simulated
//! clock and assert their own outcomes. The CLI in `main.rs` drives them;
//! the same runners double as executable documentation for embedders.

pub mod agents;
pub mod scenarios;

pub use scenarios::{ScenarioId, ScenarioResult, ScenarioRunner};
