//! Scenario loading, scoring, the scenario × provider harness and result reporting.

pub mod report;
pub mod runner;
pub mod scenario;
pub mod score;
