//! Multi-agent trading decision pipeline.
//!
//! A cycle walks a fixed stage graph: regime detection, factor discovery,
//! backtesting, risk assessment, decision, execution, learning. Every stage
//! commit is durable before the next stage starts, so a crash mid-cycle
//! resumes (or aborts) cleanly instead of re-running side effects.

pub mod agent;
pub mod broker;
pub mod config;
pub mod data;
pub mod error;
pub mod learning;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod portfolio;
pub mod risk;
