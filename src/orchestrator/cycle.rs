//! System mode and stage machinery for the decision cycle.

use serde::{Deserialize, Serialize};

/// Top-level system state. Cycles only run in `Running`; `EmergencyStop`
/// is one-way until an operator resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Idle,
    Running,
    Paused,
    EmergencyStop,
}

impl SystemMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Idle => "idle",
            SystemMode::Running => "running",
            SystemMode::Paused => "paused",
            SystemMode::EmergencyStop => "emergency_stop",
        }
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    RegimeDetection,
    FactorDiscovery,
    Backtesting,
    RiskAssessment,
    Decision,
    Execution,
    Learning,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::RegimeDetection,
        Stage::FactorDiscovery,
        Stage::Backtesting,
        Stage::RiskAssessment,
        Stage::Decision,
        Stage::Execution,
        Stage::Learning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RegimeDetection => "regime_detection",
            Stage::FactorDiscovery => "factor_discovery",
            Stage::Backtesting => "backtesting",
            Stage::RiskAssessment => "risk_assessment",
            Stage::Decision => "decision",
            Stage::Execution => "execution",
            Stage::Learning => "learning",
        }
    }

    /// Execution is the only stage with an external side effect; it gets
    /// exactly one attempt.
    pub fn retryable(&self) -> bool {
        !matches!(self, Stage::Execution)
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// All stages ran, orders may or may not have been submitted.
    Completed,
    /// No signal worth acting on; skipped straight to learning.
    StoodAside,
    /// The risk guard rejected the proposal; no orders.
    Vetoed,
    /// A hard limit fired; the system is in emergency stop.
    Halted,
    /// A stage failed past its retry budget, or recovery closed the cycle.
    Aborted,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::StoodAside => "stood_aside",
            Disposition::Vetoed => "vetoed",
            Disposition::Halted => "halted",
            Disposition::Aborted => "aborted",
        }
    }
}
