use thiserror::Error;

/// Typed failures the orchestrator maps to cycle disposition.
///
/// Transient errors are retried with backoff; aborts end the cycle without
/// side effects; halts flip the whole system into emergency stop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient failure in {stage}: {reason}")]
    TransientStage { stage: &'static str, reason: String },

    #[error("stage {stage} aborted: {reason}")]
    StageAbort { stage: &'static str, reason: String },

    #[error("risk violation ({rule}): value {value:.4} breaches limit {limit:.4}")]
    RiskViolation { rule: String, value: f64, limit: f64 },

    #[error("system halted: {0}")]
    SystemHalted(String),

    #[error("invalid transition: {op} while {mode}")]
    InvalidTransition { op: &'static str, mode: String },

    #[error("cycle already in flight")]
    AlreadyRunning,

    #[error("duplicate result for cycle {cycle_id} stage {stage}")]
    DuplicateStageResult { cycle_id: String, stage: String },

    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("memory store: {0}")]
    Memory(#[from] rusqlite::Error),

    #[error("wal: {0}")]
    Wal(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the orchestrator may retry the failed stage.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientStage { .. } | PipelineError::DataUnavailable(_)
        )
    }

    /// Exit code for the control surface: 1 for operator errors,
    /// 2 when the system is (or just went) halted.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::SystemHalted(_) | PipelineError::RiskViolation { .. } => 2,
            _ => 1,
        }
    }
}
