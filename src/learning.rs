//! Feedback loop: reconcile what a cycle predicted against what happened,
//! and keep bounded rolling scores per factor so persistent losers get
//! excluded from discovery.

use anyhow::Result;

use crate::config::now_ts;
use crate::memory::{DurableLog, FactorScore, LearningRecord, Outcome};

/// Reward scale: a realized move of this size counts as a full win or loss.
const FULL_REWARD_RETURN: f64 = 0.05;

pub struct LearningLoop {
    decay: f64,
    exclusion_streak: u32,
}

impl LearningLoop {
    pub fn new(decay: f64, exclusion_streak: u32) -> Self {
        Self {
            decay: decay.clamp(0.0, 1.0),
            exclusion_streak,
        }
    }

    /// Build the learning record for a settled (or stood-aside) cycle.
    /// Stand-asides are recorded with a null action so prediction
    /// calibration still accumulates on quiet cycles.
    pub fn reconcile(
        &self,
        cycle_id: &str,
        regime: &str,
        factor: Option<&str>,
        predicted_return: f64,
        realized_return: f64,
        stood_aside: bool,
    ) -> LearningRecord {
        let outcome = if stood_aside {
            Outcome::StandAside
        } else if realized_return > 0.0 {
            Outcome::Win
        } else {
            Outcome::Loss
        };
        LearningRecord {
            cycle_id: cycle_id.to_string(),
            regime: regime.to_string(),
            factor: factor.map(|f| f.to_string()),
            predicted_return,
            realized_return,
            prediction_error: realized_return - predicted_return,
            outcome,
            ts: now_ts(),
        }
    }

    /// Persist the record and fold its result into the factor's rolling
    /// score: `score' = decay * score + (1 - decay) * reward`, clamped to
    /// [-1, 1]. A loss streak at the threshold flags the factor excluded.
    pub fn apply(&self, log: &mut DurableLog, rec: &LearningRecord) -> Result<()> {
        log.append_learning_record(rec)?;

        let factor = match (&rec.factor, rec.outcome) {
            (Some(f), Outcome::Win) | (Some(f), Outcome::Loss) => f,
            _ => return Ok(()),
        };

        let prev = log.factor_score(factor)?.unwrap_or(FactorScore {
            factor: factor.clone(),
            score: 0.0,
            samples: 0,
            loss_streak: 0,
            excluded: false,
            updated_ts: 0,
        });

        let reward = (rec.realized_return / FULL_REWARD_RETURN).clamp(-1.0, 1.0);
        let score = (self.decay * prev.score + (1.0 - self.decay) * reward).clamp(-1.0, 1.0);
        let loss_streak = if rec.outcome == Outcome::Loss {
            prev.loss_streak + 1
        } else {
            0
        };

        log.upsert_factor_score(&FactorScore {
            factor: factor.clone(),
            score,
            samples: prev.samples + 1,
            loss_streak,
            excluded: prev.excluded || loss_streak >= self.exclusion_streak,
            updated_ts: now_ts(),
        })?;
        Ok(())
    }
}
