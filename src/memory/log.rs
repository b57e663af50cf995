//! Durable log tier: sqlite-backed, append-mostly. Rows within a cycle are
//! ordered by rowid, so reading a cycle partition back yields insertion
//! order exactly.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Severity {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            3 => Severity::Critical,
            2 => Severity::High,
            1 => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Loss,
    StandAside,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Loss => "loss",
            Outcome::StandAside => "stand_aside",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "win" => Outcome::Win,
            "loss" => Outcome::Loss,
            _ => Outcome::StandAside,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub cycle_id: String,
    pub regime: String,
    pub factor: Option<String>,
    pub predicted_return: f64,
    pub realized_return: f64,
    pub prediction_error: f64,
    pub outcome: Outcome,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub cycle_id: String,
    pub severity: Severity,
    pub rule: String,
    pub description: String,
    pub ts: u64,
}

#[derive(Debug, Clone)]
pub struct FactorScore {
    pub factor: String,
    pub score: f64,
    pub samples: u64,
    pub loss_streak: u32,
    pub excluded: bool,
    pub updated_ts: u64,
}

#[derive(Debug, Clone)]
pub struct StageRow {
    pub cycle_id: String,
    pub stage: String,
    pub agent: String,
    pub payload: Value,
    pub ts: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LearningSummary {
    pub total: u64,
    pub wins: u64,
    pub losses: u64,
    pub stand_asides: u64,
    pub success_rate: f64,
    pub avg_abs_error: f64,
}

pub struct DurableLog {
    conn: Connection,
}

impl DurableLog {
    pub fn open(path: &str) -> Result<Self> {
        let mut log = Self {
            conn: Connection::open(path)?,
        };
        log.init()?;
        Ok(log)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS cycles (
                cycle_id TEXT PRIMARY KEY,
                started_ts INTEGER NOT NULL,
                finished_ts INTEGER,
                disposition TEXT
            );
            CREATE TABLE IF NOT EXISTS stage_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                agent TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts INTEGER NOT NULL,
                UNIQUE(cycle_id, stage)
            );
            CREATE TABLE IF NOT EXISTS learning_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL UNIQUE,
                regime TEXT NOT NULL,
                factor TEXT,
                predicted_return REAL NOT NULL,
                realized_return REAL NOT NULL,
                prediction_error REAL NOT NULL,
                outcome TEXT NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                severity INTEGER NOT NULL,
                rule TEXT NOT NULL,
                description TEXT NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS factor_scores (
                factor TEXT PRIMARY KEY,
                score REAL NOT NULL,
                samples INTEGER NOT NULL,
                loss_streak INTEGER NOT NULL,
                excluded INTEGER NOT NULL,
                updated_ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_ts INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    // =========================================================================
    // Cycles and stage results
    // =========================================================================

    pub fn record_cycle_start(&mut self, cycle_id: &str, ts: u64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO cycles (cycle_id, started_ts) VALUES (?1, ?2)",
            params![cycle_id, ts as i64],
        )?;
        Ok(())
    }

    pub fn record_cycle_end(&mut self, cycle_id: &str, ts: u64, disposition: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE cycles SET finished_ts = ?2, disposition = ?3 WHERE cycle_id = ?1",
            params![cycle_id, ts as i64, disposition],
        )?;
        Ok(())
    }

    /// Append one stage result. The UNIQUE(cycle_id, stage) constraint makes
    /// duplicate commits an error, never a silent overwrite.
    pub fn append_stage_result(
        &mut self,
        cycle_id: &str,
        stage: &str,
        agent: &str,
        payload: &Value,
        ts: u64,
    ) -> Result<()> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO stage_results (cycle_id, stage, agent, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![cycle_id, stage, agent, payload.to_string(), ts as i64],
        )?;
        if n == 0 {
            return Err(anyhow!(
                "duplicate stage result for cycle {} stage {}",
                cycle_id,
                stage
            ));
        }
        Ok(())
    }

    /// Stage results for one cycle, in insertion order.
    pub fn stage_results(&self, cycle_id: &str) -> Result<Vec<StageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, stage, agent, payload, ts FROM stage_results
             WHERE cycle_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![cycle_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (cycle_id, stage, agent, payload, ts) = row?;
            out.push(StageRow {
                cycle_id,
                stage,
                agent,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                ts: ts as u64,
            });
        }
        Ok(out)
    }

    pub fn cycles_run(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cycles", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    // =========================================================================
    // Learning records
    // =========================================================================

    pub fn append_learning_record(&mut self, rec: &LearningRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO learning_records
             (cycle_id, regime, factor, predicted_return, realized_return, prediction_error, outcome, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.cycle_id,
                rec.regime,
                rec.factor,
                rec.predicted_return,
                rec.realized_return,
                rec.prediction_error,
                rec.outcome.as_str(),
                rec.ts as i64
            ],
        )?;
        Ok(())
    }

    pub fn recent_learning_records(&self, limit: usize) -> Result<Vec<LearningRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, regime, factor, predicted_return, realized_return,
                    prediction_error, outcome, ts
             FROM learning_records ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LearningRecord {
                cycle_id: row.get(0)?,
                regime: row.get(1)?,
                factor: row.get(2)?,
                predicted_return: row.get(3)?,
                realized_return: row.get(4)?,
                prediction_error: row.get(5)?,
                outcome: Outcome::from_str(&row.get::<_, String>(6)?),
                ts: row.get::<_, i64>(7)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn learning_summary(&self) -> Result<LearningSummary> {
        let (total, wins, losses, stand_asides, avg_abs_error): (i64, i64, i64, i64, Option<f64>) =
            self.conn.query_row(
                "SELECT COUNT(*),
                        SUM(CASE WHEN outcome = 'win' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN outcome = 'loss' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN outcome = 'stand_aside' THEN 1 ELSE 0 END),
                        AVG(ABS(prediction_error))
                 FROM learning_records",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        row.get(4)?,
                    ))
                },
            )?;
        let settled = wins + losses;
        Ok(LearningSummary {
            total: total as u64,
            wins: wins as u64,
            losses: losses as u64,
            stand_asides: stand_asides as u64,
            success_rate: if settled > 0 {
                wins as f64 / settled as f64
            } else {
                0.0
            },
            avg_abs_error: avg_abs_error.unwrap_or(0.0),
        })
    }

    // =========================================================================
    // Risk events
    // =========================================================================

    pub fn append_risk_event(&mut self, event: &RiskEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO risk_events (cycle_id, severity, rule, description, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.cycle_id,
                event.severity.as_i64(),
                event.rule,
                event.description,
                event.ts as i64
            ],
        )?;
        Ok(())
    }

    /// Most recent events at or above the given severity.
    pub fn risk_events(&self, min_severity: Severity, limit: usize) -> Result<Vec<RiskEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle_id, severity, rule, description, ts FROM risk_events
             WHERE severity >= ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![min_severity.as_i64(), limit as i64], |row| {
            Ok(RiskEvent {
                cycle_id: row.get(0)?,
                severity: Severity::from_i64(row.get(1)?),
                rule: row.get(2)?,
                description: row.get(3)?,
                ts: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Factor scores
    // =========================================================================

    pub fn factor_score(&self, factor: &str) -> Result<Option<FactorScore>> {
        let row = self
            .conn
            .query_row(
                "SELECT factor, score, samples, loss_streak, excluded, updated_ts
                 FROM factor_scores WHERE factor = ?1",
                params![factor],
                |row| {
                    Ok(FactorScore {
                        factor: row.get(0)?,
                        score: row.get(1)?,
                        samples: row.get::<_, i64>(2)? as u64,
                        loss_streak: row.get::<_, i64>(3)? as u32,
                        excluded: row.get::<_, i64>(4)? != 0,
                        updated_ts: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_factor_score(&mut self, score: &FactorScore) -> Result<()> {
        self.conn.execute(
            "INSERT INTO factor_scores (factor, score, samples, loss_streak, excluded, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(factor) DO UPDATE SET
                score = excluded.score,
                samples = excluded.samples,
                loss_streak = excluded.loss_streak,
                excluded = excluded.excluded,
                updated_ts = excluded.updated_ts",
            params![
                score.factor,
                score.score,
                score.samples as i64,
                score.loss_streak as i64,
                score.excluded as i64,
                score.updated_ts as i64
            ],
        )?;
        Ok(())
    }

    pub fn all_factor_scores(&self) -> Result<Vec<FactorScore>> {
        let mut stmt = self.conn.prepare(
            "SELECT factor, score, samples, loss_streak, excluded, updated_ts
             FROM factor_scores ORDER BY score DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FactorScore {
                factor: row.get(0)?,
                score: row.get(1)?,
                samples: row.get::<_, i64>(2)? as u64,
                loss_streak: row.get::<_, i64>(3)? as u32,
                excluded: row.get::<_, i64>(4)? != 0,
                updated_ts: row.get::<_, i64>(5)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn excluded_factors(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT factor FROM factor_scores WHERE excluded = 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // =========================================================================
    // Durable key-value (portfolio snapshot and friends)
    // =========================================================================

    pub fn kv_put(&mut self, key: &str, value: &Value, ts: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ts = excluded.updated_ts",
            params![key, value.to_string(), ts as i64],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(row.and_then(|s| serde_json::from_str(&s).ok()))
    }
}
