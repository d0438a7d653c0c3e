//! Operation model: duration and effect formulas per operation kind.
//!
//! All functions are pure. Inputs outside their domain are rejected with
//! [`ModelError::InvalidParameter`] instead of being clamped, so a zero
//! duration or a NaN value surfaces where it was produced.
//!
//! # Formulas (`FormulaModel`)
//!
//! ```text
//! extract_time   = 5 * (2.5 * required_skill * defense + 500) / (skill + 50) / speed_mult
//! restore_time   = 4.0 * extract_time
//! grow_time      = 3.2 * extract_time
//!
//! extract/thread = (100 - defense)/100 * (skill - (required_skill - 1))/skill / 240 * extract_mult
//! restore/thread = 0.05 * core_bonus
//! grow/thread    = exp(ln(min(1 + 0.03/defense, 1.0035)) * growth/100 * grow_mult * core_bonus)
//! grow(v, n)     = min(value_max, (v + n) * grow_per_thread^n)
//!
//! core_bonus     = 1 + (cores - 1) / 16
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::types::{ActorCapability, OperationKind, TargetSnapshot};

/// Errors produced by operation formulas.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Duration and effect formulas for the three operation kinds.
pub trait OperationModel {
    /// Wall-clock time one operation of `kind` takes when launched now.
    fn duration(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<Duration>;

    /// Effect of a single thread.
    ///
    /// - `Extract`: fraction of `value_current` removed (not chance-weighted).
    /// - `Grow`: multiplicative factor applied per thread.
    /// - `Restore`: defense points removed.
    fn effect_per_thread(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<f64>;

    /// Signed change in defense caused by one thread. Only `Restore` is negative.
    fn defense_delta_per_thread(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<f64>;

    /// Value after `threads` Grow threads land on a target holding `from_value`.
    fn grow_value(
        &self,
        target: &TargetSnapshot,
        actor: &ActorCapability,
        from_value: f64,
        threads: u32,
    ) -> ModelResult<f64> {
        check_value(from_value)?;
        let mult = self.effect_per_thread(OperationKind::Grow, target, actor)?;
        Ok((from_value * mult.powf(f64::from(threads))).min(target.value_max))
    }
}

/// Reject snapshots and capabilities outside the formulas' domain.
pub fn validate_inputs(target: &TargetSnapshot, actor: &ActorCapability) -> ModelResult<()> {
    let non_negative = [
        ("value_current", target.value_current),
        ("value_max", target.value_max),
        ("defense_current", target.defense_current),
        ("defense_min", target.defense_min),
        ("growth_factor", target.growth_factor),
        ("required_skill", target.required_skill),
        ("extract_mult", actor.extract_mult),
        ("grow_mult", actor.grow_mult),
    ];
    for (name, value) in non_negative {
        if !value.is_finite() || value < 0.0 {
            return Err(ModelError::InvalidParameter(format!(
                "{name} must be finite and >= 0, got {value}"
            )));
        }
    }

    let chance = target.extract_success_chance;
    if !(0.0..=1.0).contains(&chance) {
        return Err(ModelError::InvalidParameter(format!(
            "extract_success_chance must be in 0..=1, got {chance}"
        )));
    }
    if !actor.skill.is_finite() || actor.skill <= 0.0 {
        return Err(ModelError::InvalidParameter(format!(
            "skill must be > 0, got {}",
            actor.skill
        )));
    }
    if !actor.speed_mult.is_finite() || actor.speed_mult <= 0.0 {
        return Err(ModelError::InvalidParameter(format!(
            "speed_mult must be > 0, got {}",
            actor.speed_mult
        )));
    }
    if actor.cores == 0 {
        return Err(ModelError::InvalidParameter("cores must be >= 1".to_string()));
    }
    Ok(())
}

fn check_value(value: f64) -> ModelResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ModelError::InvalidParameter(format!(
            "value must be finite and >= 0, got {value}"
        )));
    }
    Ok(())
}

fn positive_duration(secs: f64) -> ModelResult<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ModelError::InvalidParameter(format!(
            "computed duration must be > 0, got {secs}s"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

// ── FormulaModel ───────────────────────────────────────────────────

/// Platform formulas for time, extraction, growth, and defense.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaModel {
    pub restore_time_ratio: f64,
    pub grow_time_ratio: f64,
    pub extract_defense_per_thread: f64,
    pub grow_defense_per_thread: f64,
    pub restore_per_thread: f64,
}

impl Default for FormulaModel {
    fn default() -> Self {
        Self {
            restore_time_ratio: 4.0,
            grow_time_ratio: 3.2,
            extract_defense_per_thread: 0.002,
            grow_defense_per_thread: 0.004,
            restore_per_thread: 0.05,
        }
    }
}

impl FormulaModel {
    fn core_bonus(actor: &ActorCapability) -> f64 {
        1.0 + f64::from(actor.cores.saturating_sub(1)) / 16.0
    }

    fn extract_secs(target: &TargetSnapshot, actor: &ActorCapability) -> f64 {
        let difficulty = target.required_skill * target.defense_current.max(target.defense_min);
        5.0 * (2.5 * difficulty + 500.0) / (actor.skill + 50.0) / actor.speed_mult
    }
}

impl OperationModel for FormulaModel {
    fn duration(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<Duration> {
        validate_inputs(target, actor)?;
        let base = Self::extract_secs(target, actor);
        let secs = match kind {
            OperationKind::Extract => base,
            OperationKind::Restore => base * self.restore_time_ratio,
            OperationKind::Grow => base * self.grow_time_ratio,
        };
        positive_duration(secs)
    }

    fn effect_per_thread(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<f64> {
        validate_inputs(target, actor)?;
        let defense = target.defense_current.max(target.defense_min);
        match kind {
            OperationKind::Extract => {
                if actor.skill < target.required_skill {
                    return Ok(0.0);
                }
                let defense_factor = ((100.0 - defense) / 100.0).max(0.0);
                let skill_factor = (actor.skill - (target.required_skill - 1.0)) / actor.skill;
                Ok((defense_factor * skill_factor / 240.0 * actor.extract_mult).clamp(0.0, 1.0))
            }
            OperationKind::Restore => Ok(self.restore_per_thread * Self::core_bonus(actor)),
            OperationKind::Grow => {
                // 0.03 / 0.0 is +inf, which the cap absorbs.
                let base = (1.0 + 0.03 / defense).min(1.0035);
                let exponent = base.ln()
                    * (target.growth_factor / 100.0)
                    * actor.grow_mult
                    * Self::core_bonus(actor);
                Ok(exponent.exp())
            }
        }
    }

    fn defense_delta_per_thread(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<f64> {
        match kind {
            OperationKind::Extract => Ok(self.extract_defense_per_thread),
            OperationKind::Grow => Ok(self.grow_defense_per_thread),
            OperationKind::Restore => {
                Ok(-self.effect_per_thread(OperationKind::Restore, target, actor)?)
            }
        }
    }

    fn grow_value(
        &self,
        target: &TargetSnapshot,
        actor: &ActorCapability,
        from_value: f64,
        threads: u32,
    ) -> ModelResult<f64> {
        check_value(from_value)?;
        if threads == 0 {
            return Ok(from_value.min(target.value_max));
        }
        let mult = self.effect_per_thread(OperationKind::Grow, target, actor)?;
        // Each thread seeds one unit so an emptied target can recover.
        let seeded = from_value + f64::from(threads);
        Ok((seeded * mult.powf(f64::from(threads))).min(target.value_max))
    }
}

// ── ConstantModel ──────────────────────────────────────────────────

/// Fixed per-thread rates, independent of target state and capability.
///
/// Useful for platforms that publish flat rates and for exercising the
/// planner with exact numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantModel {
    pub extract_per_thread: f64,
    pub restore_per_thread: f64,
    pub grow_per_thread: f64,
    pub extract_defense_per_thread: f64,
    pub grow_defense_per_thread: f64,
    pub extract_time: Duration,
    pub restore_time: Duration,
    pub grow_time: Duration,
}

impl Default for ConstantModel {
    fn default() -> Self {
        Self {
            extract_per_thread: 0.01,
            restore_per_thread: 0.05,
            grow_per_thread: 1.05,
            extract_defense_per_thread: 0.002,
            grow_defense_per_thread: 0.004,
            extract_time: Duration::from_secs(10),
            restore_time: Duration::from_secs(40),
            grow_time: Duration::from_secs(32),
        }
    }
}

impl OperationModel for ConstantModel {
    fn duration(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<Duration> {
        validate_inputs(target, actor)?;
        let duration = match kind {
            OperationKind::Extract => self.extract_time,
            OperationKind::Restore => self.restore_time,
            OperationKind::Grow => self.grow_time,
        };
        if duration.is_zero() {
            return Err(ModelError::InvalidParameter(format!("{kind} duration is zero")));
        }
        Ok(duration)
    }

    fn effect_per_thread(
        &self,
        kind: OperationKind,
        target: &TargetSnapshot,
        actor: &ActorCapability,
    ) -> ModelResult<f64> {
        validate_inputs(target, actor)?;
        Ok(match kind {
            OperationKind::Extract => self.extract_per_thread,
            OperationKind::Restore => self.restore_per_thread,
            OperationKind::Grow => self.grow_per_thread,
        })
    }

    fn defense_delta_per_thread(
        &self,
        kind: OperationKind,
        _target: &TargetSnapshot,
        _actor: &ActorCapability,
    ) -> ModelResult<f64> {
        Ok(match kind {
            OperationKind::Extract => self.extract_defense_per_thread,
            OperationKind::Grow => self.grow_defense_per_thread,
            OperationKind::Restore => -self.restore_per_thread,
        })
    }
}
