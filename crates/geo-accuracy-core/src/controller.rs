use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{AccuracyError, AccuracyStat, Adjustment, ContextKey, Decision, DecisionReason, Sample};

const MAX_RELAXATION_WINDOW_SECONDS: u32 = 7 * 24 * 60 * 60;

/// How loose a granted temporary threshold is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RelaxationPolicy {
    /// Relax straight to the tenant ceiling.
    Ceiling,
    /// Move `fraction` of the way from the current effective threshold to the ceiling.
    Interpolate { fraction: f64 },
}

impl RelaxationPolicy {
    fn relaxed_threshold(self, effective: f64, ceiling: f64) -> f64 {
        let relaxed = match self {
            Self::Ceiling => ceiling,
            Self::Interpolate { fraction } => effective + fraction * (ceiling - effective),
        };
        relaxed.min(ceiling)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub success_streak_threshold: u32,
    pub failure_streak_threshold: u32,
    pub relaxation_window_seconds: u32,
    pub baseline_floor: f64,
    pub tightening_rate: f64,
    pub relaxation: RelaxationPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            success_streak_threshold: 5,
            failure_streak_threshold: 5,
            relaxation_window_seconds: 30 * 60,
            baseline_floor: 10.0,
            tightening_rate: 0.5,
            relaxation: RelaxationPolicy::Ceiling,
        }
    }
}

impl ControllerConfig {
    /// Check every tuning constant against its allowed range.
    ///
    /// # Errors
    /// Returns [`AccuracyError::InvalidConfig`] naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), AccuracyError> {
        if self.success_streak_threshold == 0 {
            return Err(invalid_config("success_streak_threshold MUST be >= 1"));
        }
        if self.failure_streak_threshold == 0 {
            return Err(invalid_config("failure_streak_threshold MUST be >= 1"));
        }
        if !(1..=MAX_RELAXATION_WINDOW_SECONDS).contains(&self.relaxation_window_seconds) {
            return Err(invalid_config(&format!(
                "relaxation_window_seconds MUST be in [1, {MAX_RELAXATION_WINDOW_SECONDS}]"
            )));
        }
        if !self.baseline_floor.is_finite() || self.baseline_floor < 0.0 {
            return Err(invalid_config("baseline_floor MUST be finite and >= 0"));
        }
        if !unit_interval(self.tightening_rate) {
            return Err(invalid_config("tightening_rate MUST be in (0.0, 1.0]"));
        }
        if let RelaxationPolicy::Interpolate { fraction } = self.relaxation {
            if !unit_interval(fraction) {
                return Err(invalid_config("relaxation fraction MUST be in (0.0, 1.0]"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn relaxation_window(&self) -> Duration {
        Duration::seconds(i64::from(self.relaxation_window_seconds))
    }
}

/// Pure accept/reject policy with self-tuning thresholds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccuracyController {
    config: ControllerConfig,
}

impl AccuracyController {
    /// Build a controller from validated tuning constants.
    ///
    /// # Errors
    /// Returns [`AccuracyError::InvalidConfig`] when `config` fails validation.
    pub fn new(config: ControllerConfig) -> Result<Self, AccuracyError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Decide whether `sample` is acceptable for `context` and compute the next stat.
    ///
    /// The returned stat carries `context` as its key and keeps `current.updated_at`;
    /// refreshing lifecycle timestamps is the store's job.
    ///
    /// # Errors
    /// Returns [`AccuracyError::InvalidConfig`] for a non-positive or non-finite ceiling and
    /// [`AccuracyError::InvalidSample`] for negative or non-finite accuracy. No stat is produced
    /// on error.
    pub fn evaluate(
        &self,
        context: &ContextKey,
        sample: &Sample,
        ceiling: f64,
        current: &AccuracyStat,
    ) -> Result<(Decision, AccuracyStat), AccuracyError> {
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(invalid_config("ceiling MUST be finite and > 0"));
        }
        sample.validate()?;

        let observed_at = sample.observed_at;
        let (threshold, within_reason) = effective_threshold(current, ceiling, observed_at);
        let accepted = sample.accuracy <= threshold;

        let mut next = current.clone();
        next.context = context.clone();
        if next.active_temporary(observed_at).is_none() {
            next.temporary_accuracy = None;
            next.temporary_expiration = None;
        }
        next.total_samples = current.total_samples.saturating_add(1);
        next.average_accuracy =
            incremental_mean(current.average_accuracy, sample.accuracy, next.total_samples);

        let adjustment = if accepted {
            next.success_streak = current.success_streak.saturating_add(1);
            next.failure_streak = 0;
            self.tighten_baseline(&mut next, ceiling)
        } else {
            next.failure_streak = current.failure_streak.saturating_add(1);
            next.success_streak = 0;
            self.grant_relaxation(&mut next, threshold, ceiling, observed_at)?
        };

        let decision = Decision {
            accepted,
            effective_threshold_used: threshold,
            reason: if accepted { within_reason } else { DecisionReason::ExceedsThreshold },
            adjustment,
        };
        Ok((decision, next))
    }

    fn tighten_baseline(&self, next: &mut AccuracyStat, ceiling: f64) -> Option<Adjustment> {
        if next.success_streak % self.config.success_streak_threshold != 0 {
            return None;
        }

        let average = next.average_accuracy;
        let reference = match next.baseline_accuracy {
            Some(baseline) if baseline > average => baseline,
            Some(_) => return None,
            None => ceiling,
        };
        let target = reference - self.config.tightening_rate * (reference - average);
        let tightened = target.max(self.config.baseline_floor).min(reference);
        if next.baseline_accuracy.is_some_and(|baseline| tightened >= baseline) {
            return None;
        }

        let previous = next.baseline_accuracy.replace(tightened);
        next.temporary_accuracy = None;
        next.temporary_expiration = None;
        Some(Adjustment::BaselineTightened { previous, baseline_accuracy: tightened })
    }

    fn grant_relaxation(
        &self,
        next: &mut AccuracyStat,
        threshold: f64,
        ceiling: f64,
        observed_at: OffsetDateTime,
    ) -> Result<Option<Adjustment>, AccuracyError> {
        if next.failure_streak < self.config.failure_streak_threshold {
            return Ok(None);
        }

        let temporary_accuracy = self.config.relaxation.relaxed_threshold(threshold, ceiling);
        let expires_at = observed_at.checked_add(self.config.relaxation_window()).ok_or_else(
            || AccuracyError::InvalidSample("observed_at is out of the representable range".into()),
        )?;

        next.temporary_accuracy = Some(temporary_accuracy);
        next.temporary_expiration = Some(expires_at);
        next.failure_streak = 0;
        Ok(Some(Adjustment::RelaxationGranted { temporary_accuracy, expires_at }))
    }
}

fn effective_threshold(
    stat: &AccuracyStat,
    ceiling: f64,
    at: OffsetDateTime,
) -> (f64, DecisionReason) {
    let learned = stat
        .active_temporary(at)
        .map(|temporary| (temporary, DecisionReason::WithinTemporaryOverride))
        .or_else(|| {
            stat.baseline_accuracy.map(|baseline| (baseline, DecisionReason::WithinBaseline))
        });
    match learned {
        // The ceiling binds whenever a learned threshold sits above it.
        Some((threshold, reason)) if threshold <= ceiling => (threshold, reason),
        _ => (ceiling, DecisionReason::WithinCeiling),
    }
}

#[allow(clippy::cast_precision_loss)]
fn incremental_mean(average: f64, value: f64, count: u64) -> f64 {
    average + (value - average) / count as f64
}

fn unit_interval(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= 1.0
}

fn invalid_config(message: &str) -> AccuracyError {
    AccuracyError::InvalidConfig(message.to_string())
}
