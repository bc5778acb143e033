use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod clock;
mod controller;
mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use controller::{AccuracyController, ControllerConfig, RelaxationPolicy};
pub use store::{InMemoryStatStore, StatStore, StoreError};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum AccuracyError {
    #[error("invalid sample: {0}")]
    InvalidSample(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Company,
    Office,
    Mission,
    User,
}

impl ContextType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Office => "office",
            Self::Mission => "mission",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "company" => Some(Self::Company),
            "office" => Some(Self::Office),
            "mission" => Some(Self::Mission),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

impl Display for ContextType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope key of one accuracy policy: `(context_type, context_id, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextKey {
    pub context_type: ContextType,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ContextKey {
    #[must_use]
    pub fn new(context_type: ContextType, context_id: Option<&str>, user_id: Option<&str>) -> Self {
        Self {
            context_type,
            context_id: context_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
        }
    }

    /// Validate identifier shape for this scope.
    ///
    /// # Errors
    /// Returns a message when an identifier is blank, or a `user` scope has no `user_id`.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("context_id", &self.context_id), ("user_id", &self.user_id)] {
            if value.as_deref().is_some_and(|id| id.trim().is_empty()) {
                return Err(format!("{name} MUST be non-blank when provided"));
            }
        }

        if self.context_type == ContextType::User && self.user_id.is_none() {
            return Err("user_id MUST be provided for context_type=user".to_string());
        }

        Ok(())
    }

    /// Unambiguous text encoding of the full key, NULL ids included.
    #[must_use]
    pub fn canonical(&self) -> String {
        serde_json::json!([self.context_type.as_str(), self.context_id, self.user_id]).to_string()
    }
}

impl Display for ContextKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.context_type,
            self.context_id.as_deref().unwrap_or("-"),
            self.user_id.as_deref().unwrap_or("-")
        )
    }
}

/// One reported geolocation measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl Sample {
    #[must_use]
    pub fn new(accuracy: f64, observed_at: OffsetDateTime) -> Self {
        Self { accuracy, altitude: None, heading: None, speed: None, observed_at }
    }

    /// Validate the decision-relevant part of the sample.
    ///
    /// # Errors
    /// Returns [`AccuracyError::InvalidSample`] when accuracy is negative or not finite.
    pub fn validate(&self) -> Result<(), AccuracyError> {
        if !self.accuracy.is_finite() {
            return Err(AccuracyError::InvalidSample("accuracy MUST be finite".to_string()));
        }
        if self.accuracy < 0.0 {
            return Err(AccuracyError::InvalidSample("accuracy MUST be >= 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccuracyStat {
    pub context: ContextKey,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub total_samples: u64,
    pub average_accuracy: f64,
    pub baseline_accuracy: Option<f64>,
    pub temporary_accuracy: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub temporary_expiration: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AccuracyStat {
    /// Zeroed record for a context seen for the first time.
    #[must_use]
    pub fn new(context: ContextKey, now: OffsetDateTime) -> Self {
        Self {
            context,
            success_streak: 0,
            failure_streak: 0,
            total_samples: 0,
            average_accuracy: 0.0,
            baseline_accuracy: None,
            temporary_accuracy: None,
            temporary_expiration: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Temporary threshold still in force at `at`, if any.
    #[must_use]
    pub fn active_temporary(&self, at: OffsetDateTime) -> Option<f64> {
        match (self.temporary_accuracy, self.temporary_expiration) {
            (Some(accuracy), Some(expiration)) if expiration > at => Some(accuracy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    WithinBaseline,
    WithinTemporaryOverride,
    WithinCeiling,
    ExceedsThreshold,
}

impl DecisionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WithinBaseline => "within_baseline",
            Self::WithinTemporaryOverride => "within_temporary_override",
            Self::WithinCeiling => "within_ceiling",
            Self::ExceedsThreshold => "exceeds_threshold",
        }
    }
}

/// Policy change made by one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    RelaxationGranted {
        temporary_accuracy: f64,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    BaselineTightened {
        previous: Option<f64>,
        baseline_accuracy: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub accepted: bool,
    pub effective_threshold_used: f64,
    pub reason: DecisionReason,
    #[serde(default)]
    pub adjustment: Option<Adjustment>,
}
