use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use geo_accuracy_core::{
    AccuracyController, AccuracyError, AccuracyStat, Adjustment, Clock, ContextKey, Decision,
    Sample, StatStore, StoreError, SystemClock,
};
use geo_accuracy_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStatStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

mod gate;
mod settings;

pub use gate::{CeilingRule, GeofenceGate, StaticCeilings};
pub use settings::{AccuracySettings, SettingsError};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CheckInError {
    #[error("invalid context: {0}")]
    InvalidContext(String),
    #[error("invalid sample: {0}")]
    InvalidSample(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("no accuracy ceiling configured for {0}")]
    CeilingUnavailable(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CheckInError {
    /// True when the caller can fix the request; false for infrastructure failures.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidContext(_) => "invalid_context",
            Self::InvalidSample(_) => "invalid_sample",
            Self::InvalidConfig(_) => "invalid_config",
            Self::CeilingUnavailable(_) => "ceiling_unavailable",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<AccuracyError> for CheckInError {
    fn from(err: AccuracyError) -> Self {
        match err {
            AccuracyError::InvalidSample(message) => Self::InvalidSample(message),
            AccuracyError::InvalidConfig(message) => Self::InvalidConfig(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleInput {
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub observed_at: Option<OffsetDateTime>,
}

impl SampleInput {
    #[must_use]
    pub fn accuracy(accuracy: f64) -> Self {
        Self { accuracy, altitude: None, heading: None, speed: None, observed_at: None }
    }

    fn into_sample(self, now: OffsetDateTime) -> Sample {
        Sample {
            accuracy: self.accuracy,
            altitude: self.altitude,
            heading: self.heading,
            speed: self.speed,
            observed_at: self.observed_at.unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInRequest {
    pub context: ContextKey,
    pub sample: SampleInput,
    /// Tightens the tenant ceiling; used as-is only when no ceiling is configured.
    #[serde(default)]
    pub ceiling: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInOutcome {
    pub evaluation_id: Ulid,
    pub decision: Decision,
    pub stat: AccuracyStat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Check-in facade: gate lookup, then one serialized evaluate-and-persist per context.
pub struct AccuracyApi<S, G> {
    store: S,
    gate: G,
    controller: AccuracyController,
    clock: Arc<dyn Clock>,
}

impl<S, G> AccuracyApi<S, G>
where
    S: StatStore,
    G: GeofenceGate,
{
    #[must_use]
    pub fn new(store: S, gate: G, controller: AccuracyController) -> Self {
        Self::with_clock(store, gate, controller, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        store: S,
        gate: G,
        controller: AccuracyController,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, gate, controller, clock }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn controller(&self) -> &AccuracyController {
        &self.controller
    }

    /// Evaluate one check-in sample and persist the resulting stat.
    ///
    /// An accuracy rejection is a successful outcome with `decision.accepted == false`.
    ///
    /// # Errors
    /// Returns [`CheckInError`] for invalid input, a missing ceiling, or a storage failure.
    /// Nothing is persisted on error.
    pub fn check_in(&self, request: CheckInRequest) -> Result<CheckInOutcome, CheckInError> {
        let CheckInRequest { context, sample, ceiling } = request;
        context.validate().map_err(CheckInError::InvalidContext)?;

        let ceiling = self.resolve_ceiling(&context, ceiling)?;
        let now = self.clock.now();
        let sample = sample.into_sample(now);

        let evaluated = self.store.update(&context, |current| {
            let (decision, mut next) =
                self.controller.evaluate(&context, &sample, ceiling, current)?;
            next.updated_at = now;
            Ok::<_, CheckInError>(((decision, next.clone()), next))
        });

        let (decision, stat) = match evaluated {
            Ok(evaluated) => evaluated,
            Err(err) => {
                if let CheckInError::Storage(store_err) = &err {
                    warn!(context = %context, error = %store_err, "check-in storage failure");
                }
                return Err(err);
            }
        };

        let outcome = CheckInOutcome { evaluation_id: Ulid::new(), decision, stat };
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// The tenant ceiling from the gate, tightened by `requested` when one is supplied.
    /// A requested ceiling stands alone only when the gate has none for `context`.
    fn resolve_ceiling(
        &self,
        context: &ContextKey,
        requested: Option<f64>,
    ) -> Result<f64, CheckInError> {
        if let Some(requested) = requested {
            if !requested.is_finite() || requested <= 0.0 {
                return Err(CheckInError::InvalidConfig(
                    "requested ceiling MUST be finite and > 0".to_string(),
                ));
            }
        }
        match (self.gate.ceiling_for(context), requested) {
            (Some(configured), Some(requested)) => {
                if requested > configured {
                    debug!(
                        context = %context,
                        requested,
                        configured,
                        "requested ceiling exceeds tenant ceiling; using tenant ceiling"
                    );
                }
                Ok(requested.min(configured))
            }
            (Some(configured), None) => Ok(configured),
            (None, Some(requested)) => Ok(requested),
            (None, None) => Err(CheckInError::CeilingUnavailable(context.to_string())),
        }
    }

    /// Look up the current stat for a context without creating it.
    ///
    /// # Errors
    /// Returns [`CheckInError::InvalidContext`] or [`CheckInError::Storage`].
    pub fn stat_show(&self, context: &ContextKey) -> Result<Option<AccuracyStat>, CheckInError> {
        context.validate().map_err(CheckInError::InvalidContext)?;
        Ok(self.store.get(context)?)
    }
}

impl<G> AccuracyApi<SqliteStatStore, G>
where
    G: GeofenceGate,
{
    /// Open (without migrating) a `SQLite`-backed facade configured from `settings`.
    ///
    /// # Errors
    /// Returns an error when settings are invalid or the database cannot be opened.
    pub fn open_sqlite(db_path: &Path, settings: &AccuracySettings, gate: G) -> Result<Self> {
        let controller = AccuracyController::new(settings.controller.clone())?;
        let store = SqliteStatStore::open(db_path)?;
        Ok(Self::new(store, gate, controller))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let before = self.store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        self.store.migrate()?;
        let after = self.store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.store.integrity_check()
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_stats(&self) -> Result<Vec<AccuracyStat>> {
        self.store.list_stats()
    }
}

fn log_outcome(outcome: &CheckInOutcome) {
    let context = &outcome.stat.context;
    match &outcome.decision.adjustment {
        Some(Adjustment::RelaxationGranted { temporary_accuracy, expires_at }) => info!(
            context = %context,
            temporary_accuracy,
            expires_at = %expires_at,
            "granted temporary accuracy relaxation"
        ),
        Some(Adjustment::BaselineTightened { previous, baseline_accuracy }) => info!(
            context = %context,
            previous = ?previous,
            baseline_accuracy,
            "tightened accuracy baseline"
        ),
        None => {}
    }
    debug!(
        evaluation_id = %outcome.evaluation_id,
        context = %context,
        accepted = outcome.decision.accepted,
        threshold = outcome.decision.effective_threshold_used,
        reason = outcome.decision.reason.as_str(),
        "evaluated check-in sample"
    );
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use geo_accuracy_core::{
        ContextType, ControllerConfig, DecisionReason, FixedClock, InMemoryStatStore,
    };
    use time::Duration;

    use super::*;

    struct FailingStore;

    impl StatStore for FailingStore {
        fn get(&self, _key: &ContextKey) -> Result<Option<AccuracyStat>, StoreError> {
            Err(StoreError::Backend("database is locked".to_string()))
        }

        fn get_or_create(&self, _key: &ContextKey) -> Result<AccuracyStat, StoreError> {
            Err(StoreError::Backend("database is locked".to_string()))
        }

        fn save(&self, _stat: &AccuracyStat) -> Result<(), StoreError> {
            Err(StoreError::Backend("database is locked".to_string()))
        }

        fn update<T, E, F>(&self, _key: &ContextKey, _apply: F) -> Result<T, E>
        where
            F: FnOnce(&AccuracyStat) -> Result<(T, AccuracyStat), E>,
            E: From<StoreError>,
        {
            Err(StoreError::Backend("database is locked".to_string()).into())
        }
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("geo-accuracy-api-{}.sqlite3", Ulid::new()))
    }

    fn office() -> ContextKey {
        ContextKey::new(ContextType::Office, Some("hq"), Some("u-1"))
    }

    fn memory_api(clock: Arc<FixedClock>) -> AccuracyApi<InMemoryStatStore, StaticCeilings> {
        AccuracyApi::with_clock(
            InMemoryStatStore::with_clock(clock.clone()),
            StaticCeilings::with_default(100.0).rule(ContextType::Office, Some("hq"), 60.0),
            AccuracyController::default(),
            clock,
        )
    }

    fn request(accuracy: f64) -> CheckInRequest {
        CheckInRequest { context: office(), sample: SampleInput::accuracy(accuracy), ceiling: None }
    }

    // Test IDs: TAPI-001
    #[test]
    fn check_in_uses_gate_ceiling_and_persists_stat() -> Result<(), CheckInError> {
        let api = memory_api(Arc::new(FixedClock::new(fixture_time())));

        let outcome = api.check_in(request(55.0))?;
        assert!(outcome.decision.accepted);
        assert_eq!(outcome.decision.reason, DecisionReason::WithinCeiling);
        assert!((outcome.decision.effective_threshold_used - 60.0).abs() < f64::EPSILON);
        assert_eq!(outcome.stat.success_streak, 1);

        let rejected = api.check_in(request(75.0))?;
        assert!(!rejected.decision.accepted);
        assert_eq!(rejected.decision.reason, DecisionReason::ExceedsThreshold);
        assert_ne!(outcome.evaluation_id, rejected.evaluation_id);

        assert_eq!(api.stat_show(&office())?, Some(rejected.stat));
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn missing_observed_at_defaults_to_facade_clock() -> Result<(), CheckInError> {
        let clock = Arc::new(FixedClock::new(fixture_time()));
        let api = memory_api(clock.clone());
        let mut config = ControllerConfig::default();
        config.failure_streak_threshold = 1;
        let api = AccuracyApi::with_clock(
            api.store,
            api.gate,
            AccuracyController::new(config)?,
            clock.clone(),
        );

        let outcome = api.check_in(request(500.0))?;
        let Some(Adjustment::RelaxationGranted { expires_at, .. }) = outcome.decision.adjustment
        else {
            panic!("single failure should grant a relaxation with M=1");
        };
        assert_eq!(expires_at, fixture_time() + Duration::minutes(30));
        assert_eq!(outcome.stat.updated_at, fixture_time());
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn requested_ceiling_cannot_exceed_tenant_ceiling() -> Result<(), CheckInError> {
        let api = memory_api(Arc::new(FixedClock::new(fixture_time())));
        let mut req = request(5000.0);
        req.ceiling = Some(10_000.0);

        let outcome = api.check_in(req)?;
        assert!(!outcome.decision.accepted);
        assert_eq!(outcome.decision.reason, DecisionReason::ExceedsThreshold);
        assert!((outcome.decision.effective_threshold_used - 60.0).abs() < f64::EPSILON);

        let mut tighter = request(45.0);
        tighter.ceiling = Some(40.0);
        let outcome = api.check_in(tighter)?;
        assert!(!outcome.decision.accepted);
        assert!((outcome.decision.effective_threshold_used - 40.0).abs() < f64::EPSILON);

        let mut not_a_number = request(10.0);
        not_a_number.ceiling = Some(f64::NAN);
        assert!(matches!(api.check_in(not_a_number), Err(CheckInError::InvalidConfig(_))));
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn requested_ceiling_applies_when_gate_has_none() -> Result<(), CheckInError> {
        let api = AccuracyApi::new(
            InMemoryStatStore::new(),
            StaticCeilings::default().rule(ContextType::Company, Some("acme"), 30.0),
            AccuracyController::default(),
        );
        let mut req = request(90.0);
        req.ceiling = Some(95.0);

        let outcome = api.check_in(req)?;
        assert!(outcome.decision.accepted);
        assert!((outcome.decision.effective_threshold_used - 95.0).abs() < f64::EPSILON);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn client_errors_do_not_create_stats() {
        let api = AccuracyApi::new(
            InMemoryStatStore::new(),
            StaticCeilings::default(),
            AccuracyController::default(),
        );

        let missing = api.check_in(request(10.0));
        assert!(matches!(&missing, Err(CheckInError::CeilingUnavailable(_))));

        let mut negative = request(-3.0);
        negative.ceiling = Some(50.0);
        assert!(matches!(api.check_in(negative), Err(CheckInError::InvalidSample(_))));

        let mut zero_ceiling = request(3.0);
        zero_ceiling.ceiling = Some(0.0);
        assert!(matches!(api.check_in(zero_ceiling), Err(CheckInError::InvalidConfig(_))));

        let bad_context = CheckInRequest {
            context: ContextKey::new(ContextType::User, None, None),
            sample: SampleInput::accuracy(3.0),
            ceiling: Some(50.0),
        };
        let result = api.check_in(bad_context);
        assert!(matches!(&result, Err(CheckInError::InvalidContext(_))));
        assert!(result.as_ref().is_err_and(CheckInError::is_client_error));

        assert!(api.store().is_empty());
    }

    // Test IDs: TAPI-005
    #[test]
    fn storage_failures_are_not_client_errors() {
        let api = AccuracyApi::new(
            FailingStore,
            StaticCeilings::with_default(100.0),
            AccuracyController::default(),
        );

        let Err(err) = api.check_in(request(10.0)) else {
            panic!("failing store should surface an error");
        };
        assert!(matches!(err, CheckInError::Storage(StoreError::Backend(_))));
        assert!(!err.is_client_error());
        assert_eq!(err.kind(), "storage");
    }

    // Test IDs: TAPI-006
    #[test]
    fn request_json_accepts_minimal_and_full_samples() -> Result<(), serde_json::Error> {
        let minimal: CheckInRequest = serde_json::from_value(serde_json::json!({
            "context": {"context_type": "company", "context_id": "acme"},
            "sample": {"accuracy": 12.5}
        }))?;
        assert_eq!(minimal.context, ContextKey::new(ContextType::Company, Some("acme"), None));
        assert_eq!(minimal.sample.observed_at, None);
        assert_eq!(minimal.ceiling, None);

        let full: CheckInRequest = serde_json::from_value(serde_json::json!({
            "context": {"context_type": "user", "user_id": "u-3"},
            "sample": {
                "accuracy": 8.0,
                "altitude": 31.0,
                "heading": 270.0,
                "speed": 1.4,
                "observed_at": "2023-11-14T22:13:20Z"
            },
            "ceiling": 40.0
        }))?;
        assert_eq!(full.sample.observed_at, Some(fixture_time()));
        assert_eq!(full.sample.speed, Some(1.4));
        Ok(())
    }

    // Test IDs: TAPI-007, TCONC-005
    #[test]
    fn sqlite_facade_serializes_concurrent_check_ins() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccuracyApi::open_sqlite(
            &db_path,
            &AccuracySettings::default(),
            StaticCeilings::with_default(100.0),
        )?;

        let dry_run = api.migrate(true)?;
        assert_eq!(dry_run.would_apply_versions, vec![1]);
        assert_eq!(dry_run.after_version, None);
        let applied = api.migrate(false)?;
        assert_eq!(applied.up_to_date, Some(true));

        thread::scope(|scope| {
            for index in 0..5 {
                let api = &api;
                scope.spawn(move || {
                    for attempt in 0..12 {
                        let accuracy = if (index + attempt) % 5 == 0 { 250.0 } else { 30.0 };
                        if let Err(err) = api.check_in(request(accuracy)) {
                            panic!("check-in failed: {err}");
                        }
                    }
                });
            }
        });

        let Some(stat) = api.stat_show(&office())? else {
            panic!("stat should exist after concurrent check-ins");
        };
        assert_eq!(stat.total_samples, 60);
        assert_eq!(api.list_stats()?.len(), 1);
        assert!(api.integrity_check()?.quick_check_ok);

        drop(api);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
        Ok(())
    }
}
