use std::collections::HashSet;

use geo_accuracy_core::{ContextKey, ContextType};
use serde::{Deserialize, Serialize};

/// Source of the tenant-configured static ceiling for a context.
pub trait GeofenceGate: Send + Sync {
    /// Maximum acceptable accuracy in meters, or `None` when the tenant configured nothing.
    fn ceiling_for(&self, context: &ContextKey) -> Option<f64>;
}

impl<F> GeofenceGate for F
where
    F: Fn(&ContextKey) -> Option<f64> + Send + Sync,
{
    fn ceiling_for(&self, context: &ContextKey) -> Option<f64> {
        self(context)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CeilingRule {
    pub context_type: ContextType,
    #[serde(default)]
    pub context_id: Option<String>,
    pub ceiling: f64,
}

/// Ceilings from configuration: exact `(type, id)` rule, then type-wide rule, then default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StaticCeilings {
    pub default_ceiling: Option<f64>,
    pub rules: Vec<CeilingRule>,
}

impl StaticCeilings {
    #[must_use]
    pub fn with_default(default_ceiling: f64) -> Self {
        Self { default_ceiling: Some(default_ceiling), rules: Vec::new() }
    }

    #[must_use]
    pub fn rule(
        mut self,
        context_type: ContextType,
        context_id: Option<&str>,
        ceiling: f64,
    ) -> Self {
        self.rules.push(CeilingRule {
            context_type,
            context_id: context_id.map(str::to_string),
            ceiling,
        });
        self
    }

    /// Check ceilings are positive and rules are unambiguous.
    ///
    /// # Errors
    /// Returns a message naming the first offending rule.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ceiling) = self.default_ceiling {
            if !valid_ceiling(ceiling) {
                return Err(format!("default_ceiling MUST be finite and > 0, got {ceiling}"));
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            let scope = format!(
                "{}:{}",
                rule.context_type,
                rule.context_id.as_deref().unwrap_or("*")
            );
            if rule.context_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
                return Err(format!("ceiling rule {scope} has a blank context_id"));
            }
            if !valid_ceiling(rule.ceiling) {
                return Err(format!("ceiling rule {scope} MUST be finite and > 0"));
            }
            if !seen.insert(scope.clone()) {
                return Err(format!("duplicate ceiling rule for {scope}"));
            }
        }
        Ok(())
    }
}

impl GeofenceGate for StaticCeilings {
    fn ceiling_for(&self, context: &ContextKey) -> Option<f64> {
        let exact = self.rules.iter().find(|rule| {
            rule.context_type == context.context_type
                && rule.context_id.is_some()
                && rule.context_id == context.context_id
        });
        let type_wide = || {
            self.rules
                .iter()
                .find(|rule| rule.context_type == context.context_type && rule.context_id.is_none())
        };

        exact.or_else(type_wide).map(|rule| rule.ceiling).or(self.default_ceiling)
    }
}

fn valid_ceiling(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
